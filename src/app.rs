use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::WorkflowTarget;
use crate::domain::TransferRecord;
use crate::error::DeliveryError;
use crate::ledger::SampleLedger;
use crate::lims::LimsClient;
use crate::manifest::{ManifestResolver, Resolution};
use crate::report::parse_transfer_report;
use crate::store::RecordStore;
use crate::workflow::{ConfirmationReport, ConfirmedSamples, WorkflowSynchronizer};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestResult {
    pub reports: Vec<String>,
    pub records: usize,
    pub attributed: usize,
    pub unattributable: Vec<String>,
    pub samples_updated: usize,
    pub files_recorded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Complete,
    Incomplete,
    /// The sample exists but no delivered files are known for it.
    NoManifest,
    /// The record store has no document for the sample.
    NoData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleCheck {
    pub requested_id: String,
    pub sample_id: String,
    pub status: CheckStatus,
    pub missing: Vec<String>,
}

impl SampleCheck {
    pub fn is_confirmed(&self) -> bool {
        self.status == CheckStatus::Complete
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    pub ingest: Option<IngestResult>,
    pub checks: Vec<SampleCheck>,
    pub confirmation: Option<ConfirmationReport>,
}

#[derive(Debug)]
enum SampleEntry {
    Known(SampleLedger),
    Unknown { sample_id: String },
}

/// Coordinates one reconciliation run. Sample ledgers live as long as the app.
pub struct App<S: RecordStore, L: LimsClient> {
    resolver: ManifestResolver<S, L>,
    workflow: WorkflowTarget,
    samples: BTreeMap<String, SampleEntry>,
    confirmed: ConfirmedSamples,
}

impl<S: RecordStore, L: LimsClient> App<S, L> {
    pub fn new(resolver: ManifestResolver<S, L>, workflow: WorkflowTarget) -> Self {
        Self {
            resolver,
            workflow,
            samples: BTreeMap::new(),
            confirmed: ConfirmedSamples::default(),
        }
    }

    pub fn resolver(&self) -> &ManifestResolver<S, L> {
        &self.resolver
    }

    pub fn confirmed(&self) -> &ConfirmedSamples {
        &self.confirmed
    }

    pub fn ledger(&self, sample_id: &str) -> Option<&SampleLedger> {
        match self.samples.get(sample_id)? {
            SampleEntry::Known(ledger) => Some(ledger),
            SampleEntry::Unknown { .. } => None,
        }
    }

    fn entry<'a>(
        samples: &'a mut BTreeMap<String, SampleEntry>,
        resolver: &ManifestResolver<S, L>,
        sample_id: &str,
    ) -> Result<&'a mut SampleEntry, DeliveryError> {
        match samples.entry(sample_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let entry = match resolver.resolve(sample_id)? {
                    Resolution::Found(manifest) => SampleEntry::Known(SampleLedger::new(manifest)),
                    Resolution::NoData { sample_id } => SampleEntry::Unknown { sample_id },
                };
                Ok(slot.insert(entry))
            }
        }
    }

    /// Reads every report, routes its records to sample ledgers and persists
    /// the new downloads once per sample. Only stored records are read while
    /// routing, so a malformed report aborts the call before anything is written.
    pub fn ingest<P: AsRef<Path>>(
        &mut self,
        reports: &[P],
    ) -> Result<IngestResult, DeliveryError> {
        let mut result = IngestResult::default();
        for report in reports {
            let report = report.as_ref();
            let records = parse_transfer_report(report)?;
            info!(report = %report.display(), records = records.len(), "read transfer report");
            result.reports.push(report.display().to_string());
            self.dispatch(records, &mut result)?;
        }

        let (samples_updated, files_recorded) = self.flush()?;
        result.samples_updated = samples_updated;
        result.files_recorded = files_recorded;
        Ok(result)
    }

    pub fn dispatch<I>(
        &mut self,
        records: I,
        result: &mut IngestResult,
    ) -> Result<(), DeliveryError>
    where
        I: IntoIterator<Item = TransferRecord>,
    {
        for record in records {
            result.records += 1;
            let Some(sample_id) = record.sample_id() else {
                warn!(path = %record.relative_path, "cannot detect sample name from path");
                result.unattributable.push(record.relative_path.clone());
                continue;
            };
            match Self::entry(&mut self.samples, &self.resolver, sample_id)? {
                SampleEntry::Known(ledger) => {
                    ledger.record_download(
                        &record.relative_path,
                        &record.operator,
                        record.completed_at,
                        record.bytes_transferred,
                    );
                    result.attributed += 1;
                }
                SampleEntry::Unknown { .. } => {
                    warn!(path = %record.relative_path, "no sample data for transferred file");
                    result.unattributable.push(record.relative_path.clone());
                }
            }
        }
        Ok(())
    }

    /// Returns (samples written, files written).
    pub fn flush(&mut self) -> Result<(usize, usize), DeliveryError> {
        let store = self.resolver.store();
        let mut samples = 0;
        let mut files = 0;
        for entry in self.samples.values_mut() {
            if let SampleEntry::Known(ledger) = entry {
                let written = ledger.flush(store)?;
                if written > 0 {
                    samples += 1;
                    files += written;
                }
            }
        }
        Ok((samples, files))
    }

    pub fn check(&mut self, sample_id: &str) -> Result<SampleCheck, DeliveryError> {
        let check = match Self::entry(&mut self.samples, &self.resolver, sample_id)? {
            SampleEntry::Unknown { sample_id: canonical } => SampleCheck {
                requested_id: sample_id.to_string(),
                sample_id: canonical.clone(),
                status: CheckStatus::NoData,
                missing: Vec::new(),
            },
            SampleEntry::Known(ledger) => {
                if ledger.resolve_delivered(&self.resolver)?.is_empty() {
                    warn!(sample = %ledger.sample_id(), "no delivered files known; not confirming");
                    SampleCheck {
                        requested_id: sample_id.to_string(),
                        sample_id: ledger.sample_id().to_string(),
                        status: CheckStatus::NoManifest,
                        missing: Vec::new(),
                    }
                } else {
                    let missing = ledger.missing_files();
                    let status = if missing.is_empty() {
                        CheckStatus::Complete
                    } else {
                        info!(
                            "Sample {} has not been fully downloaded: {} files missing",
                            ledger.sample_id(),
                            missing.len()
                        );
                        for path in &missing {
                            info!("    - {path}");
                        }
                        CheckStatus::Incomplete
                    };
                    SampleCheck {
                        requested_id: sample_id.to_string(),
                        sample_id: ledger.sample_id().to_string(),
                        status,
                        missing: missing.into_iter().collect(),
                    }
                }
            }
        };
        if check.is_confirmed() {
            self.confirmed.insert(&check.sample_id);
        }
        Ok(check)
    }

    /// Checks every sample currently waiting in the confirmation queue.
    pub fn check_all_queued(&mut self) -> Result<Vec<SampleCheck>, DeliveryError> {
        let lims = self.resolver.lims();
        let stage = lims.workflow_stage(&self.workflow)?;
        let names = lims
            .queued_artifacts(&stage)?
            .into_iter()
            .map(|artifact| artifact.sample_name)
            .collect::<BTreeSet<_>>();
        info!(samples = names.len(), "checking queued samples");
        names.iter().map(|name| self.check(name)).collect()
    }

    /// Drops the cached ledger state for a sample and reloads it from the store.
    /// Downloads observed but not flushed are kept.
    pub fn refresh(&mut self, sample_id: &str) -> Result<bool, DeliveryError> {
        if let Some(SampleEntry::Known(ledger)) = self.samples.get_mut(sample_id) {
            return ledger.refresh(&self.resolver);
        }
        self.samples.remove(sample_id);
        let entry = Self::entry(&mut self.samples, &self.resolver, sample_id)?;
        Ok(matches!(entry, SampleEntry::Known(_)))
    }

    pub fn confirm_in_lims(&mut self) -> Result<Option<ConfirmationReport>, DeliveryError> {
        let synchronizer = WorkflowSynchronizer::new(self.resolver.lims(), self.workflow.clone());
        synchronizer.confirm(&mut self.confirmed)
    }
}
