use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDateTime;
use serde_json::json;
use tracing::info;

use crate::domain::{DeliveredFile, DownloadedFile};
use crate::error::DeliveryError;
use crate::lims::LimsClient;
use crate::manifest::{ManifestResolver, Resolution, SampleManifest};
use crate::store::{FILES_DOWNLOADED, RecordStore, SAMPLE_ID_FIELD, SAMPLES};

/// Per-sample reconciliation state for one run.
#[derive(Debug, Clone)]
pub struct SampleLedger {
    manifest: SampleManifest,
    newly_observed: Vec<DownloadedFile>,
}

impl SampleLedger {
    pub fn new(manifest: SampleManifest) -> Self {
        Self {
            manifest,
            newly_observed: Vec::new(),
        }
    }

    pub fn sample_id(&self) -> &str {
        &self.manifest.sample_id
    }

    /// The delivered set if it has been read or computed this run.
    pub fn delivered(&self) -> Option<&BTreeSet<DeliveredFile>> {
        self.manifest.delivered.as_ref()
    }

    /// Returns the delivered set, scanning and storing it on first use.
    /// The result is kept for the rest of the run, even when empty.
    pub fn resolve_delivered<S: RecordStore, L: LimsClient>(
        &mut self,
        resolver: &ManifestResolver<S, L>,
    ) -> Result<&BTreeSet<DeliveredFile>, DeliveryError> {
        let delivered = match self.manifest.delivered.take() {
            Some(delivered) => delivered,
            None => resolver
                .compute_delivered(&self.manifest)?
                .into_iter()
                .collect(),
        };
        Ok(&*self.manifest.delivered.insert(delivered))
    }

    pub fn already_downloaded(&self) -> &BTreeSet<DownloadedFile> {
        &self.manifest.already_downloaded
    }

    pub fn newly_observed(&self) -> &[DownloadedFile] {
        &self.newly_observed
    }

    /// Files outside the delivery are accepted; they can never be missing.
    pub fn record_download(&mut self, path: &str, user: &str, time: NaiveDateTime, size: u64) {
        self.newly_observed
            .push(DownloadedFile::new(path, user, time, size));
    }

    /// Observed downloads not yet persisted, one per path, in observation order.
    pub fn pending(&self) -> Vec<DownloadedFile> {
        let mut seen = HashSet::new();
        let known = &self.manifest.already_downloaded;
        self.newly_observed
            .iter()
            .filter(|file| !known.contains(file.relative_path.as_str()))
            .filter(|file| seen.insert(file.relative_path.as_str()))
            .cloned()
            .collect()
    }

    /// Appends pending downloads to the stored record. Returns how many were written.
    pub fn flush<S: RecordStore>(&mut self, store: &S) -> Result<usize, DeliveryError> {
        let new_files = self.pending();
        if new_files.is_empty() {
            self.newly_observed.clear();
            return Ok(0);
        }

        store.patch_entry(
            SAMPLES,
            SAMPLE_ID_FIELD,
            &self.manifest.sample_id,
            &json!({ FILES_DOWNLOADED: &new_files }),
            &[FILES_DOWNLOADED],
        )?;
        info!(
            sample = %self.manifest.sample_id,
            files = new_files.len(),
            "recorded downloaded files"
        );

        let written = new_files.len();
        self.manifest.already_downloaded.extend(new_files);
        self.newly_observed.clear();
        Ok(written)
    }

    /// Delivered paths not downloaded yet. Empty while the delivered set is
    /// unresolved.
    pub fn missing_files(&self) -> BTreeSet<String> {
        let downloaded: HashSet<&str> = self
            .manifest
            .already_downloaded
            .iter()
            .chain(self.newly_observed.iter())
            .map(|file| file.relative_path.as_str())
            .collect();
        self.manifest
            .delivered
            .iter()
            .flatten()
            .filter(|file| !downloaded.contains(file.relative_path.as_str()))
            .map(|file| file.relative_path.clone())
            .collect()
    }

    /// Vacuously true for an empty delivery; callers decide what that means.
    pub fn is_complete(&self) -> bool {
        self.missing_files().is_empty()
    }

    /// Re-reads the stored record, keeping downloads observed but not yet flushed.
    /// A delivery that is still not stored is resolved again on next use.
    /// Returns false, leaving the ledger untouched, if the record has disappeared.
    pub fn refresh<S: RecordStore, L: LimsClient>(
        &mut self,
        resolver: &ManifestResolver<S, L>,
    ) -> Result<bool, DeliveryError> {
        match resolver.resolve(&self.manifest.sample_id)? {
            Resolution::Found(manifest) => {
                self.manifest = manifest;
                Ok(true)
            }
            Resolution::NoData { .. } => Ok(false),
        }
    }
}
