use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::delivery::{list_delivered_files, sample_folders};
use crate::domain::{DeliveredFile, DownloadedFile, is_tube_barcode};
use crate::error::DeliveryError;
use crate::lims::LimsClient;
use crate::store::{FILES_DELIVERED, RecordStore, SAMPLE_ID_FIELD, SAMPLES, get_sample};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleManifest {
    pub sample_id: String,
    pub project_id: Option<String>,
    /// `None` until a stored or computed delivery is known.
    pub delivered: Option<BTreeSet<DeliveredFile>>,
    pub already_downloaded: BTreeSet<DownloadedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(SampleManifest),
    /// The record store has no document for this sample.
    NoData { sample_id: String },
}

pub struct ManifestResolver<S: RecordStore, L: LimsClient> {
    store: S,
    lims: L,
    delivery_root: Utf8PathBuf,
    tracked_extensions: Vec<String>,
}

impl<S: RecordStore, L: LimsClient> ManifestResolver<S, L> {
    pub fn new(
        store: S,
        lims: L,
        delivery_root: Utf8PathBuf,
        tracked_extensions: Vec<String>,
    ) -> Self {
        Self {
            store,
            lims,
            delivery_root,
            tracked_extensions,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lims(&self) -> &L {
        &self.lims
    }

    /// Maps a tube barcode to its sample name. Anything else, including a
    /// barcode with zero or several matches, is returned unchanged.
    pub fn canonical_sample_id(&self, sample_id: &str) -> Result<String, DeliveryError> {
        if !is_tube_barcode(sample_id) {
            return Ok(sample_id.to_string());
        }
        let names = self.lims.samples_for_tube_barcode(sample_id)?;
        match names.as_slice() {
            [name] => {
                debug!(barcode = sample_id, sample = %name, "resolved tube barcode");
                Ok(name.clone())
            }
            _ => {
                warn!(
                    barcode = sample_id,
                    matches = names.len(),
                    "tube barcode did not resolve to a single sample; keeping it as sample id"
                );
                Ok(sample_id.to_string())
            }
        }
    }

    /// Reads the stored record only. A delivery that was never stored is left
    /// unresolved; see [`ManifestResolver::compute_delivered`].
    pub fn resolve(&self, sample_id: &str) -> Result<Resolution, DeliveryError> {
        let sample_id = self.canonical_sample_id(sample_id)?;
        let Some(doc) = get_sample(&self.store, &sample_id)? else {
            warn!(sample = %sample_id, "no data found for sample");
            return Ok(Resolution::NoData { sample_id });
        };

        let delivered = doc
            .files_delivered
            .filter(|files| !files.is_empty())
            .map(|files| files.into_iter().collect());

        Ok(Resolution::Found(SampleManifest {
            sample_id,
            project_id: doc.project_id,
            delivered,
            already_downloaded: doc.files_downloaded.unwrap_or_default().into_iter().collect(),
        }))
    }

    /// Scans the delivery folders of a sample and stores the result as its
    /// `files_delivered`. An empty scan is not stored.
    pub fn compute_delivered(
        &self,
        manifest: &SampleManifest,
    ) -> Result<Vec<DeliveredFile>, DeliveryError> {
        let sample_id = manifest.sample_id.as_str();
        let Some(project_id) = manifest.project_id.as_deref() else {
            warn!(
                sample = %sample_id,
                "sample has no project id; cannot locate delivery folders"
            );
            return Ok(Vec::new());
        };

        let mut files = Vec::new();
        for folder in sample_folders(&self.delivery_root, project_id, sample_id)? {
            files.extend(list_delivered_files(
                &self.delivery_root,
                &folder,
                &self.tracked_extensions,
            )?);
        }
        files.sort();
        files.dedup();

        if files.is_empty() {
            warn!(sample = %sample_id, "no delivered files found on disk");
            return Ok(files);
        }

        self.store.patch_entry(
            SAMPLES,
            SAMPLE_ID_FIELD,
            sample_id,
            &json!({ FILES_DELIVERED: &files }),
            &[],
        )?;
        info!(
            sample = %sample_id,
            files = files.len(),
            "recorded delivered files"
        );
        Ok(files)
    }
}
