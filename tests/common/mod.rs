#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Value, json};

use kira_delivery::config::WorkflowTarget;
use kira_delivery::error::DeliveryError;
use kira_delivery::lims::{Artifact, LimsClient, StepRef, WorkflowStage};
use kira_delivery::store::{RecordStore, merge_patch_payload};

/// Document store kept in memory. Patches are applied the way the REST store
/// sends them, list fields appended.
#[derive(Default)]
pub struct MemoryStore {
    pub docs: Mutex<Vec<Value>>,
    pub gets: Mutex<usize>,
    pub patches: Mutex<Vec<(String, Value, Vec<String>)>>,
}

impl MemoryStore {
    pub fn with_docs(docs: Vec<Value>) -> Self {
        Self {
            docs: Mutex::new(docs),
            ..Self::default()
        }
    }

    pub fn sample(&self, sample_id: &str) -> Option<Value> {
        self.docs
            .lock()
            .unwrap()
            .iter()
            .find(|doc| doc["sample_id"] == sample_id)
            .cloned()
    }

    pub fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }
}

impl RecordStore for MemoryStore {
    fn get_document(
        &self,
        _collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, DeliveryError> {
        *self.gets.lock().unwrap() += 1;
        let docs = self.docs.lock().unwrap();
        let found = docs.iter().find(|doc| {
            filter
                .as_object()
                .map(|fields| fields.iter().all(|(key, value)| &doc[key] == value))
                .unwrap_or(false)
        });
        Ok(found.cloned())
    }

    fn patch_entry(
        &self,
        _collection: &str,
        id_field: &str,
        id: &str,
        payload: &Value,
        update_lists: &[&str],
    ) -> Result<(), DeliveryError> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .iter_mut()
            .find(|doc| doc[id_field] == id)
            .ok_or_else(|| DeliveryError::StoreStatus {
                status: 404,
                message: format!("no document {id}"),
            })?;
        let merged = merge_patch_payload(doc, payload, update_lists);
        if let (Some(target), Some(fields)) = (doc.as_object_mut(), merged.as_object()) {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        self.patches.lock().unwrap().push((
            id.to_string(),
            payload.clone(),
            update_lists.iter().map(|s| s.to_string()).collect(),
        ));
        Ok(())
    }
}

/// LIMS double that records every call by name.
#[derive(Default)]
pub struct ScriptedLims {
    pub barcodes: BTreeMap<String, Vec<String>>,
    pub queue: Vec<Artifact>,
    pub samples: Vec<Artifact>,
    pub fail_on: Option<&'static str>,
    pub calls: Mutex<Vec<String>>,
    pub routed: Mutex<Vec<Vec<String>>>,
    pub step_inputs: Mutex<Vec<Vec<String>>>,
}

impl ScriptedLims {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == name)
            .count()
    }

    fn call(&self, name: &'static str) -> Result<(), DeliveryError> {
        self.calls.lock().unwrap().push(name.to_string());
        if self.fail_on == Some(name) {
            return Err(DeliveryError::LimsStatus {
                status: 500,
                message: format!("{name} failed"),
            });
        }
        Ok(())
    }
}

impl LimsClient for ScriptedLims {
    fn samples_for_tube_barcode(&self, barcode: &str) -> Result<Vec<String>, DeliveryError> {
        self.call("samples_for_tube_barcode")?;
        Ok(self.barcodes.get(barcode).cloned().unwrap_or_default())
    }

    fn workflow_stage(&self, _target: &WorkflowTarget) -> Result<WorkflowStage, DeliveryError> {
        self.call("workflow_stage")?;
        Ok(WorkflowStage {
            uri: "https://lims/api/v2/configuration/workflows/1/stages/7".to_string(),
            protocol_step_uri: "https://lims/api/v2/configuration/protocols/3/steps/42"
                .to_string(),
            queue_id: "42".to_string(),
        })
    }

    fn queued_artifacts(&self, _stage: &WorkflowStage) -> Result<Vec<Artifact>, DeliveryError> {
        self.call("queued_artifacts")?;
        Ok(self.queue.clone())
    }

    fn sample_artifacts(&self, sample_names: &[String]) -> Result<Vec<Artifact>, DeliveryError> {
        self.call("sample_artifacts")?;
        Ok(self
            .samples
            .iter()
            .filter(|artifact| sample_names.contains(&artifact.sample_name))
            .cloned()
            .collect())
    }

    fn route_artifacts(
        &self,
        artifacts: &[Artifact],
        _stage: &WorkflowStage,
    ) -> Result<(), DeliveryError> {
        self.call("route_artifacts")?;
        self.routed
            .lock()
            .unwrap()
            .push(artifacts.iter().map(|a| a.sample_name.clone()).collect());
        Ok(())
    }

    fn create_step(
        &self,
        _stage: &WorkflowStage,
        inputs: &[Artifact],
    ) -> Result<StepRef, DeliveryError> {
        self.call("create_step")?;
        self.step_inputs
            .lock()
            .unwrap()
            .push(inputs.iter().map(|a| a.sample_name.clone()).collect());
        Ok(step())
    }

    fn advance_step(&self, _step: &StepRef) -> Result<(), DeliveryError> {
        self.call("advance_step")
    }

    fn complete_next_actions(&self, _step: &StepRef) -> Result<(), DeliveryError> {
        self.call("complete_next_actions")
    }
}

pub fn artifact(sample_name: &str) -> Artifact {
    Artifact {
        uri: format!("https://lims/api/v2/artifacts/{sample_name}PA1"),
        limsid: format!("{sample_name}PA1"),
        sample_name: sample_name.to_string(),
    }
}

pub fn step() -> StepRef {
    StepRef {
        uri: "https://lims/api/v2/steps/24-1001".to_string(),
        limsid: "24-1001".to_string(),
    }
}

pub fn delivered(path: &str) -> Value {
    json!({ "file_path": path, "md5": "d41d8cd98f00b204e9800998ecf8427e", "size": 10 })
}

pub fn downloaded(path: &str) -> Value {
    json!({ "file_path": path, "user": "cust", "date": "08_09_2016_16:30:27", "size": 10 })
}

pub fn sample_doc(sample_id: &str, delivered_paths: &[&str], downloaded_paths: &[&str]) -> Value {
    json!({
        "sample_id": sample_id,
        "project_id": "proj1",
        "files_delivered": delivered_paths.iter().map(|p| delivered(p)).collect::<Vec<_>>(),
        "files_downloaded": downloaded_paths.iter().map(|p| downloaded(p)).collect::<Vec<_>>(),
    })
}

pub fn time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2016, 9, 8)
        .unwrap()
        .and_hms_opt(16, 30, 27)
        .unwrap()
}

pub const REPORT_HEADER: &str = "Aspera transfer report\nnode: delivery01\n\nfilters: none\n\n\
level,file_path,ssh_user,stopped_at,bytes_transferred\n";

/// A report row for a path given relative to the delivery root.
pub fn report_row(level: u8, relative_path: &str) -> String {
    format!("{level},/home/cust/{relative_path},cust,2016/09/08 16:30:27,10\n")
}
