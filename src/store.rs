use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, IF_MATCH, USER_AGENT};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::RestApiSection;
use crate::domain::{DeliveredFile, DownloadedFile};
use crate::error::DeliveryError;

pub const SAMPLES: &str = "samples";
pub const SAMPLE_ID_FIELD: &str = "sample_id";
pub const FILES_DELIVERED: &str = "files_delivered";
pub const FILES_DOWNLOADED: &str = "files_downloaded";

pub trait RecordStore: Send + Sync {
    fn get_document(
        &self,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, DeliveryError>;

    /// Updates the document whose `id_field` equals `id`. Fields named in
    /// `update_lists` are appended to instead of replaced.
    fn patch_entry(
        &self,
        collection: &str,
        id_field: &str,
        id: &str,
        payload: &Value,
        update_lists: &[&str],
    ) -> Result<(), DeliveryError>;
}

impl<T: RecordStore + ?Sized> RecordStore for &T {
    fn get_document(
        &self,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, DeliveryError> {
        (**self).get_document(collection, filter)
    }

    fn patch_entry(
        &self,
        collection: &str,
        id_field: &str,
        id: &str,
        payload: &Value,
        update_lists: &[&str],
    ) -> Result<(), DeliveryError> {
        (**self).patch_entry(collection, id_field, id, payload, update_lists)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleDocument {
    pub sample_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub files_delivered: Option<Vec<DeliveredFile>>,
    #[serde(default)]
    pub files_downloaded: Option<Vec<DownloadedFile>>,
}

pub fn get_sample<S: RecordStore>(
    store: &S,
    sample_id: &str,
) -> Result<Option<SampleDocument>, DeliveryError> {
    let Some(doc) = store.get_document(SAMPLES, &json!({ SAMPLE_ID_FIELD: sample_id }))? else {
        return Ok(None);
    };
    serde_json::from_value(doc).map(Some).map_err(|err| {
        DeliveryError::StoreHttp(format!("invalid sample document {sample_id}: {err}"))
    })
}

/// Builds the body actually sent on patch: list fields carry existing entries first.
pub fn merge_patch_payload(existing: &Value, payload: &Value, update_lists: &[&str]) -> Value {
    let mut merged = Map::new();
    if let Some(fields) = payload.as_object() {
        for (key, value) in fields {
            let value = match (update_lists.contains(&key.as_str()), value) {
                (true, Value::Array(new_items)) => {
                    let mut items = existing
                        .get(key)
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    items.extend(new_items.iter().cloned());
                    Value::Array(items)
                }
                _ => value.clone(),
            };
            merged.insert(key.clone(), value);
        }
    }
    Value::Object(merged)
}

#[derive(Clone)]
pub struct RestRecordStore {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl RestRecordStore {
    pub fn new(config: &RestApiSection) -> Result<Self, DeliveryError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-delivery/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DeliveryError::StoreHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| DeliveryError::StoreHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn api_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, DeliveryError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(DeliveryError::StoreHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(response: Response) -> Result<Response, DeliveryError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "record store request failed".to_string());
        Err(DeliveryError::StoreStatus { status, message })
    }
}

impl RecordStore for RestRecordStore {
    fn get_document(
        &self,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, DeliveryError> {
        let url = self.api_url(collection);
        let filter = filter.to_string();
        debug!(%url, %filter, "record store query");
        let response = self.send_with_retries(|| {
            self.authorize(self.client.get(&url).query(&[("where", filter.as_str())]))
        })?;
        let body: Value = Self::handle_status(response)?
            .json()
            .map_err(|err| DeliveryError::StoreHttp(err.to_string()))?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .cloned())
    }

    fn patch_entry(
        &self,
        collection: &str,
        id_field: &str,
        id: &str,
        payload: &Value,
        update_lists: &[&str],
    ) -> Result<(), DeliveryError> {
        let doc = self
            .get_document(collection, &json!({ id_field: id }))?
            .ok_or_else(|| DeliveryError::StoreStatus {
                status: 404,
                message: format!("no {collection} document with {id_field}={id}"),
            })?;
        let internal_id = doc
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| DeliveryError::StoreHttp(format!("{collection} {id} has no _id")))?;
        let etag = doc.get("_etag").and_then(Value::as_str).unwrap_or_default();
        let body = merge_patch_payload(&doc, payload, update_lists);

        let url = format!("{}/{}", self.api_url(collection), internal_id);
        debug!(%url, "record store patch");
        let response = self
            .authorize(self.client.patch(&url).header(IF_MATCH, etag).json(&body))
            .send()
            .map_err(|err| DeliveryError::StoreHttp(err.to_string()))?;
        Self::handle_status(response)?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_fields_are_appended() {
        let existing = json!({
            "sample_id": "S1",
            "files_downloaded": [{"file_path": "a"}],
            "files_delivered": [{"file_path": "old"}]
        });
        let payload = json!({
            "files_downloaded": [{"file_path": "b"}],
            "files_delivered": [{"file_path": "new"}]
        });
        let merged = merge_patch_payload(&existing, &payload, &[FILES_DOWNLOADED]);
        assert_eq!(
            merged,
            json!({
                "files_downloaded": [{"file_path": "a"}, {"file_path": "b"}],
                "files_delivered": [{"file_path": "new"}]
            })
        );
    }

    #[test]
    fn sample_document_tolerates_nulls() {
        let doc: SampleDocument = serde_json::from_value(json!({
            "sample_id": "S1",
            "project_id": "P1",
            "files_delivered": null
        }))
        .unwrap();
        assert!(doc.files_delivered.is_none());
        assert!(doc.files_downloaded.is_none());
    }
}
