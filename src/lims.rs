use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::{Captures, Regex};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::debug;

use crate::config::{ClaritySection, WorkflowTarget};
use crate::error::DeliveryError;

pub const TUBE_BARCODE_UDF: &str = "2D Barcode";

static START_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:[\w-]+:)?([\w-]+)(?:\s[^>]*)?/?>").expect("hardcoded regex")
});

static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\s([\w:-]+)="([^"]*)""#).expect("hardcoded regex"));

// Open and close names are captured separately; callers check they agree.
static TEXT_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:[\w-]+:)?([\w-]+)(?:\s[^>]*)?>([^<]*)</(?:[\w-]+:)?([\w-]+)>")
        .expect("hardcoded regex")
});

static NEXT_ACTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<next-action\b[^>]*>").expect("hardcoded regex"));
static ACTION_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\saction="[^"]*""#).expect("hardcoded regex"));
static STEP_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\sstep-uri="[^"]*""#).expect("hardcoded regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub uri: String,
    pub limsid: String,
    pub sample_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStage {
    pub uri: String,
    pub protocol_step_uri: String,
    /// Queues share their id with the protocol step.
    pub queue_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRef {
    pub uri: String,
    pub limsid: String,
}

pub trait LimsClient: Send + Sync {
    /// Sample names of every analyte tagged with the given tube barcode.
    fn samples_for_tube_barcode(&self, barcode: &str) -> Result<Vec<String>, DeliveryError>;
    fn workflow_stage(&self, target: &WorkflowTarget) -> Result<WorkflowStage, DeliveryError>;
    fn queued_artifacts(&self, stage: &WorkflowStage) -> Result<Vec<Artifact>, DeliveryError>;
    fn sample_artifacts(&self, sample_names: &[String]) -> Result<Vec<Artifact>, DeliveryError>;
    fn route_artifacts(
        &self,
        artifacts: &[Artifact],
        stage: &WorkflowStage,
    ) -> Result<(), DeliveryError>;
    fn create_step(
        &self,
        stage: &WorkflowStage,
        inputs: &[Artifact],
    ) -> Result<StepRef, DeliveryError>;
    fn advance_step(&self, step: &StepRef) -> Result<(), DeliveryError>;
    /// Sets every pending next-action of the step to `complete` and saves them.
    fn complete_next_actions(&self, step: &StepRef) -> Result<(), DeliveryError>;
}

impl<T: LimsClient + ?Sized> LimsClient for &T {
    fn samples_for_tube_barcode(&self, barcode: &str) -> Result<Vec<String>, DeliveryError> {
        (**self).samples_for_tube_barcode(barcode)
    }

    fn workflow_stage(&self, target: &WorkflowTarget) -> Result<WorkflowStage, DeliveryError> {
        (**self).workflow_stage(target)
    }

    fn queued_artifacts(&self, stage: &WorkflowStage) -> Result<Vec<Artifact>, DeliveryError> {
        (**self).queued_artifacts(stage)
    }

    fn sample_artifacts(&self, sample_names: &[String]) -> Result<Vec<Artifact>, DeliveryError> {
        (**self).sample_artifacts(sample_names)
    }

    fn route_artifacts(
        &self,
        artifacts: &[Artifact],
        stage: &WorkflowStage,
    ) -> Result<(), DeliveryError> {
        (**self).route_artifacts(artifacts, stage)
    }

    fn create_step(
        &self,
        stage: &WorkflowStage,
        inputs: &[Artifact],
    ) -> Result<StepRef, DeliveryError> {
        (**self).create_step(stage, inputs)
    }

    fn advance_step(&self, step: &StepRef) -> Result<(), DeliveryError> {
        (**self).advance_step(step)
    }

    fn complete_next_actions(&self, step: &StepRef) -> Result<(), DeliveryError> {
        (**self).complete_next_actions(step)
    }
}

#[derive(Clone)]
pub struct ClarityHttpClient {
    client: Client,
    api_url: String,
    username: String,
    password: String,
}

impl ClarityHttpClient {
    pub fn new(config: &ClaritySection) -> Result<Self, DeliveryError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-delivery/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DeliveryError::LimsHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| DeliveryError::LimsHttp(err.to_string()))?;
        Ok(Self {
            client,
            api_url: format!("{}/api/v2", config.baseuri.trim_end_matches('/')),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    fn get_xml(&self, url: &str, query: &[(&str, &str)]) -> Result<String, DeliveryError> {
        debug!(%url, "lims get");
        let response = self.send_with_retries(|| {
            self.client
                .get(url)
                .query(query)
                .basic_auth(&self.username, Some(&self.password))
        })?;
        Self::handle_status(response)?
            .text()
            .map_err(|err| DeliveryError::LimsHttp(err.to_string()))
    }

    fn send_xml(&self, request: RequestBuilder, body: String) -> Result<String, DeliveryError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .map_err(|err| DeliveryError::LimsHttp(err.to_string()))?;
        Self::handle_status(response)?
            .text()
            .map_err(|err| DeliveryError::LimsHttp(err.to_string()))
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
                    return Err(DeliveryError::LimsHttp(err.to_string()));
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
            .unwrap_or_else(|_| "LIMS request failed".to_string());
        Err(DeliveryError::LimsStatus { status, message })
    }

    fn sample_name(&self, sample_uri: &str) -> Result<String, DeliveryError> {
        let xml = self.get_xml(sample_uri, &[])?;
        element_text(&xml, "name")
            .ok_or_else(|| DeliveryError::LimsResponse(format!("sample {sample_uri} has no name")))
    }

    fn artifact_samples(&self, artifact_uri: &str) -> Result<Vec<String>, DeliveryError> {
        let xml = self.get_xml(artifact_uri, &[])?;
        let mut names = Vec::new();
        for tag in start_tags(&xml, "sample") {
            if let Some(uri) = attr(&tag, "uri") {
                names.push(self.sample_name(&uri)?);
            }
        }
        Ok(names)
    }

    fn single_sample_artifact(&self, uri: &str, limsid: &str) -> Result<Artifact, DeliveryError> {
        let samples = self.artifact_samples(uri)?;
        match samples.as_slice() {
            [sample_name] => Ok(Artifact {
                uri: strip_state(uri),
                limsid: limsid.to_string(),
                sample_name: sample_name.clone(),
            }),
            _ => Err(DeliveryError::LimsResponse(format!(
                "artifact {limsid} carries {} samples, expected exactly one",
                samples.len()
            ))),
        }
    }

    fn named_child_uri(xml: &str, element: &str, name: &str) -> Option<String> {
        start_tags(xml, element)
            .iter()
            .find(|tag| attr(tag, "name").as_deref() == Some(name))
            .and_then(|tag| attr(tag, "uri"))
    }
}

impl LimsClient for ClarityHttpClient {
    fn samples_for_tube_barcode(&self, barcode: &str) -> Result<Vec<String>, DeliveryError> {
        let udf = format!("udf.{TUBE_BARCODE_UDF}");
        let xml = self.get_xml(
            &self.url("artifacts"),
            &[("type", "Analyte"), (udf.as_str(), barcode)],
        )?;
        let mut names = Vec::new();
        for tag in start_tags(&xml, "artifact") {
            if let Some(uri) = attr(&tag, "uri") {
                if let Some(name) = self.artifact_samples(&uri)?.into_iter().next() {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    fn workflow_stage(&self, target: &WorkflowTarget) -> Result<WorkflowStage, DeliveryError> {
        let workflows = self.get_xml(
            &self.url("configuration/workflows"),
            &[("name", target.workflow.as_str())],
        )?;
        let workflow_uri = Self::named_child_uri(&workflows, "workflow", &target.workflow)
            .ok_or_else(|| {
                DeliveryError::LimsResponse(format!("workflow {} not found", target.workflow))
            })?;
        let workflow = self.get_xml(&workflow_uri, &[])?;
        let stage_uri = Self::named_child_uri(&workflow, "stage", &target.stage).ok_or_else(|| {
            DeliveryError::LimsResponse(format!("stage {} not found", target.stage))
        })?;
        let stage = self.get_xml(&stage_uri, &[])?;
        let protocol_step_uri = start_tags(&stage, "step")
            .first()
            .and_then(|tag| attr(tag, "uri"))
            .ok_or_else(|| {
                DeliveryError::LimsResponse(format!("stage {} has no protocol step", target.stage))
            })?;
        let queue_id = last_segment(&protocol_step_uri).to_string();
        Ok(WorkflowStage {
            uri: stage_uri,
            protocol_step_uri,
            queue_id,
        })
    }

    fn queued_artifacts(&self, stage: &WorkflowStage) -> Result<Vec<Artifact>, DeliveryError> {
        let mut artifacts = Vec::new();
        let mut page = Some(self.url(&format!("queues/{}", stage.queue_id)));
        while let Some(url) = page.take() {
            let xml = self.get_xml(&url, &[])?;
            for tag in start_tags(&xml, "artifact") {
                let (Some(uri), Some(limsid)) = (attr(&tag, "uri"), attr(&tag, "limsid")) else {
                    continue;
                };
                artifacts.push(self.single_sample_artifact(&uri, &limsid)?);
            }
            page = start_tags(&xml, "next-page")
                .first()
                .and_then(|tag| attr(tag, "uri"));
        }
        Ok(artifacts)
    }

    fn sample_artifacts(&self, sample_names: &[String]) -> Result<Vec<Artifact>, DeliveryError> {
        if sample_names.is_empty() {
            return Ok(Vec::new());
        }
        let query = sample_names
            .iter()
            .map(|name| ("name", name.as_str()))
            .collect::<Vec<_>>();
        let xml = self.get_xml(&self.url("samples"), &query)?;
        let mut artifacts = Vec::new();
        for tag in start_tags(&xml, "sample") {
            let Some(uri) = attr(&tag, "uri") else {
                continue;
            };
            let sample = self.get_xml(&uri, &[])?;
            let sample_name = element_text(&sample, "name")
                .ok_or_else(|| DeliveryError::LimsResponse(format!("sample {uri} has no name")))?;
            let artifact = start_tags(&sample, "artifact")
                .into_iter()
                .next()
                .ok_or_else(|| {
                    DeliveryError::LimsResponse(format!("sample {sample_name} has no artifact"))
                })?;
            let (Some(artifact_uri), Some(limsid)) =
                (attr(&artifact, "uri"), attr(&artifact, "limsid"))
            else {
                return Err(DeliveryError::LimsResponse(format!(
                    "sample {sample_name} has an incomplete artifact link"
                )));
            };
            artifacts.push(Artifact {
                uri: strip_state(&artifact_uri),
                limsid,
                sample_name,
            });
        }
        Ok(artifacts)
    }

    fn route_artifacts(
        &self,
        artifacts: &[Artifact],
        stage: &WorkflowStage,
    ) -> Result<(), DeliveryError> {
        let body = routing_xml(artifacts, stage);
        self.send_xml(self.client.post(self.url("route/artifacts")), body)?;
        Ok(())
    }

    fn create_step(
        &self,
        stage: &WorkflowStage,
        inputs: &[Artifact],
    ) -> Result<StepRef, DeliveryError> {
        let body = step_creation_xml(stage, inputs);
        let xml = self.send_xml(self.client.post(self.url("steps")), body)?;
        let tag = start_tags(&xml, "step")
            .into_iter()
            .next()
            .ok_or_else(|| DeliveryError::LimsResponse("step creation returned no step".into()))?;
        let uri = attr(&tag, "uri")
            .ok_or_else(|| DeliveryError::LimsResponse("created step has no uri".into()))?;
        let limsid = attr(&tag, "limsid").unwrap_or_else(|| last_segment(&uri).to_string());
        Ok(StepRef { uri, limsid })
    }

    fn advance_step(&self, step: &StepRef) -> Result<(), DeliveryError> {
        let current = self.get_xml(&step.uri, &[])?;
        let url = format!("{}/advance", step.uri);
        self.send_xml(self.client.post(&url), current)?;
        Ok(())
    }

    fn complete_next_actions(&self, step: &StepRef) -> Result<(), DeliveryError> {
        let url = format!("{}/actions", step.uri);
        let actions = self.get_xml(&url, &[])?;
        let updated = complete_actions_xml(&actions);
        self.send_xml(self.client.put(&url), updated)?;
        Ok(())
    }
}

pub fn routing_xml(artifacts: &[Artifact], stage: &WorkflowStage) -> String {
    let mut body = String::from(r#"<rt:routing xmlns:rt="http://genologics.com/ri/routing">"#);
    body.push_str(&format!(r#"<assign stage-uri="{}">"#, xml_escape(&stage.uri)));
    for artifact in artifacts {
        body.push_str(&format!(r#"<artifact uri="{}"/>"#, xml_escape(&artifact.uri)));
    }
    body.push_str("</assign></rt:routing>");
    body
}

pub fn step_creation_xml(stage: &WorkflowStage, inputs: &[Artifact]) -> String {
    let mut body =
        String::from(r#"<tmp:step-creation xmlns:tmp="http://genologics.com/ri/step">"#);
    body.push_str(&format!(
        r#"<configuration uri="{}"/>"#,
        xml_escape(&stage.protocol_step_uri)
    ));
    body.push_str("<container-type>Tube</container-type><inputs>");
    for artifact in inputs {
        body.push_str(&format!(
            r#"<input uri="{}" replicates="1"/>"#,
            xml_escape(&artifact.uri)
        ));
    }
    body.push_str("</inputs></tmp:step-creation>");
    body
}

/// Rewrites every `next-action` to `complete`, dropping any step target.
pub fn complete_actions_xml(actions: &str) -> String {
    NEXT_ACTION
        .replace_all(actions, |caps: &Captures| {
            let tag = STEP_ATTR.replace_all(&caps[0], "");
            if ACTION_ATTR.is_match(&tag) {
                ACTION_ATTR
                    .replace(&tag, r#" action="complete""#)
                    .into_owned()
            } else {
                tag.replacen("<next-action", r#"<next-action action="complete""#, 1)
            }
        })
        .into_owned()
}

fn start_tags(xml: &str, element: &str) -> Vec<String> {
    START_TAG
        .captures_iter(xml)
        .filter(|caps| &caps[1] == element)
        .map(|caps| caps[0].to_string())
        .collect()
}

fn attr(tag: &str, name: &str) -> Option<String> {
    ATTRIBUTE
        .captures_iter(tag)
        .find(|caps| &caps[1] == name)
        .map(|caps| xml_unescape(&caps[2]))
}

fn element_text(xml: &str, element: &str) -> Option<String> {
    TEXT_ELEMENT
        .captures_iter(xml)
        .find(|caps| &caps[1] == element && &caps[3] == element)
        .map(|caps| xml_unescape(caps[2].trim()))
}

fn strip_state(uri: &str) -> String {
    uri.split('?').next().unwrap_or(uri).to_string()
}

fn last_segment(uri: &str) -> &str {
    uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri)
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
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
    fn next_actions_become_complete() {
        let xml = r#"<stp:actions xmlns:stp="http://genologics.com/ri/step"><next-actions><next-action artifact-uri="https://lims/api/v2/artifacts/A1" action="nextstep" step-uri="https://lims/api/v2/steps/9"/><next-action artifact-uri="https://lims/api/v2/artifacts/A2"/></next-actions></stp:actions>"#;
        let updated = complete_actions_xml(xml);
        assert_eq!(updated.matches(r#"action="complete""#).count(), 2);
        assert!(!updated.contains("step-uri"));
        assert!(!updated.contains("nextstep"));
        assert!(updated.contains(r#"artifact-uri="https://lims/api/v2/artifacts/A1""#));
    }

    #[test]
    fn attributes_are_read_from_prefixed_tags() {
        let xml = r#"<art:artifacts><artifact limsid="2-1" uri="https://lims/api/v2/artifacts/2-1?state=7"/><art:artifact uri="x&amp;y" limsid="2-2"></art:artifact></art:artifacts>"#;
        let tags = start_tags(xml, "artifact");
        assert_eq!(tags.len(), 2);
        assert_eq!(attr(&tags[0], "limsid").as_deref(), Some("2-1"));
        assert_eq!(
            strip_state(&attr(&tags[0], "uri").unwrap()),
            "https://lims/api/v2/artifacts/2-1"
        );
        assert_eq!(attr(&tags[1], "uri").as_deref(), Some("x&y"));
    }

    #[test]
    fn tag_names_must_match_exactly() {
        let xml = r#"<wkfcnf:workflow name="WF"><stages><stage name="Download" uri="https://lims/s/7"/></stages></wkfcnf:workflow>"#;
        assert_eq!(start_tags(xml, "stage").len(), 1);
        assert!(start_tags(xml, "stages").first().is_some_and(|tag| tag == "<stages>"));
        assert_eq!(
            ClarityHttpClient::named_child_uri(xml, "stage", "Download").as_deref(),
            Some("https://lims/s/7")
        );
        assert_eq!(element_text("<name>S1</other>", "name"), None);
        assert_eq!(
            element_text("<udf:field>x</udf:field><name>S2</name>", "name").as_deref(),
            Some("S2")
        );
    }

    #[test]
    fn element_text_and_segments() {
        let xml = "<smp:sample><name> S1 </name></smp:sample>";
        assert_eq!(element_text(xml, "name").as_deref(), Some("S1"));
        assert_eq!(
            last_segment("https://lims/api/v2/configuration/protocols/3/steps/12"),
            "12"
        );
    }

    #[test]
    fn routing_body_lists_artifacts() {
        let stage = WorkflowStage {
            uri: "https://lims/api/v2/configuration/workflows/1/stages/2".to_string(),
            protocol_step_uri: "https://lims/api/v2/configuration/protocols/1/steps/3".to_string(),
            queue_id: "3".to_string(),
        };
        let artifact = Artifact {
            uri: "https://lims/api/v2/artifacts/A1".to_string(),
            limsid: "A1".to_string(),
            sample_name: "S1".to_string(),
        };
        let body = routing_xml(std::slice::from_ref(&artifact), &stage);
        assert!(body.contains(r#"<assign stage-uri="https://lims/api/v2/configuration/workflows/1/stages/2">"#));
        assert!(body.contains(r#"<artifact uri="https://lims/api/v2/artifacts/A1"/>"#));

        let step = step_creation_xml(&stage, &[artifact]);
        assert!(step.contains(r#"<configuration uri="https://lims/api/v2/configuration/protocols/1/steps/3"/>"#));
        assert!(step.contains(r#"<input uri="https://lims/api/v2/artifacts/A1" replicates="1"/>"#));
    }
}
