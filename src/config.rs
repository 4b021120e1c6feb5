use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::default_tracked_extensions;
use crate::error::DeliveryError;

pub const CONFIG_FILE_NAME: &str = "kira-delivery.json";

pub const DEFAULT_WORKFLOW_NAME: &str = "PostSeqLab EG 1.0 WF";
pub const DEFAULT_STAGE_NAME: &str = "Download Confirmation EG 1.0 ST";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub delivery: DeliverySection,
    pub rest_api: RestApiSection,
    pub clarity: ClaritySection,
    #[serde(default)]
    pub workflow: Option<WorkflowSection>,
    #[serde(default)]
    pub tracked_extensions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeliverySection {
    pub dest: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestApiSection {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaritySection {
    pub baseuri: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowTarget {
    pub workflow: String,
    pub stage: String,
}

impl Default for WorkflowTarget {
    fn default() -> Self {
        Self {
            workflow: DEFAULT_WORKFLOW_NAME.to_string(),
            stage: DEFAULT_STAGE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub delivery_root: Utf8PathBuf,
    pub rest_api: RestApiSection,
    pub clarity: ClaritySection,
    pub workflow: WorkflowTarget,
    pub tracked_extensions: Vec<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DeliveryError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::default_path().ok_or(DeliveryError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| DeliveryError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| DeliveryError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        BaseDirs::new()
            .map(|dirs| {
                dirs.home_dir()
                    .join(".config")
                    .join("kira-delivery")
                    .join("config.json")
            })
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, DeliveryError> {
        let dest = config.delivery.dest.trim();
        if dest.is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "delivery.dest must not be empty".to_string(),
            ));
        }
        if config.rest_api.url.trim().is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "rest_api.url must not be empty".to_string(),
            ));
        }
        if config.clarity.baseuri.trim().is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "clarity.baseuri must not be empty".to_string(),
            ));
        }

        let defaults = WorkflowTarget::default();
        let workflow = match config.workflow {
            Some(section) => WorkflowTarget {
                workflow: section.name.unwrap_or(defaults.workflow),
                stage: section.stage.unwrap_or(defaults.stage),
            },
            None => defaults,
        };

        let tracked_extensions = config
            .tracked_extensions
            .unwrap_or_else(default_tracked_extensions)
            .into_iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_string())
            .filter(|ext| !ext.is_empty())
            .collect::<Vec<_>>();
        if tracked_extensions.is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "tracked_extensions must list at least one extension".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            delivery_root: Utf8PathBuf::from(dest),
            rest_api: config.rest_api,
            clarity: config.clarity,
            workflow,
            tracked_extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn minimal() -> Config {
        serde_json::from_str(
            r#"{
                "delivery": {"dest": "/data/delivery"},
                "rest_api": {"url": "http://localhost:4999/api/0.1"},
                "clarity": {"baseuri": "https://lims", "username": "u", "password": "p"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let resolved = ConfigLoader::resolve_config(minimal()).unwrap();
        assert_eq!(resolved.delivery_root, Utf8PathBuf::from("/data/delivery"));
        assert_eq!(resolved.workflow, WorkflowTarget::default());
        assert_eq!(resolved.tracked_extensions, default_tracked_extensions());
    }

    #[test]
    fn empty_extension_list_is_rejected() {
        let mut config = minimal();
        config.tracked_extensions = Some(vec![" ".to_string()]);
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, DeliveryError::InvalidConfig(_));
    }
}
