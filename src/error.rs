use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DeliveryError {
    #[error("malformed transfer report {source_name} (line {line}): {message}")]
    #[diagnostic(help("the report is rejected as a whole; fix or re-export it and rerun"))]
    Format {
        source_name: String,
        line: usize,
        message: String,
    },

    #[error("missing config file kira-delivery.json")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("record store request failed: {0}")]
    StoreHttp(String),

    #[error("record store returned status {status}: {message}")]
    StoreStatus { status: u16, message: String },

    #[error("LIMS request failed: {0}")]
    LimsHttp(String),

    #[error("LIMS returned status {status}: {message}")]
    LimsStatus { status: u16, message: String },

    #[error("unexpected LIMS response: {0}")]
    LimsResponse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("missing checksum file for delivered file {0}")]
    MissingChecksum(String),

    #[error("invalid workflow transition: step {step} is already {phase}")]
    InvalidTransition { step: String, phase: String },
}

impl DeliveryError {
    pub fn format(source_name: &str, line: usize, message: impl Into<String>) -> Self {
        DeliveryError::Format {
            source_name: source_name.to_string(),
            line,
            message: message.into(),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(
            self,
            DeliveryError::StoreHttp(_)
                | DeliveryError::StoreStatus { .. }
                | DeliveryError::LimsHttp(_)
                | DeliveryError::LimsStatus { .. }
                | DeliveryError::LimsResponse(_)
        )
    }
}
