use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_delivery::config::{Config, ConfigLoader, DEFAULT_STAGE_NAME};
use kira_delivery::error::DeliveryError;

#[test]
fn resolve_reads_explicit_path() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("delivery.json");
    fs::write(
        &path,
        r#"{
            "delivery": {"dest": "/gpfs/delivery"},
            "rest_api": {"url": "http://reporting:4999/api/0.1", "username": "svc", "password": "pw"},
            "clarity": {"baseuri": "https://clarity.example.org", "username": "apiuser", "password": "secret"},
            "workflow": {"name": "PostSeqLab EG 2.0 WF"},
            "tracked_extensions": [".fastq.gz", "bam"]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.delivery_root, Utf8PathBuf::from("/gpfs/delivery"));
    assert_eq!(resolved.rest_api.username.as_deref(), Some("svc"));
    assert_eq!(resolved.clarity.username, "apiuser");
    assert_eq!(resolved.workflow.workflow, "PostSeqLab EG 2.0 WF");
    assert_eq!(resolved.workflow.stage, DEFAULT_STAGE_NAME);
    assert_eq!(resolved.tracked_extensions, vec!["fastq.gz", "bam"]);
}

#[test]
fn unreadable_and_invalid_files_are_config_errors() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("missing.json");
    let err = ConfigLoader::resolve(missing.to_str()).unwrap_err();
    assert_matches!(err, DeliveryError::ConfigRead(_));

    let broken = temp.path().join("broken.json");
    fs::write(&broken, "{ \"delivery\": ").unwrap();
    let err = ConfigLoader::resolve(broken.to_str()).unwrap_err();
    assert_matches!(err, DeliveryError::ConfigParse(_));
}

#[test]
fn blank_delivery_root_is_rejected() {
    let config: Config = serde_json::from_str(
        r#"{
            "delivery": {"dest": "  "},
            "rest_api": {"url": "http://reporting:4999/api/0.1"},
            "clarity": {"baseuri": "https://clarity", "username": "u", "password": "p"}
        }"#,
    )
    .unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, DeliveryError::InvalidConfig(_));
}
