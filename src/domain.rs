use std::borrow::Borrow;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_TRACKED_EXTENSIONS: &[&str] = &["fastq.gz", "bam", "g.vcf.gz"];

pub const DOWNLOAD_DATE_FORMAT: &str = "%d_%m_%Y_%H:%M:%S";

pub const TUBE_BARCODE_PREFIX: &str = "FD";

pub fn default_tracked_extensions() -> Vec<String> {
    DEFAULT_TRACKED_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

pub fn is_tracked(path: &str, extensions: &[String]) -> bool {
    extensions.iter().any(|ext| path.ends_with(ext.as_str()))
}

pub fn is_tube_barcode(id: &str) -> bool {
    id.starts_with(TUBE_BARCODE_PREFIX)
}

/// Sample id carried by a delivered path (`project/batch/sample/...`).
pub fn sample_id_from_path(relative_path: &str) -> Option<&str> {
    relative_path
        .split('/')
        .nth(2)
        .filter(|segment| !segment.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub relative_path: String,
    pub operator: String,
    pub completed_at: NaiveDateTime,
    pub bytes_transferred: u64,
}

impl TransferRecord {
    pub fn sample_id(&self) -> Option<&str> {
        sample_id_from_path(&self.relative_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredFile {
    #[serde(rename = "file_path")]
    pub relative_path: String,
    #[serde(rename = "md5", default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(rename = "size", default, deserialize_with = "lenient_size")]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedFile {
    #[serde(rename = "file_path")]
    pub relative_path: String,
    #[serde(default)]
    pub user: String,
    #[serde(rename = "date", default)]
    pub downloaded_at: String,
    #[serde(rename = "size", default, deserialize_with = "lenient_size")]
    pub size_bytes: u64,
}

impl DownloadedFile {
    pub fn new(relative_path: &str, user: &str, time: NaiveDateTime, size_bytes: u64) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            user: user.to_string(),
            downloaded_at: time.format(DOWNLOAD_DATE_FORMAT).to_string(),
            size_bytes,
        }
    }
}

impl From<&TransferRecord> for DownloadedFile {
    fn from(record: &TransferRecord) -> Self {
        DownloadedFile::new(
            &record.relative_path,
            &record.operator,
            record.completed_at,
            record.bytes_transferred,
        )
    }
}

// File records take part in set operations by relative path only.
macro_rules! identity_by_path {
    ($ty:ty) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.relative_path == other.relative_path
            }
        }

        impl Eq for $ty {}

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.relative_path.as_str().hash(state);
            }
        }

        impl PartialOrd for $ty {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $ty {
            fn cmp(&self, other: &Self) -> Ordering {
                self.relative_path.cmp(&other.relative_path)
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.relative_path
            }
        }
    };
}

identity_by_path!(DeliveredFile);
identity_by_path!(DownloadedFile);

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Number(u64),
    Text(String),
    Null,
}

fn lenient_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(value) => Ok(value),
        SizeValue::Text(value) if value.trim().is_empty() => Ok(0),
        SizeValue::Text(value) => value
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid file size: {value}"))),
        SizeValue::Null => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn tracked_extensions_match_suffix() {
        let exts = default_tracked_extensions();
        assert!(is_tracked("p/b/s/s_R1.fastq.gz", &exts));
        assert!(is_tracked("p/b/s/s.g.vcf.gz", &exts));
        assert!(!is_tracked("p/b/s/s.fastq.gz.md5", &exts));
        assert!(!is_tracked("p/b/s/s.vcf.gz", &exts));
    }

    #[test]
    fn sample_id_is_third_segment() {
        assert_eq!(sample_id_from_path("proj/batch/S1/file.bam"), Some("S1"));
        assert_eq!(sample_id_from_path("proj/batch"), None);
        assert_eq!(sample_id_from_path("proj/batch//file.bam"), None);
    }

    #[test]
    fn downloaded_files_compare_by_path() {
        let time = NaiveDate::from_ymd_opt(2016, 9, 8)
            .unwrap()
            .and_hms_opt(16, 30, 27)
            .unwrap();
        let first = DownloadedFile::new("p/b/s/a.bam", "alice", time, 10);
        let again = DownloadedFile::new("p/b/s/a.bam", "bob", time, 99);
        assert_eq!(first, again);
        assert_eq!(first.downloaded_at, "08_09_2016_16:30:27");

        let set: BTreeSet<DownloadedFile> = [first, again].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert!(set.contains("p/b/s/a.bam"));
    }

    #[test]
    fn size_accepts_numbers_and_strings() {
        let files: Vec<DownloadedFile> = serde_json::from_str(
            r#"[
                {"file_path": "a", "user": "u", "date": "d", "size": 12},
                {"file_path": "b", "user": "u", "date": "d", "size": "34"},
                {"file_path": "c"},
                {"file_path": "d", "size": null}
            ]"#,
        )
        .unwrap();
        let sizes: Vec<u64> = files.iter().map(|f| f.size_bytes).collect();
        assert_eq!(sizes, vec![12, 34, 0, 0]);
    }
}
