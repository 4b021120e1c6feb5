use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::domain::{DeliveredFile, is_tracked};
use crate::error::DeliveryError;

pub const CHECKSUM_SUFFIX: &str = ".md5";

/// Delivery folders for one sample: `<root>/<project>/<batch>/<sample>`.
pub fn sample_folders(
    delivery_root: &Utf8Path,
    project_id: &str,
    sample_id: &str,
) -> Result<Vec<Utf8PathBuf>, DeliveryError> {
    let project_dir = delivery_root.join(project_id);
    if !project_dir.as_std_path().is_dir() {
        debug!(%project_dir, "project delivery folder does not exist");
        return Ok(Vec::new());
    }
    let entries = project_dir
        .read_dir_utf8()
        .map_err(|err| DeliveryError::Filesystem(format!("read {project_dir}: {err}")))?;
    let mut folders = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| DeliveryError::Filesystem(err.to_string()))?;
        let candidate = entry.path().join(sample_id);
        if candidate.as_std_path().is_dir() {
            folders.push(candidate);
        }
    }
    folders.sort();
    Ok(folders)
}

pub fn list_delivered_files(
    delivery_root: &Utf8Path,
    folder: &Utf8Path,
    extensions: &[String],
) -> Result<Vec<DeliveredFile>, DeliveryError> {
    let mut files = Vec::new();
    for path in walk_dir(folder)? {
        if !path.as_std_path().is_file() || !is_tracked(path.as_str(), extensions) {
            continue;
        }
        let checksum = read_checksum(&path)?
            .ok_or_else(|| DeliveryError::MissingChecksum(path.to_string()))?;
        let size_bytes = fs::metadata(path.as_std_path())
            .map_err(|err| DeliveryError::Filesystem(format!("stat {path}: {err}")))?
            .len();
        files.push(DeliveredFile {
            relative_path: relative_to(delivery_root, &path)?,
            checksum: Some(checksum),
            size_bytes,
        });
    }
    files.sort();
    Ok(files)
}

pub fn read_checksum(path: &Utf8Path) -> Result<Option<String>, DeliveryError> {
    let sidecar = Utf8PathBuf::from(format!("{path}{CHECKSUM_SUFFIX}"));
    if !sidecar.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(sidecar.as_std_path())
        .map_err(|err| DeliveryError::Filesystem(format!("read {sidecar}: {err}")))?;
    Ok(content
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string))
}

fn relative_to(root: &Utf8Path, path: &Utf8Path) -> Result<String, DeliveryError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        DeliveryError::Filesystem(format!("{path} is outside delivery root {root}"))
    })?;
    Ok(relative
        .components()
        .map(|component| component.as_str())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Symlinked directories are listed but not descended into.
fn walk_dir(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, DeliveryError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(path.as_std_path())
            .map_err(|err| DeliveryError::Filesystem(format!("read {path}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| DeliveryError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                warn!(path = %entry.path().display(), "skipping non-utf8 path");
                continue;
            };
            let file_type = entry
                .file_type()
                .map_err(|err| DeliveryError::Filesystem(format!("stat {path}: {err}")))?;
            if file_type.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::default_tracked_extensions;

    fn write(path: &Utf8Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn scans_tracked_files_with_checksums() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let sample_dir = root.join("proj1/batch1/S1");
        write(&sample_dir.join("S1_R1.fastq.gz"), "reads");
        write(&sample_dir.join("S1_R1.fastq.gz.md5"), "abc123  S1_R1.fastq.gz\n");
        write(&sample_dir.join("summary.txt"), "not tracked");

        let folders = sample_folders(&root, "proj1", "S1").unwrap();
        assert_eq!(folders, vec![sample_dir.clone()]);

        let files =
            list_delivered_files(&root, &folders[0], &default_tracked_extensions()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "proj1/batch1/S1/S1_R1.fastq.gz");
        assert_eq!(files[0].checksum.as_deref(), Some("abc123"));
        assert_eq!(files[0].size_bytes, 5);
    }

    #[test]
    fn tracked_file_without_checksum_fails() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        write(&root.join("p/b/S2/S2.bam"), "bam");

        let err = list_delivered_files(&root, &root.join("p/b/S2"), &default_tracked_extensions())
            .unwrap_err();
        assert_matches!(err, DeliveryError::MissingChecksum(_));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_followed() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let sample_dir = root.join("p/b/S1");
        write(&sample_dir.join("S1.bam"), "bam");
        write(&sample_dir.join("S1.bam.md5"), "abc123  S1.bam\n");
        std::os::unix::fs::symlink(".", sample_dir.join("loop")).unwrap();

        let files =
            list_delivered_files(&root, &sample_dir, &default_tracked_extensions()).unwrap();
        let paths = files
            .iter()
            .map(|file| file.relative_path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["p/b/S1/S1.bam"]);
    }

    #[test]
    fn missing_project_has_no_folders() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        assert!(sample_folders(&root, "nope", "S1").unwrap().is_empty());
    }
}
