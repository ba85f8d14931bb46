//! Versioned JSON files shared by the store and the offline queue.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

/// Field every persisted file carries so incompatible formats are detected.
const VERSION_FIELD: &str = "schema_version";

/// Read `path` if it exists and carries `version`.
///
/// A missing file is `Ok(None)`. A file that cannot be read as the expected
/// version is logged and deleted, then also reported as `Ok(None)`.
pub(crate) fn load_versioned<T: DeserializeOwned>(path: &Path, version: u32) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let raw: Value = match serde_json::from_str(&contents) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Discarding unreadable file");
            discard(path);
            return Ok(None);
        }
    };

    let found = raw.get(VERSION_FIELD).and_then(Value::as_u64);
    if found != Some(u64::from(version)) {
        warn!(path = %path.display(), ?found, expected = version, "Discarding file with incompatible schema version");
        discard(path);
        return Ok(None);
    }

    match serde_json::from_value(raw) {
        Ok(parsed) => {
            debug!(path = %path.display(), "Loaded persisted state");
            Ok(Some(parsed))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Discarding file that does not match its schema");
            discard(path);
            Ok(None)
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Failed to remove discarded file");
    }
}

/// Replace `path` with `contents` via a temp file and rename.
pub(crate) async fn write_atomic(path: &Path, contents: String) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        schema_version: u32,
        items: Vec<u32>,
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc {
            schema_version: 1,
            items: vec![1, 2],
        };
        write_atomic(&path, serde_json::to_string(&doc).unwrap())
            .await
            .unwrap();
        let loaded: Option<Doc> = load_versioned(&path, 1).unwrap();
        assert_eq!(loaded, Some(doc));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Doc> = load_versioned(&dir.path().join("none.json"), 1).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_wrong_version_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, r#"{"schema_version": 0, "items": []}"#).unwrap();
        let loaded: Option<Doc> = load_versioned(&path, 1).unwrap();
        assert!(loaded.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "not json").unwrap();
        let loaded: Option<Doc> = load_versioned(&path, 1).unwrap();
        assert!(loaded.is_none());
        assert!(!path.exists());
    }
}
