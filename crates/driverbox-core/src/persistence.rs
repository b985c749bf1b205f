//! File helpers shared by the config store, rule store and library

use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Read a file, tolerating a missing or empty one
///
/// Returns `Ok(None)` when the file does not exist or only holds whitespace.
#[allow(clippy::missing_errors_doc)]
pub async fn read_optional(path: &Path) -> Result<Option<String>, std::io::Error> {
    match fs::read_to_string(path).await {
        Ok(contents) if contents.trim().is_empty() => {
            tracing::warn!("Skipping empty file {:?}", path);
            Ok(None)
        }
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No file found at {:?}", path);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Create-truncate-write-fsync
#[allow(clippy::missing_errors_doc)]
pub async fn write_synced(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;

    tracing::debug!("Wrote {} bytes to {:?}", contents.len(), path);
    Ok(())
}

/// Serialize to pretty JSON and write it synced
#[allow(clippy::missing_errors_doc)]
pub async fn write_json<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), crate::CoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_synced(path, &json).await?;
    Ok(())
}

/// Remove a file, ignoring a missing one
#[allow(clippy::missing_errors_doc)]
pub async fn remove_if_exists(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_optional_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(read_optional(&missing).await.unwrap().is_none());

        let empty = dir.path().join("empty.json");
        write_synced(&empty, b"  \n").await.unwrap();
        assert!(read_optional(&empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_synced_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_synced(&path, b"long contents").await.unwrap();
        write_synced(&path, b"short").await.unwrap();
        assert_eq!(read_optional(&path).await.unwrap().as_deref(), Some("short"));

        remove_if_exists(&path).await.unwrap();
        remove_if_exists(&path).await.unwrap();
        assert!(read_optional(&path).await.unwrap().is_none());
    }
}
