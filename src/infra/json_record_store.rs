use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::app::ports::RecordStorePort;
use crate::domain::{BookRecord, RawRecord};

/// File-based implementation of RecordStorePort.
///
/// Each collection lives in `<root>/<collection>.json`. Reads accept either a JSON array
/// or NDJSON; writes always produce a pretty-printed array and replace the file through
/// a rename so a reader never sees a half-written collection.
pub struct JsonRecordStore {
    root: PathBuf,
}

impl JsonRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a collection's file. Names must stay inside the store directory.
    pub fn collection_path(&self, collection: &str) -> Result<PathBuf> {
        if collection.trim().is_empty()
            || collection.contains(['/', '\\'])
            || collection.contains("..")
            || collection.starts_with('.')
        {
            bail!("Invalid collection name '{}'", collection);
        }
        Ok(self.root.join(format!("{}.json", collection)))
    }
}

#[async_trait]
impl RecordStorePort for JsonRecordStore {
    async fn get_records(&self, collection: &str) -> Result<Vec<RawRecord>> {
        let path = self.collection_path(collection)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Collection file {} not found, treating as empty", path.display());
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read collection file {}", path.display()))?;
        let trimmed = content.trim_start();

        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        if trimmed.starts_with('[') {
            let records: Vec<RawRecord> = serde_json::from_str(trimmed)
                .with_context(|| format!("Collection file {} is not a JSON array", path.display()))?;
            return Ok(records);
        }

        // NDJSON
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid JSON on line {} of {}", n + 1, path.display()))
            })
            .collect()
    }

    async fn store_records(&self, collection: &str, records: &[BookRecord]) -> Result<()> {
        let path = self.collection_path(collection)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create store directory {}", self.root.display()))?;

        let staging = self.root.join(format!(".{}.json.tmp", collection));
        let body = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &path)
            .await
            .with_context(|| format!("Failed to replace collection file {}", path.display()))?;

        info!("Wrote {} records to {}", records.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Platform;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_collection_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path());
        assert!(store.get_records("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_ndjson_and_arrays() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path());
        std::fs::write(store.collection_path("lines").unwrap(), "{\"id\":\"a\"}\n\n{\"id\":\"b\"}\n").unwrap();
        std::fs::write(store.collection_path("array").unwrap(), "[{\"id\":\"a\"}]").unwrap();

        assert_eq!(store.get_records("lines").await.unwrap().len(), 2);
        assert_eq!(store.get_records("array").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stored_records_read_back_as_raw() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path().join("nested"));
        let mut record = BookRecord::blank(Platform::Kobo);
        record.source_id = "k-1".to_string();
        record.title = "Dune".to_string();

        store.store_records("kobo", &[record]).await.unwrap();
        let raw = store.get_records("kobo").await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0]["title"], "Dune");
        assert_eq!(raw[0]["sourceId"], "k-1");
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path());
        std::fs::write(store.collection_path("bad").unwrap(), "[{\"id\":").unwrap();
        assert!(store.get_records("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_names_outside_the_store_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path().join("store"));
        for name in ["../escape", "a/b", "a\\b", "..", ".hidden", ""] {
            assert!(store.collection_path(name).is_err(), "accepted {:?}", name);
            assert!(store.store_records(name, &[]).await.is_err(), "wrote {:?}", name);
        }
        assert!(!dir.path().join("escape.json").exists());
        assert!(store.collection_path("kobo-2024_backup").is_ok());
    }
}
