use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::app::ports::RecordStorePort;
use crate::domain::{BookRecord, RawRecord};

/// In-memory RecordStorePort for tests and embedding hosts that keep their own storage
#[derive(Default)]
pub struct InMemoryRecordStore {
    collections: RwLock<HashMap<String, Vec<RawRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, collection: &str, records: Vec<RawRecord>) {
        self.collections.write().await.insert(collection.to_string(), records);
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections.read().await.get(collection).map_or(0, Vec::len)
    }
}

#[async_trait]
impl RecordStorePort for InMemoryRecordStore {
    async fn get_records(&self, collection: &str) -> Result<Vec<RawRecord>> {
        Ok(self.collections.read().await.get(collection).cloned().unwrap_or_default())
    }

    async fn store_records(&self, collection: &str, records: &[BookRecord]) -> Result<()> {
        let raw = records.iter().map(BookRecord::to_raw).collect();
        self.collections.write().await.insert(collection.to_string(), raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Platform;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_replaces_collection() {
        let store = InMemoryRecordStore::new();
        store.seed("kobo", vec![json!({ "id": "a" }), json!({ "id": "b" })]).await;
        assert_eq!(store.len("kobo").await, 2);

        store.store_records("kobo", &[BookRecord::blank(Platform::Kobo)]).await.unwrap();
        assert_eq!(store.get_records("kobo").await.unwrap().len(), 1);
        assert_eq!(store.len("unknown").await, 0);
    }
}
