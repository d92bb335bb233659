use anyhow::Result;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

use crate::app::ports::{ProgressListener, RecordStorePort};
use crate::domain::{BookRecord, Platform};
use crate::pipeline::batch::{BatchCoordinator, BatchReport};
use crate::pipeline::sync::{Collection, SyncCoordinator, SyncOptions, SyncResult, SyncStrategy};

/// One side of a reconciliation: a stored collection and the platform it was read from
#[derive(Debug, Clone)]
pub struct CollectionSource {
    pub collection: String,
    pub platform: Platform,
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub session_id: String,
    pub source: CollectionSource,
    pub target: CollectionSource,
    pub strategy: SyncStrategy,
    pub options: SyncOptions,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub source_report: BatchReport,
    pub target_report: BatchReport,
    pub sync: SyncResult,
}

/// Use case for loading two stored collections, processing both and syncing one into the other
pub struct ReconcileUseCase {
    store: Arc<dyn RecordStorePort>,
    batches: Arc<BatchCoordinator>,
    sync: Arc<SyncCoordinator>,
    listener: Arc<dyn ProgressListener>,
    strict: bool,
}

impl ReconcileUseCase {
    pub fn new(
        store: Arc<dyn RecordStorePort>,
        batches: Arc<BatchCoordinator>,
        sync: Arc<SyncCoordinator>,
        listener: Arc<dyn ProgressListener>,
    ) -> Self {
        Self {
            store,
            batches,
            sync,
            listener,
            strict: false,
        }
    }

    /// Treat validation warnings as errors when processing collections
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Process one stored collection and write the processed records back under `output`
    pub async fn process_collection(&self, source: &CollectionSource, output: Option<&str>) -> Result<BatchReport> {
        let report = self.process(source).await?;
        if let Some(output) = output {
            let records = processed_records(&report);
            self.store.store_records(output, &records).await?;
            info!("Stored {} processed records in '{}'", records.len(), output);
        }
        Ok(report)
    }

    /// Reconcile `source` into `target`. The target is only written back when the sync
    /// completed and was not a dry run.
    pub async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileOutcome> {
        let span = info_span!(
            "reconcile",
            session_id = %request.session_id,
            source = %request.source.collection,
            target_collection = %request.target.collection
        );

        async {
            let source_report = self.process(&request.source).await?;
            let target_report = self.process(&request.target).await?;

            let source = Collection::new(&request.source.collection, processed_records(&source_report));
            let target = Collection::new(&request.target.collection, processed_records(&target_report));

            let sync = self
                .sync
                .execute_sync(&request.session_id, &source, &target, request.strategy, request.options.clone())
                .await?;

            if sync.success && !sync.dry_run {
                self.store
                    .store_records(target.name(), &target.snapshot())
                    .await?;
                info!("Wrote {} reconciled records to '{}'", sync.book_count.after, target.name());
            }

            Ok(ReconcileOutcome {
                source_report,
                target_report,
                sync,
            })
        }
        .instrument(span)
        .await
    }

    async fn process(&self, source: &CollectionSource) -> Result<BatchReport> {
        let raw = self.store.get_records(&source.collection).await?;
        info!("Loaded {} raw records from '{}'", raw.len(), source.collection);
        let mut options = self.batches.default_options();
        options.strict = self.strict;
        let report = self
            .batches
            .process_batch(raw, source.platform, options, Arc::clone(&self.listener))
            .await?;
        Ok(report)
    }
}

/// Records that made it through normalization, in input order
pub fn processed_records(report: &BatchReport) -> Vec<BookRecord> {
    report
        .individual_results
        .iter()
        .filter_map(|result| result.record.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::NoopProgressListener;
    use crate::config::{BatchSettings, SyncSettings};
    use crate::domain::RawRecord;
    use crate::pipeline::processing::normalize::DefaultNormalizer;
    use crate::pipeline::processing::quality::QualityAnalyzer;
    use crate::pipeline::processing::validation::rules::DefaultRuleProvider;
    use crate::pipeline::processing::validation::ValidationEngine;
    use crate::pipeline::state::JobState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MockStore {
        raw: Arc<Mutex<HashMap<String, Vec<RawRecord>>>>,
        written: Arc<Mutex<HashMap<String, Vec<BookRecord>>>>,
    }

    #[async_trait]
    impl RecordStorePort for MockStore {
        async fn get_records(&self, collection: &str) -> anyhow::Result<Vec<RawRecord>> {
            Ok(self.raw.lock().await.get(collection).cloned().unwrap_or_default())
        }

        async fn store_records(&self, collection: &str, records: &[BookRecord]) -> anyhow::Result<()> {
            self.written.lock().await.insert(collection.to_string(), records.to_vec());
            Ok(())
        }
    }

    fn use_case(store: Arc<MockStore>) -> ReconcileUseCase {
        let batches = BatchCoordinator::new(
            Arc::new(DefaultNormalizer::new()),
            Arc::new(ValidationEngine::new(&DefaultRuleProvider::new())),
            Arc::new(QualityAnalyzer::default()),
            BatchSettings::default(),
        );
        ReconcileUseCase::new(
            store,
            Arc::new(batches),
            Arc::new(SyncCoordinator::new(SyncSettings::default())),
            Arc::new(NoopProgressListener),
        )
    }

    async fn seeded_store() -> Arc<MockStore> {
        let store = Arc::new(MockStore::default());
        let mut raw = store.raw.lock().await;
        raw.insert(
            "kobo".to_string(),
            vec![json!({ "id": "k-1", "title": "Dune", "author": "Frank Herbert", "isbn": "9780441013593", "progress": 40 })],
        );
        raw.insert(
            "readmoo".to_string(),
            vec![
                json!({ "id": "r-9", "title": "Dune", "authors": ["Frank Herbert"], "isbn": "978-0-441-01359-3", "progress": 70 }),
                json!({ "id": "r-2", "title": "Solaris", "authors": ["Stanislaw Lem"] }),
            ],
        );
        drop(raw);
        store
    }

    fn request(dry_run: bool) -> ReconcileRequest {
        ReconcileRequest {
            session_id: "session-1".to_string(),
            source: CollectionSource {
                collection: "kobo".to_string(),
                platform: Platform::Kobo,
            },
            target: CollectionSource {
                collection: "readmoo".to_string(),
                platform: Platform::Readmoo,
            },
            strategy: SyncStrategy::Merge,
            options: SyncOptions {
                dry_run,
                deadline: None,
            },
        }
    }

    #[tokio::test]
    async fn test_reconcile_merges_and_stores_target() {
        let store = seeded_store().await;
        let outcome = use_case(Arc::clone(&store)).reconcile(request(false)).await.unwrap();

        assert_eq!(outcome.source_report.state, JobState::Completed);
        assert_eq!(outcome.sync.conflicts.len(), 1);
        assert_eq!(outcome.sync.book_count.after, 2);

        let written = store.written.lock().await;
        let target = written.get("readmoo").unwrap();
        assert_eq!(target.len(), 2);
        let dune = target.iter().find(|r| r.title == "Dune").unwrap();
        assert_eq!(dune.progress, Some(70.0));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = seeded_store().await;
        let outcome = use_case(Arc::clone(&store)).reconcile(request(true)).await.unwrap();

        assert!(outcome.sync.dry_run);
        assert_eq!(outcome.sync.conflicts.len(), 1);
        assert!(store.written.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_process_collection_writes_output() {
        let store = seeded_store().await;
        let source = CollectionSource {
            collection: "readmoo".to_string(),
            platform: Platform::Readmoo,
        };
        let report = use_case(Arc::clone(&store))
            .process_collection(&source, Some("readmoo-processed"))
            .await
            .unwrap();

        assert_eq!(report.total_books, 2);
        assert_eq!(store.written.lock().await.get("readmoo-processed").unwrap().len(), 2);
    }
}
