use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

use bookshelf_sync::app::ports::{NoopProgressListener, ProgressListener};
use bookshelf_sync::config::{BatchSettings, SyncSettings};
use bookshelf_sync::domain::{BookRecord, Platform, RawRecord};
use bookshelf_sync::infra::progress_listener_adapter::ChannelProgressListener;
use bookshelf_sync::pipeline::batch::{BatchCoordinator, BatchOptions};
use bookshelf_sync::pipeline::processing::identity;
use bookshelf_sync::pipeline::processing::normalize::{DefaultNormalizer, Normalizer};
use bookshelf_sync::pipeline::processing::quality::QualityAnalyzer;
use bookshelf_sync::pipeline::processing::validation::rules::DefaultRuleProvider;
use bookshelf_sync::pipeline::processing::validation::{IssueKind, ValidationEngine};
use bookshelf_sync::pipeline::state::JobState;
use bookshelf_sync::pipeline::sync::{Collection, SyncCoordinator, SyncOptions, SyncStrategy};

fn coordinator() -> BatchCoordinator {
    BatchCoordinator::new(
        Arc::new(DefaultNormalizer::new()),
        Arc::new(ValidationEngine::new(&DefaultRuleProvider::new())),
        Arc::new(QualityAnalyzer::default()),
        BatchSettings::default(),
    )
}

fn processed(raw: &RawRecord, platform: Platform) -> Result<BookRecord> {
    let normalized = DefaultNormalizer::new().normalize(raw, platform)?;
    Ok(identity::attach_identity(normalized.record))
}

#[tokio::test]
async fn test_same_isbn_on_two_platforms_merges_into_one_record() -> Result<()> {
    let a = processed(&json!({ "id": "A", "isbn": "9781234567890", "progress": 40 }), Platform::Kobo)?;
    let b = processed(&json!({ "id": "B", "isbn": "9781234567890", "progress": 70 }), Platform::Readmoo)?;
    assert_eq!(a.cross_platform_id, b.cross_platform_id);

    let source = Collection::new("kobo-device", vec![a]);
    let target = Collection::new("readmoo-device", vec![b]);
    let sync = SyncCoordinator::new(SyncSettings::default());
    let result = sync
        .execute_sync("scenario-a", &source, &target, SyncStrategy::Merge, SyncOptions::default())
        .await?;

    assert!(result.success);
    assert_eq!(result.conflicts.len(), 1);
    let merged = target.snapshot();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].progress, Some(70.0));
    Ok(())
}

#[test]
fn test_validate_batch_reports_missing_title() -> Result<()> {
    let records = vec![
        json!({ "id": "1", "title": "Dune", "authors": ["Frank Herbert"] }),
        json!({ "id": "2", "title": "Solaris", "authors": ["Stanislaw Lem"] }),
        json!({ "id": "3", "title": "", "authors": ["Anonymous"] }),
    ];
    let summary = coordinator().validate_batch(&records, Platform::Readmoo)?;

    assert_eq!(summary.valid_books, 2);
    assert_eq!(summary.invalid_books, 1);
    let invalid = &summary.results[2];
    assert!(!invalid.is_valid());
    assert!(invalid
        .errors()
        .iter()
        .any(|e| e.kind == IssueKind::RequiredField && e.field == "title"));
    Ok(())
}

#[tokio::test]
async fn test_chunked_batch_completes_with_progress_events() -> Result<()> {
    let records: Vec<RawRecord> = (0..25)
        .map(|i| json!({ "id": format!("b{}", i), "title": format!("Book {}", i), "authors": ["A"] }))
        .collect();
    let (listener, mut events) = ChannelProgressListener::channel();
    let options = BatchOptions {
        max_concurrency: 3,
        chunk_size: 5,
        ..BatchOptions::default()
    };

    let report = coordinator()
        .process_batch(records, Platform::Readmoo, options, Arc::new(listener))
        .await?;

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.processed_books, 25);
    let mut count = 0;
    while events.try_recv().is_ok() {
        count += 1;
    }
    assert!(count >= 5, "only {} progress events", count);
    Ok(())
}

#[tokio::test]
async fn test_dry_run_matches_execution_and_leaves_target_alone() -> Result<()> {
    let source_records = vec![
        processed(&json!({ "id": "k1", "title": "Dune", "isbn": "9780441013593", "progress": 20 }), Platform::Kobo)?,
        processed(&json!({ "id": "k2", "title": "Hyperion", "authors": ["Dan Simmons"] }), Platform::Kobo)?,
    ];
    let target_records = vec![
        processed(&json!({ "id": "r1", "title": "Dune", "isbn": "0441013597", "progress": 55 }), Platform::Readmoo)?,
        processed(&json!({ "id": "r2", "title": "Solaris", "authors": ["Stanislaw Lem"] }), Platform::Readmoo)?,
    ];
    let source = Collection::new("phone", source_records);
    let target = Collection::new("tablet", target_records);
    let before = serde_json::to_vec(&*target.snapshot())?;

    let sync = SyncCoordinator::new(SyncSettings::default());
    let preview = sync.dry_run("preview", &source, &target, SyncStrategy::Merge).await?;
    assert!(preview.dry_run);
    assert_eq!(serde_json::to_vec(&*target.snapshot())?, before);

    let executed = sync
        .execute_sync("real", &source, &target, SyncStrategy::Merge, SyncOptions::default())
        .await?;
    assert_eq!(preview.conflicts, executed.conflicts);
    assert_eq!(preview.conflicts.len(), 1);
    assert_eq!(preview.data_integrity.checksum_after, executed.data_integrity.checksum_after);
    assert_eq!(target.len(), 3);

    let stats = sync.get_sync_statistics();
    assert_eq!((stats.total_sessions, stats.dry_runs), (1, 1));
    Ok(())
}

#[tokio::test]
async fn test_minimal_record_is_valid_on_every_platform() -> Result<()> {
    let coordinator = coordinator();
    for platform in Platform::ALL {
        let records = vec![json!({ "id": "x", "title": "T", "authors": ["A"] })];
        let listener: Arc<dyn ProgressListener> = Arc::new(NoopProgressListener);
        let report = coordinator
            .process_batch(records, platform, coordinator.default_options(), listener)
            .await?;
        assert_eq!(report.valid_books, 1, "{}", platform);
    }
    Ok(())
}
