use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use bookshelf_sync::app::ports::RecordStorePort;
use bookshelf_sync::app::reconcile_use_case::{CollectionSource, ReconcileRequest, ReconcileUseCase};
use bookshelf_sync::config::Config;
use bookshelf_sync::domain::Platform;
use bookshelf_sync::infra::json_record_store::JsonRecordStore;
use bookshelf_sync::infra::progress_listener_adapter::LoggingProgressListener;
use bookshelf_sync::logging;
use bookshelf_sync::pipeline::batch::BatchCoordinator;
use bookshelf_sync::pipeline::processing::normalize::DefaultNormalizer;
use bookshelf_sync::pipeline::processing::quality::QualityAnalyzer;
use bookshelf_sync::pipeline::processing::validation::rules::DefaultRuleProvider;
use bookshelf_sync::pipeline::processing::validation::ValidationEngine;
use bookshelf_sync::pipeline::sync::{SyncCoordinator, SyncOptions, SyncStrategy};

#[derive(Parser)]
#[command(name = "bookshelf-sync")]
#[command(about = "Normalize, validate, score and reconcile e-book library records")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file; defaults are used when it does not exist
    #[arg(long, global = true, default_value = "bookshelf-sync.toml")]
    config: PathBuf,

    /// Directory holding one `<collection>.json` file per collection
    #[arg(long, global = true, default_value = "data")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize, validate and score one collection
    Process {
        /// Platform the records were extracted from (readmoo, kindle, kobo, books_com, bookwalker)
        #[arg(long)]
        platform: String,
        /// Collection to read
        #[arg(long)]
        collection: String,
        /// Collection to write processed records to
        #[arg(long)]
        output: Option<String>,
        /// Treat validation warnings as errors
        #[arg(long)]
        strict: bool,
    },
    /// Reconcile a source collection into a target collection
    Sync {
        #[arg(long)]
        source: String,
        #[arg(long)]
        source_platform: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        target_platform: String,
        /// merge or overwrite; defaults to the configured strategy
        #[arg(long)]
        strategy: Option<String>,
        /// Compute the result without writing the target
        #[arg(long)]
        dry_run: bool,
        /// Cancel the session if it runs longer than this many milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// List the supported sync strategies
    Strategies,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let _guard = logging::init_logging(&config.logging);

    let store: Arc<dyn RecordStorePort> = Arc::new(JsonRecordStore::new(&cli.store));
    let batches = Arc::new(BatchCoordinator::new(
        Arc::new(DefaultNormalizer::new()),
        Arc::new(ValidationEngine::new(&DefaultRuleProvider::new())),
        Arc::new(QualityAnalyzer::new(config.quality.policy).with_trend_window(config.quality.trend_window)),
        config.batch.clone(),
    ));
    let sync = Arc::new(SyncCoordinator::new(config.sync.clone()));

    match cli.command {
        Commands::Process {
            platform,
            collection,
            output,
            strict,
        } => {
            println!("📚 Processing collection '{}'...", collection);
            let use_case = ReconcileUseCase::new(store, batches, sync, Arc::new(LoggingProgressListener::new(100)))
                .with_strict(strict);
            let source = CollectionSource {
                collection,
                platform: platform.parse::<Platform>()?,
            };

            match use_case.process_collection(&source, output.as_deref()).await {
                Ok(report) => {
                    println!("✅ Batch {} finished: {}", report.batch_id, report.state);
                    println!("   Books: {} total, {} valid, {} invalid", report.total_books, report.valid_books, report.invalid_books);
                    println!("   Average quality: {:.1}", report.average_quality_score);
                    for issue in report.quality_summary.common_issues.iter().take(5) {
                        println!("   - {} ({})", issue.issue, issue.count);
                    }
                    if !report.failures.is_empty() {
                        println!("\n⚠️  {} records failed:", report.failures.len());
                        for failure in report.failures.iter().take(10) {
                            println!("   - #{} {}: {}", failure.index, failure.record_id, failure.message);
                        }
                    }
                }
                Err(e) => {
                    error!("Processing failed: {:#}", e);
                    println!("❌ Processing failed: {:#}", e);
                    return Err(e);
                }
            }
        }
        Commands::Sync {
            source,
            source_platform,
            target,
            target_platform,
            strategy,
            dry_run,
            deadline_ms,
            session_id,
        } => {
            let strategy: SyncStrategy = strategy
                .as_deref()
                .unwrap_or(&config.sync.default_strategy)
                .parse()
                .map_err(bookshelf_sync::ReconcileError::from)?;
            let request = ReconcileRequest {
                session_id: session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                source: CollectionSource {
                    collection: source,
                    platform: source_platform.parse::<Platform>()?,
                },
                target: CollectionSource {
                    collection: target,
                    platform: target_platform.parse::<Platform>()?,
                },
                strategy,
                options: SyncOptions {
                    dry_run,
                    deadline: deadline_ms.map(Duration::from_millis),
                },
            };
            println!(
                "🔄 {} '{}' into '{}' ({})...",
                if dry_run { "Previewing sync of" } else { "Syncing" },
                request.source.collection,
                request.target.collection,
                strategy
            );

            let use_case = ReconcileUseCase::new(store, batches, sync, Arc::new(LoggingProgressListener::new(100)));
            match use_case.reconcile(request).await {
                Ok(outcome) => {
                    let result = &outcome.sync;
                    let marker = if result.success { "✅" } else { "⚠️ " };
                    println!("{} Session {} finished: {}", marker, result.session_id, result.state);
                    println!(
                        "   Imported {}, kept {}, unchanged {}, conflicts {}",
                        result.imported,
                        result.exported,
                        result.skipped,
                        result.conflicts.len()
                    );
                    println!("   Books: {} -> {}", result.book_count.before, result.book_count.after);
                    for conflict in &result.conflicts {
                        println!("   - {}: {}", conflict.after.display_label(), conflict.resolution);
                    }
                    for issue in &result.data_integrity.issues {
                        println!("   ! {}", issue);
                    }
                    info!(duration_ms = result.timing.duration_ms, "Sync command finished");
                    if !result.success {
                        anyhow::bail!("Sync session {} ended {}", result.session_id, result.state);
                    }
                }
                Err(e) => {
                    error!("Sync failed: {:#}", e);
                    println!("❌ Sync failed: {:#}", e);
                    return Err(e);
                }
            }
        }
        Commands::Strategies => {
            for strategy in sync.get_supported_strategies() {
                println!("{}", strategy);
            }
        }
    }
    Ok(())
}
