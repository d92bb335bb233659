//! Bounded-concurrency batch processing: normalize, identify, validate and score.
//!
//! A batch is split into chunks that a fixed pool of worker tasks pulls from a shared
//! queue. Workers only yield between records, and consult the batch's control channel
//! before starting each one, so pause and cancel are cooperative: an in-flight record
//! always finishes. Every result and progress event is committed under the batch lock,
//! and nothing is committed once the batch is terminal.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::app::ports::{ProgressEvent, ProgressListener};
use crate::config::BatchSettings;
use crate::domain::{BookRecord, Platform, RawRecord};
use crate::error::{BatchError, ReconcileError, Result};
use crate::observability::metrics;
use crate::pipeline::lock;
use crate::pipeline::processing::identity;
use crate::pipeline::processing::normalize::{fields, NormalizedFields, Normalizer};
use crate::pipeline::processing::quality::{
    BatchQualitySummary, QualityAnalyzer, QualityHistory, QualityScore, QualityTrend,
};
use crate::pipeline::processing::validation::{ValidationEngine, ValidationResult};
use crate::pipeline::state::JobState;

const QUALITY_HISTORY_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Generated when absent
    pub batch_id: Option<String>,
    pub max_concurrency: usize,
    pub chunk_size: usize,
    pub max_parallel_batches: usize,
    pub fail_fast: bool,
    pub priority: Priority,
    /// Escalate validation warnings to errors. A strict engine is strict regardless.
    pub strict: bool,
    /// Reaching the deadline cancels the batch
    pub deadline: Option<Duration>,
}

impl BatchOptions {
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self {
            batch_id: None,
            max_concurrency: settings.max_concurrency,
            chunk_size: settings.chunk_size,
            max_parallel_batches: settings.max_parallel_batches,
            fail_fast: settings.fail_fast,
            priority: Priority::Normal,
            strict: false,
            deadline: None,
        }
    }

    pub fn with_batch_id(mut self, id: impl Into<String>) -> Self {
        self.batch_id = Some(id.into());
        self
    }

    fn check(&self) -> std::result::Result<(), BatchError> {
        if self.max_concurrency == 0 {
            return Err(BatchError::InvalidOptions("max_concurrency must be at least 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(BatchError::InvalidOptions("chunk_size must be at least 1".to_string()));
        }
        if self.max_parallel_batches == 0 {
            return Err(BatchError::InvalidOptions("max_parallel_batches must be at least 1".to_string()));
        }
        if matches!(&self.batch_id, Some(id) if id.trim().is_empty()) {
            return Err(BatchError::InvalidOptions("batch_id must not be blank".to_string()));
        }
        Ok(())
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_settings(&BatchSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Normalization,
    Validation,
}

/// A per-record failure recorded in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProcessingError {
    pub index: usize,
    pub record_id: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    /// Position in the submitted record list
    pub index: usize,
    pub source_id: String,
    pub cross_platform_id: Option<String>,
    pub record: Option<BookRecord>,
    pub validation: ValidationResult,
    pub quality: Option<QualityScore>,
    pub normalization_warnings: Vec<String>,
    pub error: Option<String>,
}

impl RecordResult {
    pub fn is_valid(&self) -> bool {
        self.error.is_none() && self.validation.is_valid()
    }

    fn label(&self) -> String {
        self.record
            .as_ref()
            .map(BookRecord::display_label)
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| format!("#{}", self.index))
    }

    fn failure(&self) -> Option<BatchProcessingError> {
        let record_id = self.validation.record_id().to_string();
        if let Some(message) = &self.error {
            return Some(BatchProcessingError {
                index: self.index,
                record_id,
                kind: FailureKind::Normalization,
                message: message.clone(),
            });
        }
        if !self.validation.is_valid() {
            let message = self
                .validation
                .errors()
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Some(BatchProcessingError {
                index: self.index,
                record_id,
                kind: FailureKind::Validation,
                message,
            });
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: String,
    pub platform: Platform,
    pub state: JobState,
    pub total_books: usize,
    pub processed_books: usize,
    pub valid_books: usize,
    pub invalid_books: usize,
    pub average_quality_score: f64,
    pub quality_summary: BatchQualitySummary,
    /// Ordered by record index; a cancelled batch holds only what finished first
    pub individual_results: Vec<RecordResult>,
    pub failures: Vec<BatchProcessingError>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStatus {
    pub state: JobState,
    pub processed: usize,
    pub total: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchValidationSummary {
    pub total: usize,
    pub valid_books: usize,
    pub invalid_books: usize,
    pub results: Vec<ValidationResult>,
}

/// Records processed together at one priority
#[derive(Debug, Clone)]
pub struct PriorityGroup {
    pub priority: Priority,
    pub records: Vec<RawRecord>,
}

/// An independent batch run alongside others by `process_parallel`
#[derive(Debug, Clone)]
pub struct NamedBatch {
    pub name: String,
    pub platform: Platform,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

struct BatchProgress {
    state: JobState,
    processed: usize,
    results: BTreeMap<usize, RecordResult>,
    failures: Vec<BatchProcessingError>,
}

struct BatchHandle {
    id: String,
    total: usize,
    progress: Mutex<BatchProgress>,
    control: watch::Sender<Control>,
}

impl BatchHandle {
    fn new(id: String, total: usize) -> Self {
        let (control, _) = watch::channel(Control::Run);
        Self {
            id,
            total,
            progress: Mutex::new(BatchProgress {
                state: JobState::Pending,
                processed: 0,
                results: BTreeMap::new(),
                failures: Vec::new(),
            }),
            control,
        }
    }

    fn transition(&self, progress: &mut BatchProgress, next: JobState) -> std::result::Result<(), BatchError> {
        if !progress.state.can_transition_to(next) {
            return Err(BatchError::InvalidTransition {
                id: self.id.clone(),
                from: progress.state,
                to: next,
            });
        }
        debug!(batch_id = %self.id, from = %progress.state, to = %next, "Batch state change");
        progress.state = next;
        Ok(())
    }

    fn status(&self) -> BatchStatus {
        let progress = lock(&self.progress);
        BatchStatus {
            state: progress.state,
            processed: progress.processed,
            total: self.total,
            remaining: self.total - progress.processed,
        }
    }

    /// Cancel because the caller's deadline passed
    fn expire(&self) {
        let mut progress = lock(&self.progress);
        if !progress.state.is_terminal() && self.transition(&mut progress, JobState::Cancelled).is_ok() {
            warn!(batch_id = %self.id, processed = progress.processed, "Batch deadline reached, cancelling");
            self.control.send_replace(Control::Cancel);
        }
    }
}

/// Cancels a batch that is still live when its `run` future is dropped, so an
/// abandoned batch never stays registered as processing.
struct AbandonGuard {
    handle: Arc<BatchHandle>,
    started: Instant,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let mut progress = lock(&self.handle.progress);
        if progress.state.is_terminal() {
            return;
        }
        if self.handle.transition(&mut progress, JobState::Cancelled).is_ok() {
            warn!(batch_id = %self.handle.id, processed = progress.processed, "Batch dropped before finishing, cancelling");
            self.handle.control.send_replace(Control::Cancel);
            metrics::batch::finished(JobState::Cancelled.as_str(), self.started.elapsed().as_secs_f64());
        }
    }
}

/// Orchestrates the per-record pipeline over collections of raw records
pub struct BatchCoordinator {
    normalizer: Arc<dyn Normalizer>,
    validator: Arc<ValidationEngine>,
    analyzer: Arc<QualityAnalyzer>,
    settings: BatchSettings,
    jobs: Mutex<HashMap<String, Arc<BatchHandle>>>,
    history: Mutex<HashMap<Platform, QualityHistory>>,
}

impl BatchCoordinator {
    pub fn new(
        normalizer: Arc<dyn Normalizer>,
        validator: Arc<ValidationEngine>,
        analyzer: Arc<QualityAnalyzer>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            normalizer,
            validator,
            analyzer,
            settings,
            jobs: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Options seeded from this coordinator's configured defaults
    pub fn default_options(&self) -> BatchOptions {
        BatchOptions::from_settings(&self.settings)
    }

    pub fn analyzer(&self) -> &QualityAnalyzer {
        &self.analyzer
    }

    /// Normalize, identify, validate and score every record.
    ///
    /// Option and platform problems are rejected before any work starts. Per-record
    /// failures end up in the report; with `fail_fast` the first one stops the batch
    /// in state `Failed`.
    pub async fn process_batch(
        &self,
        records: Vec<RawRecord>,
        platform: Platform,
        options: BatchOptions,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<BatchReport> {
        options.check()?;
        self.ensure_supported(platform)?;

        let batch_id = options
            .batch_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let handle = self.register(&batch_id, records.len())?;

        let span = info_span!("batch", batch_id = %batch_id, platform = %platform, total = records.len());
        self.run(handle, records, platform, &options, listener)
            .instrument(span)
            .await
    }

    /// Validate without scoring or scheduling; used to preview a collection
    pub fn validate_batch(&self, records: &[RawRecord], platform: Platform) -> Result<BatchValidationSummary> {
        self.ensure_supported(platform)?;

        let mut results = Vec::with_capacity(records.len());
        for (index, raw) in records.iter().enumerate() {
            let result = match self.normalizer.normalize(raw, platform) {
                Ok(NormalizedFields { record, .. }) => {
                    let record = identity::attach_identity(record);
                    self.validator.validate_with_raw(raw, &record, platform)?
                }
                Err(e) => ValidationResult::structural_failure(fallback_id(raw, index), e.to_string()),
            };
            results.push(result);
        }

        let valid_books = results.iter().filter(|r| r.is_valid()).count();
        Ok(BatchValidationSummary {
            total: records.len(),
            valid_books,
            invalid_books: records.len() - valid_books,
            results,
        })
    }

    /// Run groups strictly in priority order (`Urgent` first). Groups of equal priority
    /// keep their submitted order. Stops after a group ends cancelled or failed.
    pub async fn process_with_priority(
        &self,
        mut groups: Vec<PriorityGroup>,
        platform: Platform,
        options: BatchOptions,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<Vec<BatchReport>> {
        options.check()?;
        self.ensure_supported(platform)?;
        groups.sort_by_key(|g| g.priority);

        let base_id = options
            .batch_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut reports = Vec::with_capacity(groups.len());
        for (i, group) in groups.into_iter().enumerate() {
            let group_options = BatchOptions {
                batch_id: Some(format!("{}-{}-{}", base_id, i, group.priority.as_str())),
                priority: group.priority,
                ..options.clone()
            };
            let report = self
                .process_batch(group.records, platform, group_options, listener.clone())
                .await?;
            let stop = matches!(report.state, JobState::Cancelled | JobState::Failed);
            reports.push(report);
            if stop {
                info!(batch_id = %base_id, "Priority run stopped early");
                break;
            }
        }
        Ok(reports)
    }

    /// Run independent named batches concurrently, at most `max_parallel_batches` at a time.
    /// Each batch keeps its own worker pool; reports come back sorted by name.
    pub async fn process_parallel(
        self: &Arc<Self>,
        batches: Vec<NamedBatch>,
        options: BatchOptions,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<Vec<(String, BatchReport)>> {
        options.check()?;
        let mut seen = std::collections::HashSet::new();
        for batch in &batches {
            self.ensure_supported(batch.platform)?;
            if !seen.insert(batch.name.as_str()) {
                return Err(BatchError::DuplicateBatch(batch.name.clone()).into());
            }
        }

        let permits = Arc::new(Semaphore::new(options.max_parallel_batches));
        let mut set = JoinSet::new();
        for batch in batches {
            let coordinator = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let listener = Arc::clone(&listener);
            let batch_options = BatchOptions {
                batch_id: Some(match &options.batch_id {
                    Some(prefix) => format!("{}-{}", prefix, batch.name),
                    None => batch.name.clone(),
                }),
                ..options.clone()
            };
            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| BatchError::Aborted(e.to_string()))?;
                let report = coordinator
                    .process_batch(batch.records, batch.platform, batch_options, listener)
                    .await?;
                Ok::<_, ReconcileError>((batch.name, report))
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| BatchError::Aborted(e.to_string()))?;
            reports.push(outcome?);
        }
        reports.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(reports)
    }

    /// Stop dequeuing new records. Records already in flight still complete.
    pub fn pause(&self, batch_id: &str) -> Result<()> {
        let handle = self.handle(batch_id)?;
        let mut progress = lock(&handle.progress);
        if progress.state == JobState::Paused {
            return Ok(());
        }
        handle.transition(&mut progress, JobState::Paused)?;
        handle.control.send_replace(Control::Pause);
        info!(batch_id, processed = progress.processed, "Batch paused");
        Ok(())
    }

    pub fn resume(&self, batch_id: &str) -> Result<()> {
        let handle = self.handle(batch_id)?;
        let mut progress = lock(&handle.progress);
        if progress.state == JobState::Processing {
            return Ok(());
        }
        handle.transition(&mut progress, JobState::Processing)?;
        handle.control.send_replace(Control::Run);
        info!(batch_id, processed = progress.processed, "Batch resumed");
        Ok(())
    }

    /// Cancel a batch. Once this returns the batch is `Cancelled` and emits no more
    /// progress events; its report keeps whatever finished before.
    pub fn cancel(&self, batch_id: &str) -> Result<()> {
        let handle = self.handle(batch_id)?;
        let mut progress = lock(&handle.progress);
        if progress.state == JobState::Cancelled {
            return Ok(());
        }
        handle.transition(&mut progress, JobState::Cancelled)?;
        handle.control.send_replace(Control::Cancel);
        info!(batch_id, processed = progress.processed, "Batch cancelled");
        Ok(())
    }

    pub fn status(&self, batch_id: &str) -> Result<BatchStatus> {
        Ok(self.handle(batch_id)?.status())
    }

    /// Ids of batches that are pending, processing or paused
    pub fn active_batches(&self) -> Vec<String> {
        let jobs = lock(&self.jobs);
        let mut ids: Vec<String> = jobs
            .values()
            .filter(|h| !lock(&h.progress).state.is_terminal())
            .map(|h| h.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop bookkeeping for finished batches, returning how many were removed
    pub fn prune_finished(&self) -> usize {
        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|_, h| !lock(&h.progress).state.is_terminal());
        before - jobs.len()
    }

    /// Trend over the averages of recently completed batches for `platform`
    pub fn quality_trend(&self, platform: Platform) -> QualityTrend {
        let values = lock(&self.history)
            .get(&platform)
            .map(QualityHistory::values)
            .unwrap_or_default();
        self.analyzer.trend(&values)
    }

    fn ensure_supported(&self, platform: Platform) -> Result<()> {
        if self.validator.supports(platform) {
            Ok(())
        } else {
            Err(ReconcileError::UnknownPlatform(platform.to_string()))
        }
    }

    fn handle(&self, batch_id: &str) -> Result<Arc<BatchHandle>> {
        lock(&self.jobs)
            .get(batch_id)
            .cloned()
            .ok_or_else(|| BatchError::UnknownBatch(batch_id.to_string()).into())
    }

    /// A finished batch's id may be reused; a live one may not
    fn register(&self, batch_id: &str, total: usize) -> Result<Arc<BatchHandle>> {
        let mut jobs = lock(&self.jobs);
        if let Some(existing) = jobs.get(batch_id) {
            if !lock(&existing.progress).state.is_terminal() {
                return Err(BatchError::DuplicateBatch(batch_id.to_string()).into());
            }
        }
        let handle = Arc::new(BatchHandle::new(batch_id.to_string(), total));
        jobs.insert(batch_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    async fn run(
        &self,
        handle: Arc<BatchHandle>,
        records: Vec<RawRecord>,
        platform: Platform,
        options: &BatchOptions,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        let total = records.len();
        {
            let mut progress = lock(&handle.progress);
            handle.transition(&mut progress, JobState::Processing)?;
            listener.on_progress(&ProgressEvent::new(&handle.id, 0, total, None));
        }
        let _abandon = AbandonGuard {
            handle: Arc::clone(&handle),
            started,
        };
        metrics::batch::started(platform.as_str());
        info!("Batch started");

        let chunks: VecDeque<Range<usize>> = (0..total)
            .step_by(options.chunk_size)
            .map(|start| start..(start + options.chunk_size).min(total))
            .collect();
        let worker_count = options.max_concurrency.min(chunks.len());
        let queue = Arc::new(Mutex::new(chunks));
        let records = Arc::new(records);
        let deadline = options.deadline.map(|d| tokio::time::Instant::now() + d);

        let mut set = JoinSet::new();
        for _ in 0..worker_count {
            let worker = Worker {
                handle: Arc::clone(&handle),
                control: handle.control.subscribe(),
                queue: Arc::clone(&queue),
                records: Arc::clone(&records),
                listener: Arc::clone(&listener),
                normalizer: Arc::clone(&self.normalizer),
                validator: Arc::clone(&self.validator),
                analyzer: Arc::clone(&self.analyzer),
                platform,
                strict: options.strict || self.validator.is_strict(),
                fail_fast: options.fail_fast,
                deadline,
            };
            set.spawn(worker.run());
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Batch worker aborted: {}", e);
            }
        }

        let (state, processed, results, failures) = {
            let mut progress = lock(&handle.progress);
            if progress.state.is_active() && progress.processed == total {
                handle.transition(&mut progress, JobState::Completed)?;
                listener.on_progress(&ProgressEvent::new(&handle.id, total, total, None));
            } else if progress.state.is_active() {
                // Only reachable if a worker panicked and left records unprocessed
                handle.transition(&mut progress, JobState::Cancelled)?;
                handle.control.send_replace(Control::Cancel);
            }
            (
                progress.state,
                progress.processed,
                std::mem::take(&mut progress.results),
                progress.failures.clone(),
            )
        };

        let individual_results: Vec<RecordResult> = results.into_values().collect();
        let valid_books = individual_results.iter().filter(|r| r.is_valid()).count();
        let scores: Vec<QualityScore> = individual_results
            .iter()
            .filter_map(|r| r.quality.clone())
            .collect();
        let quality_summary = self.analyzer.score_batch(&scores);

        if state == JobState::Completed && !scores.is_empty() {
            lock(&self.history)
                .entry(platform)
                .or_insert_with(|| QualityHistory::new(QUALITY_HISTORY_CAPACITY))
                .push(quality_summary.average);
            metrics::quality::batch_average(platform.as_str(), quality_summary.average);
        }

        let elapsed = started.elapsed();
        metrics::batch::finished(state.as_str(), elapsed.as_secs_f64());
        info!(
            state = %state,
            processed,
            valid = valid_books,
            failures = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch finished"
        );

        Ok(BatchReport {
            batch_id: handle.id.clone(),
            platform,
            state,
            total_books: total,
            processed_books: processed,
            valid_books,
            invalid_books: processed - valid_books,
            average_quality_score: quality_summary.average,
            quality_summary,
            individual_results,
            failures,
            processing_time_ms: elapsed.as_millis() as u64,
        })
    }
}

struct Worker {
    handle: Arc<BatchHandle>,
    control: watch::Receiver<Control>,
    queue: Arc<Mutex<VecDeque<Range<usize>>>>,
    records: Arc<Vec<RawRecord>>,
    listener: Arc<dyn ProgressListener>,
    normalizer: Arc<dyn Normalizer>,
    validator: Arc<ValidationEngine>,
    analyzer: Arc<QualityAnalyzer>,
    platform: Platform,
    strict: bool,
    fail_fast: bool,
    deadline: Option<tokio::time::Instant>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let next = lock(&*self.queue).pop_front();
            let Some(chunk) = next else {
                return;
            };
            for index in chunk {
                if !self.wait_until_runnable().await {
                    return;
                }
                let result = self.process_record(index);
                if !self.commit(result) {
                    return;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    /// Block while paused. False once the batch is cancelled or out of time.
    async fn wait_until_runnable(&mut self) -> bool {
        loop {
            if self.deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
                self.handle.expire();
                return false;
            }
            match *self.control.borrow_and_update() {
                Control::Run => return true,
                Control::Cancel => return false,
                Control::Pause => {}
            }
            let changed = match self.deadline {
                Some(at) => tokio::select! {
                    changed = self.control.changed() => changed.is_ok(),
                    _ = tokio::time::sleep_until(at) => true,
                },
                None => self.control.changed().await.is_ok(),
            };
            if !changed {
                return false;
            }
        }
    }

    fn process_record(&self, index: usize) -> RecordResult {
        let raw = &self.records[index];
        let NormalizedFields { record, warnings } = match self.normalizer.normalize(raw, self.platform) {
            Ok(normalized) => normalized,
            Err(e) => {
                metrics::normalize::structural_error();
                let source_id = fallback_id(raw, index);
                return RecordResult {
                    index,
                    validation: ValidationResult::structural_failure(source_id.clone(), e.to_string()),
                    source_id,
                    cross_platform_id: None,
                    record: None,
                    quality: None,
                    normalization_warnings: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };
        metrics::normalize::record_normalized(self.platform.as_str());
        metrics::normalize::warnings_logged(warnings.len());

        let record = identity::attach_identity(record);
        let validation = match self.validator.check(raw, &record, self.platform, self.strict) {
            Ok(validation) => validation,
            Err(e) => {
                return RecordResult {
                    index,
                    source_id: record.source_id.clone(),
                    cross_platform_id: Some(record.cross_platform_id.clone()),
                    validation: ValidationResult::structural_failure(record.record_id(), e.to_string()),
                    record: Some(record),
                    quality: None,
                    normalization_warnings: warnings,
                    error: Some(e.to_string()),
                };
            }
        };
        metrics::validation::record_validated(
            validation.is_valid(),
            validation.errors().len(),
            validation.warnings().len(),
        );

        let quality = self.analyzer.score_record(&record, &validation);
        metrics::quality::score_recorded(quality.overall_score);

        RecordResult {
            index,
            source_id: record.source_id.clone(),
            cross_platform_id: Some(record.cross_platform_id.clone()),
            record: Some(record),
            validation,
            quality: Some(quality),
            normalization_warnings: warnings,
            error: None,
        }
    }

    /// Publish one result. False when the worker should stop.
    fn commit(&self, result: RecordResult) -> bool {
        let mut progress = lock(&self.handle.progress);
        if progress.state.is_terminal() {
            return false;
        }

        let failure = result.failure();
        let label = result.label();
        progress.results.insert(result.index, result);
        progress.processed += 1;
        metrics::batch::record_processed();

        self.listener.on_progress(&ProgressEvent::new(
            &self.handle.id,
            progress.processed,
            self.handle.total,
            Some(label),
        ));

        let Some(failure) = failure else {
            return true;
        };
        metrics::batch::record_failed();
        debug!(index = failure.index, kind = ?failure.kind, "Record failed: {}", failure.message);
        progress.failures.push(failure);

        if self.fail_fast && self.handle.transition(&mut progress, JobState::Failed).is_ok() {
            warn!(processed = progress.processed, "Fail-fast batch stopped on first failure");
            self.handle.control.send_replace(Control::Cancel);
            return false;
        }
        true
    }
}

fn fallback_id(raw: &RawRecord, index: usize) -> String {
    raw.as_object()
        .and_then(|data| fields::lookup(data, fields::ID))
        .map(|v| match v.as_str() {
            Some(s) => s.trim().to_string(),
            None => v.to_string(),
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("#{}", index))
}
