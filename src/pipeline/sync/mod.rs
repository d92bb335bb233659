//! Reconciliation of two processed collections into one authoritative collection.
//!
//! The merged collection is built off to the side and swapped into the target in one
//! step, so readers of a [`Collection`] see either the old or the new records, never a
//! mix. Only one non-dry-run session may hold a target at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{btree_map::Entry, BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SyncSettings;
use crate::domain::BookRecord;
use crate::error::{Result, SyncError};
use crate::observability::metrics;
use crate::pipeline::lock;
use crate::pipeline::processing::identity;
use crate::pipeline::state::JobState;

/// Ids reconciled between cancellation checks
const YIELD_EVERY: usize = 64;
/// Sessions that feed the moving throughput average
const THROUGHPUT_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Keep records from both sides, resolving divergent copies field by field
    Merge,
    /// Replace the target with the source, reporting every id that changed
    Overwrite,
}

impl SyncStrategy {
    pub const SUPPORTED: [SyncStrategy; 2] = [SyncStrategy::Merge, SyncStrategy::Overwrite];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Merge => "merge",
            SyncStrategy::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(SyncStrategy::Merge),
            "overwrite" => Ok(SyncStrategy::Overwrite),
            _ => Err(SyncError::UnsupportedStrategy(s.to_string())),
        }
    }
}

/// A named, shareable collection of processed records
#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    records: Arc<RwLock<Arc<Vec<BookRecord>>>>,
}

impl Collection {
    pub fn new(name: impl Into<String>, records: Vec<BookRecord>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(RwLock::new(Arc::new(records))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current records. Later publishes do not affect a snapshot already taken.
    pub fn snapshot(&self) -> Arc<Vec<BookRecord>> {
        Arc::clone(&self.records.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn publish(&self, records: Vec<BookRecord>) {
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(records);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncParams {
    pub session_id: String,
    pub source: String,
    pub target: String,
    pub strategy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Reaching the deadline cancels the session
    pub deadline: Option<Duration>,
}

/// A divergent pair and how it was resolved. Never produced silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: String,
    /// Target-side record before the session
    pub before: BookRecord,
    /// Source-side record
    pub incoming: BookRecord,
    pub after: BookRecord,
    pub resolution: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookCount {
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataIntegrity {
    pub verified: bool,
    pub score: f64,
    pub issues: Vec<String>,
    pub checksum_before: String,
    pub checksum_after: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTiming {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub session_id: String,
    pub strategy: SyncStrategy,
    pub dry_run: bool,
    pub state: JobState,
    pub success: bool,
    /// Target-only records kept
    pub exported: usize,
    /// Source-only records added
    pub imported: usize,
    /// Ids whose fingerprints already matched
    pub skipped: usize,
    /// Same-id duplicates folded together inside one input
    pub duplicates_collapsed: usize,
    pub conflicts: Vec<SyncConflict>,
    /// Ids added, removed or modified relative to the target
    pub changed_ids: Vec<String>,
    pub book_count: BookCount,
    pub data_integrity: DataIntegrity,
    pub timing: SyncTiming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: String,
    pub source: Option<String>,
    pub target: Option<String>,
    pub strategy: Option<SyncStrategy>,
    pub dry_run: bool,
    pub state: JobState,
    pub conflicts: Vec<SyncConflict>,
    pub history: Vec<StateChange>,
    pub created_at: DateTime<Utc>,
}

impl SyncSession {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            source: None,
            target: None,
            strategy: None,
            dry_run: false,
            state: JobState::Pending,
            conflicts: Vec::new(),
            history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: JobState) -> std::result::Result<(), SyncError> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.history.push(StateChange {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub session_id: String,
    pub state: JobState,
    pub processed: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub session_id: String,
    pub source: String,
    pub target: String,
    pub strategy: SyncStrategy,
    pub state: JobState,
    pub dry_run: bool,
    pub conflicts: usize,
    pub records: usize,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEstimate {
    pub record_count: usize,
    pub throughput_per_ms: f64,
    pub estimated_ms: u64,
    /// False when no session has finished yet and the configured default was used
    pub based_on_history: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    pub total_sessions: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub dry_runs: usize,
    pub total_conflicts: usize,
    /// Moving average over recent non-dry-run sessions, in records per millisecond
    pub average_throughput_per_ms: Option<f64>,
}

#[derive(Default)]
struct SessionControl {
    cancelled: AtomicBool,
    processed: AtomicUsize,
    total: AtomicUsize,
}

struct SessionSlot {
    session: SyncSession,
    control: Arc<SessionControl>,
}

#[derive(Default)]
struct StatsAccumulator {
    stats: SyncStatistics,
    throughputs: VecDeque<f64>,
}

type TargetLocks = Arc<Mutex<HashMap<String, String>>>;

/// Holds a target collection for one session; released on drop
struct TargetLease {
    locks: TargetLocks,
    target: String,
    session_id: String,
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        let mut locks = lock(&*self.locks);
        if locks.get(&self.target) == Some(&self.session_id) {
            locks.remove(&self.target);
        }
    }
}

/// Output of one reconciliation pass
struct Plan {
    records: Vec<BookRecord>,
    conflicts: Vec<SyncConflict>,
    changed_ids: Vec<String>,
    imported: usize,
    exported: usize,
    skipped: usize,
    duplicates_collapsed: usize,
    expected_count: usize,
}

/// Runs and tracks sync sessions between collections
pub struct SyncCoordinator {
    settings: SyncSettings,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    active_targets: TargetLocks,
    history: Mutex<VecDeque<SyncHistoryEntry>>,
    stats: Mutex<StatsAccumulator>,
}

impl SyncCoordinator {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
            active_targets: Arc::new(Mutex::new(HashMap::new())),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(StatsAccumulator::default()),
        }
    }

    /// Register a pending session
    pub fn initialize_sync(&self, session_id: &str) -> Result<SyncSession> {
        if session_id.trim().is_empty() {
            return Err(SyncError::InvalidParams("session id must not be empty".to_string()).into());
        }
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(session_id) {
            return Err(SyncError::SessionExists(session_id.to_string()).into());
        }
        let session = SyncSession::new(session_id);
        sessions.insert(
            session_id.to_string(),
            SessionSlot {
                session: session.clone(),
                control: Arc::new(SessionControl::default()),
            },
        );
        debug!(session_id, "Sync session initialized");
        Ok(session)
    }

    pub fn validate_sync_params(&self, params: &SyncParams) -> Result<SyncStrategy> {
        if params.session_id.trim().is_empty() {
            return Err(SyncError::InvalidParams("session id must not be empty".to_string()).into());
        }
        if params.source.trim().is_empty() || params.target.trim().is_empty() {
            return Err(SyncError::InvalidParams("source and target must be named".to_string()).into());
        }
        if params.source == params.target {
            return Err(SyncError::InvalidParams(format!(
                "source and target are the same collection '{}'",
                params.source
            ))
            .into());
        }
        Ok(params.strategy.parse()?)
    }

    pub fn estimate_sync_time(&self, source: &Collection, target: &Collection, strategy: SyncStrategy) -> SyncEstimate {
        let record_count = match strategy {
            SyncStrategy::Merge => source.len() + target.len(),
            SyncStrategy::Overwrite => source.len().max(target.len()),
        };
        let average = lock(&self.stats).stats.average_throughput_per_ms;
        let throughput_per_ms = average.unwrap_or(self.settings.default_throughput_per_ms);
        SyncEstimate {
            record_count,
            throughput_per_ms,
            estimated_ms: (record_count as f64 / throughput_per_ms).ceil() as u64,
            based_on_history: average.is_some(),
        }
    }

    /// Compute the full result without taking the target lock or writing to the target
    pub async fn dry_run(
        &self,
        session_id: &str,
        source: &Collection,
        target: &Collection,
        strategy: SyncStrategy,
    ) -> Result<SyncResult> {
        let options = SyncOptions {
            dry_run: true,
            deadline: None,
        };
        self.execute_sync(session_id, source, target, strategy, options).await
    }

    /// Reconcile `source` into `target`. Misuse (same collection, busy target, a session
    /// that is not pending) is an error; a cancelled or unverified run is a result with
    /// `success == false` and an untouched target.
    pub async fn execute_sync(
        &self,
        session_id: &str,
        source: &Collection,
        target: &Collection,
        strategy: SyncStrategy,
        options: SyncOptions,
    ) -> Result<SyncResult> {
        if source.name() == target.name() {
            return Err(SyncError::InvalidParams(format!(
                "source and target are the same collection '{}'",
                source.name()
            ))
            .into());
        }

        let (control, lease) = self.begin(session_id, source, target, strategy, options.dry_run)?;
        let span = info_span!(
            "sync",
            session_id,
            source = source.name(),
            target_collection = target.name(),
            strategy = %strategy,
            dry_run = options.dry_run
        );
        let result = self
            .run(session_id, source, target, strategy, &options, control)
            .instrument(span)
            .await;
        drop(lease);
        Ok(result)
    }

    /// Cancel a session. A running session stops at its next check and never publishes.
    pub fn cancel_sync(&self, session_id: &str) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;
        if slot.session.state == JobState::Cancelled {
            return Ok(());
        }
        slot.session.transition(JobState::Cancelled)?;
        slot.control.cancelled.store(true, Ordering::SeqCst);
        info!(session_id, "Sync session cancelled");
        Ok(())
    }

    pub fn get_sync_status(&self, session_id: &str) -> Result<SyncSession> {
        lock(&self.sessions)
            .get(session_id)
            .map(|slot| slot.session.clone())
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()).into())
    }

    pub fn get_sync_progress(&self, session_id: &str) -> Result<SyncProgress> {
        let sessions = lock(&self.sessions);
        let slot = sessions
            .get(session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;
        let processed = slot.control.processed.load(Ordering::SeqCst);
        let total = slot.control.total.load(Ordering::SeqCst);
        let percentage = if total == 0 {
            if slot.session.state == JobState::Completed { 100.0 } else { 0.0 }
        } else {
            processed as f64 * 100.0 / total as f64
        };
        Ok(SyncProgress {
            session_id: session_id.to_string(),
            state: slot.session.state,
            processed,
            total,
            percentage,
        })
    }

    /// Most recent finished sessions, oldest first
    pub fn get_sync_history(&self, limit: Option<usize>) -> Vec<SyncHistoryEntry> {
        let history = lock(&self.history);
        let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
        history.iter().skip(skip).cloned().collect()
    }

    /// Forget a session, cancelling it first if it is still live, and release its target
    pub fn cleanup_sync(&self, session_id: &str) -> Result<()> {
        {
            let mut sessions = lock(&self.sessions);
            let slot = sessions
                .get_mut(session_id)
                .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;
            if !slot.session.state.is_terminal() {
                slot.session.transition(JobState::Cancelled)?;
                slot.control.cancelled.store(true, Ordering::SeqCst);
            }
            sessions.remove(session_id);
        }
        lock(&*self.active_targets).retain(|_, holder| holder.as_str() != session_id);
        debug!(session_id, "Sync session cleaned up");
        Ok(())
    }

    pub fn get_supported_strategies(&self) -> &'static [SyncStrategy] {
        &SyncStrategy::SUPPORTED
    }

    pub fn get_sync_statistics(&self) -> SyncStatistics {
        lock(&self.stats).stats.clone()
    }

    /// Move a pending session to processing, taking the target unless this is a dry run
    fn begin(
        &self,
        session_id: &str,
        source: &Collection,
        target: &Collection,
        strategy: SyncStrategy,
        dry_run: bool,
    ) -> Result<(Arc<SessionControl>, Option<TargetLease>)> {
        if session_id.trim().is_empty() {
            return Err(SyncError::InvalidParams("session id must not be empty".to_string()).into());
        }
        let mut sessions = lock(&self.sessions);
        let slot = sessions.entry(session_id.to_string()).or_insert_with(|| SessionSlot {
            session: SyncSession::new(session_id),
            control: Arc::new(SessionControl::default()),
        });
        if slot.session.state != JobState::Pending {
            return Err(SyncError::InvalidTransition {
                id: session_id.to_string(),
                from: slot.session.state,
                to: JobState::Processing,
            }
            .into());
        }

        let lease = if dry_run {
            None
        } else {
            let mut locks = lock(&*self.active_targets);
            if let Some(holder) = locks.get(target.name()) {
                metrics::sync::target_busy();
                warn!(collection = target.name(), holder = %holder, "Sync target busy, rejecting session {}", session_id);
                return Err(SyncError::TargetBusy {
                    target: target.name().to_string(),
                    holder: holder.clone(),
                }
                .into());
            }
            locks.insert(target.name().to_string(), session_id.to_string());
            Some(TargetLease {
                locks: Arc::clone(&self.active_targets),
                target: target.name().to_string(),
                session_id: session_id.to_string(),
            })
        };

        slot.session.transition(JobState::Processing)?;
        slot.session.source = Some(source.name().to_string());
        slot.session.target = Some(target.name().to_string());
        slot.session.strategy = Some(strategy);
        slot.session.dry_run = dry_run;
        Ok((Arc::clone(&slot.control), lease))
    }

    async fn run(
        &self,
        session_id: &str,
        source: &Collection,
        target: &Collection,
        strategy: SyncStrategy,
        options: &SyncOptions,
        control: Arc<SessionControl>,
    ) -> SyncResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = options.deadline.map(|d| clock + d);

        let source_records = source.snapshot();
        let target_records = target.snapshot();
        let checksum_before = checksum(&target_records);
        info!(source_len = source_records.len(), target_len = target_records.len(), "Sync started");

        let plan = reconcile(&source_records, &target_records, strategy, &control, deadline).await;

        let mut integrity = DataIntegrity {
            verified: false,
            score: 0.0,
            issues: Vec::new(),
            checksum_before: checksum_before.clone(),
            checksum_after: checksum_before,
        };
        let mut counts = BookCount {
            before: target_records.len(),
            after: target_records.len(),
        };

        let state = {
            let mut sessions = lock(&self.sessions);
            let live = sessions
                .get_mut(session_id)
                .filter(|slot| slot.session.state == JobState::Processing);

            match (live, plan.as_ref()) {
                (None, _) => JobState::Cancelled,
                (Some(slot), None) => {
                    if slot.session.transition(JobState::Cancelled).is_err() {
                        warn!("Session left processing before cancellation was recorded");
                    }
                    JobState::Cancelled
                }
                (Some(slot), Some(plan)) => {
                    integrity = verify(plan, integrity.checksum_before.clone());
                    slot.session.conflicts = plan.conflicts.clone();
                    let next = if integrity.verified {
                        if !options.dry_run {
                            target.publish(plan.records.clone());
                        }
                        counts.after = plan.records.len();
                        JobState::Completed
                    } else {
                        warn!(issues = ?integrity.issues, "Merged collection failed integrity check, target left untouched");
                        JobState::Failed
                    };
                    if let Err(e) = slot.session.transition(next) {
                        warn!("Could not record session outcome: {}", e);
                    }
                    next
                }
            }
        };

        let elapsed = clock.elapsed();
        let finished_at = Utc::now();
        let success = state == JobState::Completed;
        let plan = plan.filter(|_| state != JobState::Cancelled);
        let result = SyncResult {
            session_id: session_id.to_string(),
            strategy,
            dry_run: options.dry_run,
            state,
            success,
            exported: plan.as_ref().map_or(0, |p| p.exported),
            imported: plan.as_ref().map_or(0, |p| p.imported),
            skipped: plan.as_ref().map_or(0, |p| p.skipped),
            duplicates_collapsed: plan.as_ref().map_or(0, |p| p.duplicates_collapsed),
            conflicts: plan.as_ref().map(|p| p.conflicts.clone()).unwrap_or_default(),
            changed_ids: plan.as_ref().map(|p| p.changed_ids.clone()).unwrap_or_default(),
            book_count: counts,
            data_integrity: integrity,
            timing: SyncTiming {
                started_at,
                finished_at,
                duration_ms: elapsed.as_millis() as u64,
            },
        };

        let work = source_records.len() + target_records.len();
        self.record_finished(&result, source.name(), target.name(), work, elapsed);
        info!(
            state = %state,
            imported = result.imported,
            exported = result.exported,
            skipped = result.skipped,
            conflicts = result.conflicts.len(),
            elapsed_ms = result.timing.duration_ms,
            "Sync finished"
        );
        result
    }

    fn record_finished(&self, result: &SyncResult, source: &str, target: &str, work: usize, elapsed: Duration) {
        {
            let mut history = lock(&self.history);
            history.push_back(SyncHistoryEntry {
                session_id: result.session_id.clone(),
                source: source.to_string(),
                target: target.to_string(),
                strategy: result.strategy,
                state: result.state,
                dry_run: result.dry_run,
                conflicts: result.conflicts.len(),
                records: result.book_count.after,
                duration_ms: result.timing.duration_ms,
                finished_at: result.timing.finished_at,
            });
            while history.len() > self.settings.history_limit.max(1) {
                history.pop_front();
            }
        }

        let mut acc = lock(&self.stats);
        if result.dry_run {
            acc.stats.dry_runs += 1;
            return;
        }
        acc.stats.total_sessions += 1;
        acc.stats.total_conflicts += result.conflicts.len();
        match result.state {
            JobState::Completed => acc.stats.successful += 1,
            JobState::Cancelled => acc.stats.cancelled += 1,
            _ => acc.stats.failed += 1,
        }
        if result.success && work > 0 {
            let millis = (elapsed.as_secs_f64() * 1000.0).max(0.001);
            acc.throughputs.push_back(work as f64 / millis);
            while acc.throughputs.len() > THROUGHPUT_WINDOW {
                acc.throughputs.pop_front();
            }
            let average = acc.throughputs.iter().sum::<f64>() / acc.throughputs.len() as f64;
            acc.stats.average_throughput_per_ms = Some(average);
        }
        metrics::sync::session_finished(
            result.strategy.as_str(),
            result.state.as_str(),
            result.book_count.after,
            result.conflicts.len(),
            elapsed.as_secs_f64(),
        );
    }
}

fn cancelled(control: &SessionControl, deadline: Option<Instant>) -> bool {
    control.cancelled.load(Ordering::SeqCst) || deadline.is_some_and(|at| Instant::now() >= at)
}

/// Walk the union of ids in order. None when cancelled or out of time.
async fn reconcile(
    source: &[BookRecord],
    target: &[BookRecord],
    strategy: SyncStrategy,
    control: &SessionControl,
    deadline: Option<Instant>,
) -> Option<Plan> {
    let mut conflicts = Vec::new();
    let source = index(source, "source", &mut conflicts);
    let target = index(target, "target", &mut conflicts);
    let refolded = target.refolded;
    let duplicates_collapsed = source.collapsed + target.collapsed;
    let (source, target) = (source.records, target.records);
    let ids: BTreeSet<&String> = source.keys().chain(target.keys()).collect();
    control.total.store(ids.len(), Ordering::SeqCst);

    let mut plan = Plan {
        records: Vec::with_capacity(ids.len()),
        conflicts,
        changed_ids: Vec::new(),
        imported: 0,
        exported: 0,
        skipped: 0,
        duplicates_collapsed,
        expected_count: match strategy {
            SyncStrategy::Merge => ids.len(),
            SyncStrategy::Overwrite => source.len(),
        },
    };

    for (i, id) in ids.iter().enumerate() {
        if i % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
            if cancelled(control, deadline) {
                return None;
            }
        }

        match (strategy, source.get(*id), target.get(*id)) {
            (_, Some(incoming), None) => {
                plan.imported += 1;
                plan.changed_ids.push((*id).clone());
                plan.records.push(incoming.clone());
            }
            (SyncStrategy::Merge, None, Some(existing)) => {
                plan.exported += 1;
                if refolded.contains(*id) {
                    plan.changed_ids.push((*id).clone());
                }
                plan.records.push(existing.clone());
            }
            (SyncStrategy::Overwrite, None, Some(_)) => {
                plan.changed_ids.push((*id).clone());
            }
            (_, Some(incoming), Some(existing)) if incoming.fingerprint == existing.fingerprint => {
                plan.skipped += 1;
                if refolded.contains(*id) {
                    plan.changed_ids.push((*id).clone());
                }
                plan.records.push(existing.clone());
            }
            (SyncStrategy::Merge, Some(incoming), Some(existing)) => {
                let (after, resolution) = resolve(id, incoming, existing);
                if after.fingerprint != existing.fingerprint {
                    plan.changed_ids.push((*id).clone());
                }
                plan.conflicts.push(SyncConflict {
                    id: (*id).clone(),
                    before: existing.clone(),
                    incoming: incoming.clone(),
                    after: after.clone(),
                    resolution,
                });
                plan.records.push(after);
            }
            (SyncStrategy::Overwrite, Some(incoming), Some(_)) => {
                plan.changed_ids.push((*id).clone());
                plan.records.push(incoming.clone());
            }
            (_, None, None) => {}
        }
        control.processed.store(i + 1, Ordering::SeqCst);
    }

    if cancelled(control, deadline) {
        return None;
    }
    Some(plan)
}

/// Records of one side keyed by cross-platform id
struct Indexed {
    records: BTreeMap<String, BookRecord>,
    /// Ids whose folded record differs from every copy the side held
    refolded: BTreeSet<String>,
    collapsed: usize,
}

/// Key records by cross-platform id, folding same-id duplicates with the merge rule.
/// Every fold that changes a record is reported in `folds`.
fn index(records: &[BookRecord], side: &str, folds: &mut Vec<SyncConflict>) -> Indexed {
    let mut indexed = Indexed {
        records: BTreeMap::new(),
        refolded: BTreeSet::new(),
        collapsed: 0,
    };
    for record in records {
        let record = if record.cross_platform_id.is_empty() {
            identity::attach_identity(record.clone())
        } else {
            record.clone()
        };
        match indexed.records.entry(record.cross_platform_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                indexed.collapsed += 1;
                if slot.get().fingerprint == record.fingerprint {
                    continue;
                }
                let (merged, resolution) = resolve(slot.key(), &record, slot.get());
                debug!(id = %slot.key(), side, "Folding same-side duplicate");
                folds.push(SyncConflict {
                    id: slot.key().clone(),
                    before: slot.get().clone(),
                    incoming: record,
                    after: merged.clone(),
                    resolution: format!("same-side duplicate in {}; {}", side, resolution),
                });
                indexed.refolded.insert(slot.key().clone());
                slot.insert(merged);
            }
        }
    }
    indexed
}

/// Resolve a divergent pair. The newer record (by `last_updated`, target on ties) is the
/// base; progress takes the maximum, `is_finished` the logical OR, `last_updated` the
/// latest, and blank optional fields are filled from the other side.
fn resolve(id: &str, incoming: &BookRecord, existing: &BookRecord) -> (BookRecord, String) {
    let incoming_newer = match (incoming.last_updated, existing.last_updated) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    };
    let (base, other) = if incoming_newer {
        (incoming, existing)
    } else {
        (existing, incoming)
    };

    let mut merged = base.clone();
    merged.progress = match (incoming.progress, existing.progress) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    merged.is_finished = incoming.is_finished || existing.is_finished;
    merged.last_updated = incoming.last_updated.max(existing.last_updated);
    merged.last_read = incoming.last_read.max(existing.last_read);
    if merged.publisher.is_none() {
        merged.publisher = other.publisher.clone();
    }
    if merged.isbn.is_none() {
        merged.isbn = other.isbn.clone();
    }
    if merged.cover_url.is_none() {
        merged.cover_url = other.cover_url.clone();
    }
    if merged.book_type.is_none() {
        merged.book_type = other.book_type.clone();
    }
    if merged.authors.is_empty() {
        merged.authors = other.authors.clone();
    }
    merged.cross_platform_id = id.to_string();
    merged.fingerprint = identity::fingerprint(&merged);

    let resolution = format!(
        "base={} ({} {}); progress=max, isFinished=or, lastUpdated=latest",
        if incoming_newer { "source" } else { "target" },
        base.platform,
        base.source_id
    );
    (merged, resolution)
}

fn verify(plan: &Plan, checksum_before: String) -> DataIntegrity {
    let mut issues = Vec::new();
    let actual = plan.records.len();
    let expected = plan.expected_count;
    if actual != expected {
        issues.push(format!("expected {} records after sync, built {}", expected, actual));
    }
    let unique: BTreeSet<&str> = plan.records.iter().map(|r| r.cross_platform_id.as_str()).collect();
    if unique.len() != actual {
        issues.push(format!("{} duplicate ids in merged collection", actual - unique.len()));
    }

    let score = if issues.is_empty() {
        100.0
    } else if actual.max(expected) == 0 {
        0.0
    } else {
        100.0 * unique.len().min(expected) as f64 / actual.max(expected) as f64
    };

    DataIntegrity {
        verified: issues.is_empty(),
        score,
        issues,
        checksum_before,
        checksum_after: checksum(&plan.records),
    }
}

/// SHA-256 over `id:fingerprint` lines sorted by id
pub fn checksum(records: &[BookRecord]) -> String {
    let mut lines: Vec<(&str, &str)> = records
        .iter()
        .map(|r| (r.cross_platform_id.as_str(), r.fingerprint.as_str()))
        .collect();
    lines.sort_unstable();
    let mut hasher = Sha256::new();
    for (id, fingerprint) in lines {
        hasher.update(id.as_bytes());
        hasher.update(b":");
        hasher.update(fingerprint.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
