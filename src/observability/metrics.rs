//! Metrics for the reconciliation pipeline.
//!
//! Recording goes through the `metrics` facade. The library never installs a recorder,
//! so without one every call here is a no-op.

use std::fmt;

/// Enum representing all metric names used in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Normalize metrics
    NormalizeRecordsProcessed,
    NormalizeWarnings,
    NormalizeStructuralErrors,

    // Validation metrics
    ValidationRecordsValid,
    ValidationRecordsInvalid,
    ValidationIssues,

    // Quality metrics
    QualityScore,
    QualityBatchAverage,

    // Batch metrics
    BatchStarted,
    BatchFinished,
    BatchRecordsProcessed,
    BatchRecordFailures,
    BatchDuration,

    // Sync metrics
    SyncSessionsFinished,
    SyncConflicts,
    SyncRecordsMerged,
    SyncTargetBusy,
    SyncDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::NormalizeRecordsProcessed => "bookshelf_normalize_records_processed_total",
            MetricName::NormalizeWarnings => "bookshelf_normalize_warnings_total",
            MetricName::NormalizeStructuralErrors => "bookshelf_normalize_structural_errors_total",

            MetricName::ValidationRecordsValid => "bookshelf_validation_records_valid_total",
            MetricName::ValidationRecordsInvalid => "bookshelf_validation_records_invalid_total",
            MetricName::ValidationIssues => "bookshelf_validation_issues_total",

            MetricName::QualityScore => "bookshelf_quality_score",
            MetricName::QualityBatchAverage => "bookshelf_quality_batch_average",

            MetricName::BatchStarted => "bookshelf_batch_started_total",
            MetricName::BatchFinished => "bookshelf_batch_finished_total",
            MetricName::BatchRecordsProcessed => "bookshelf_batch_records_processed_total",
            MetricName::BatchRecordFailures => "bookshelf_batch_record_failures_total",
            MetricName::BatchDuration => "bookshelf_batch_duration_seconds",

            MetricName::SyncSessionsFinished => "bookshelf_sync_sessions_finished_total",
            MetricName::SyncConflicts => "bookshelf_sync_conflicts_total",
            MetricName::SyncRecordsMerged => "bookshelf_sync_records_merged_total",
            MetricName::SyncTargetBusy => "bookshelf_sync_target_busy_total",
            MetricName::SyncDuration => "bookshelf_sync_duration_seconds",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Normalize Metrics
// ============================================================================

pub mod normalize {
    use super::MetricName;

    /// Record that a record was normalized for a platform
    pub fn record_normalized(platform: &str) {
        ::metrics::counter!(MetricName::NormalizeRecordsProcessed.as_str(), "platform" => platform.to_string())
            .increment(1);
    }

    pub fn warnings_logged(count: usize) {
        if count > 0 {
            ::metrics::counter!(MetricName::NormalizeWarnings.as_str()).increment(count as u64);
        }
    }

    pub fn structural_error() {
        ::metrics::counter!(MetricName::NormalizeStructuralErrors.as_str()).increment(1);
    }
}

// ============================================================================
// Validation Metrics
// ============================================================================

pub mod validation {
    use super::MetricName;

    /// Record the outcome of validating one record
    pub fn record_validated(is_valid: bool, errors: usize, warnings: usize) {
        let name = if is_valid {
            MetricName::ValidationRecordsValid
        } else {
            MetricName::ValidationRecordsInvalid
        };
        ::metrics::counter!(name.as_str()).increment(1);

        if errors > 0 {
            ::metrics::counter!(MetricName::ValidationIssues.as_str(), "severity" => "error").increment(errors as u64);
        }
        if warnings > 0 {
            ::metrics::counter!(MetricName::ValidationIssues.as_str(), "severity" => "warning")
                .increment(warnings as u64);
        }
    }
}

// ============================================================================
// Quality Metrics
// ============================================================================

pub mod quality {
    use super::MetricName;

    pub fn score_recorded(score: f64) {
        ::metrics::histogram!(MetricName::QualityScore.as_str()).record(score);
    }

    pub fn batch_average(platform: &str, average: f64) {
        ::metrics::gauge!(MetricName::QualityBatchAverage.as_str(), "platform" => platform.to_string()).set(average);
    }
}

// ============================================================================
// Batch Metrics
// ============================================================================

pub mod batch {
    use super::MetricName;

    pub fn started(platform: &str) {
        ::metrics::counter!(MetricName::BatchStarted.as_str(), "platform" => platform.to_string()).increment(1);
    }

    pub fn record_processed() {
        ::metrics::counter!(MetricName::BatchRecordsProcessed.as_str()).increment(1);
    }

    pub fn record_failed() {
        ::metrics::counter!(MetricName::BatchRecordFailures.as_str()).increment(1);
    }

    /// Record the terminal state and wall time of a batch
    pub fn finished(state: &str, secs: f64) {
        ::metrics::counter!(MetricName::BatchFinished.as_str(), "state" => state.to_string()).increment(1);
        ::metrics::histogram!(MetricName::BatchDuration.as_str()).record(secs);
    }
}

// ============================================================================
// Sync Metrics
// ============================================================================

pub mod sync {
    use super::MetricName;

    pub fn target_busy() {
        ::metrics::counter!(MetricName::SyncTargetBusy.as_str()).increment(1);
    }

    /// Record a finished (non dry-run) session
    pub fn session_finished(strategy: &str, state: &str, merged: usize, conflicts: usize, secs: f64) {
        ::metrics::counter!(
            MetricName::SyncSessionsFinished.as_str(),
            "strategy" => strategy.to_string(),
            "state" => state.to_string()
        )
        .increment(1);
        ::metrics::counter!(MetricName::SyncRecordsMerged.as_str()).increment(merged as u64);
        ::metrics::counter!(MetricName::SyncConflicts.as_str()).increment(conflicts as u64);
        ::metrics::histogram!(MetricName::SyncDuration.as_str()).record(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_share_prefix() {
        for name in [
            MetricName::NormalizeRecordsProcessed,
            MetricName::ValidationIssues,
            MetricName::QualityScore,
            MetricName::BatchDuration,
            MetricName::SyncConflicts,
        ] {
            assert!(name.as_str().starts_with("bookshelf_"), "{name}");
        }
    }

    #[test]
    fn test_recording_without_recorder_is_a_noop() {
        batch::started("kobo");
        batch::finished("completed", 0.5);
        sync::session_finished("merge", "completed", 3, 1, 0.01);
    }
}
