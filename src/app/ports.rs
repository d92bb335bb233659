use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{BookRecord, Platform, RawRecord};
use crate::pipeline::processing::validation::rules::{FieldRequirement, RuleSet};

/// Source of per-platform validation rules
pub trait RuleProvider: Send + Sync {
    fn rules_for_platform(&self, platform: Platform) -> Option<RuleSet>;
    fn is_rule_supported(&self, platform: Platform, rule_name: &str) -> bool;
    fn field_requirements(&self, platform: Platform) -> Vec<FieldRequirement>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub batch_id: String,
    pub processed: usize,
    pub total: usize,
    pub percentage: f64,
    pub current_item: Option<String>,
}

impl ProgressEvent {
    pub fn new(batch_id: &str, processed: usize, total: usize, current_item: Option<String>) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            processed as f64 * 100.0 / total as f64
        };
        Self {
            batch_id: batch_id.to_string(),
            processed,
            total,
            percentage,
            current_item,
        }
    }
}

/// Receives batch progress. Called from worker tasks, so implementations must be cheap
/// and must not call back into the coordinator that is reporting.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

pub struct NoopProgressListener;

impl ProgressListener for NoopProgressListener {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

// Persistence side, used by the host flow around the sync coordinator
#[async_trait]
pub trait RecordStorePort: Send + Sync {
    async fn get_records(&self, collection: &str) -> anyhow::Result<Vec<RawRecord>>;
    async fn store_records(&self, collection: &str, records: &[BookRecord]) -> anyhow::Result<()>;
}
