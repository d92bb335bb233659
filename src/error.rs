use thiserror::Error;

use crate::pipeline::state::JobState;

/// Raised only when a raw record cannot be treated as a keyed structure at all.
/// Every other anomaly degrades to a blank value plus a warning.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("Record is not a keyed structure (found {found})")]
    NotAnObject { found: &'static str },
}

/// Misuse of the batch coordinator at the call boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("Invalid batch options: {0}")]
    InvalidOptions(String),

    #[error("Unknown batch: {0}")]
    UnknownBatch(String),

    #[error("Batch id already in use: {0}")]
    DuplicateBatch(String),

    #[error("Batch {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: JobState, to: JobState },

    #[error("Batch task aborted: {0}")]
    Aborted(String),
}

/// Misuse of the sync coordinator at the call boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Invalid sync parameters: {0}")]
    InvalidParams(String),

    #[error("Unsupported sync strategy: {0}")]
    UnsupportedStrategy(String),

    #[error("Target collection '{target}' is already being synced by session {holder}")]
    TargetBusy { target: String, holder: String },

    #[error("Unknown sync session: {0}")]
    SessionNotFound(String),

    #[error("Sync session already exists: {0}")]
    SessionExists(String),

    #[error("Session {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: JobState, to: JobState },
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Normalization failed: {0}")]
    Normalization(#[from] NormalizationError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("No rules registered for platform: {0}")]
    UnknownPlatform(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ReconcileError {
    /// Stable upper-snake error code shared with the host application's error table.
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::Normalization(_) => "PARSE_ERROR",
            ReconcileError::Batch(BatchError::InvalidOptions(_)) => "VALIDATION_ERROR",
            ReconcileError::Batch(BatchError::Aborted(_)) => "OPERATION_ERROR",
            ReconcileError::Batch(_) => "BOOK_ERROR",
            ReconcileError::Sync(SyncError::InvalidParams(_))
            | ReconcileError::Sync(SyncError::UnsupportedStrategy(_)) => "VALIDATION_ERROR",
            ReconcileError::Sync(_) => "OPERATION_ERROR",
            ReconcileError::UnknownPlatform(_) | ReconcileError::Config(_) => "CONFIG_ERROR",
            ReconcileError::Io(_) => "STORAGE_ERROR",
            ReconcileError::Json(_) | ReconcileError::Toml(_) => "PARSE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_error_table() {
        let err = ReconcileError::from(NormalizationError::NotAnObject { found: "array" });
        assert_eq!(err.code(), "PARSE_ERROR");

        let err = ReconcileError::from(SyncError::UnsupportedStrategy("smart".to_string()));
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = ReconcileError::from(SyncError::TargetBusy {
            target: "tablet".to_string(),
            holder: "s1".to_string(),
        });
        assert_eq!(err.code(), "OPERATION_ERROR");

        assert_eq!(ReconcileError::UnknownPlatform("nook".to_string()).code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_transition_error_mentions_states() {
        let err = BatchError::InvalidTransition {
            id: "b1".to_string(),
            from: JobState::Completed,
            to: JobState::Processing,
        };
        assert_eq!(err.to_string(), "Batch b1 cannot move from completed to processing");
    }
}
