//! Error types for the scene engine

use driverbox_core::CoreError;
use thiserror::Error;

/// Errors raised while storing, scheduling or firing linkEdge rules
#[derive(Error, Debug)]
pub enum LinkEdgeError {
    /// No rule with this id
    #[error("LinkEdge not found: {0}")]
    NotFound(String),

    /// `create` with an id that is already stored
    #[error("LinkEdge id already exists: {0}")]
    AlreadyExists(String),

    /// Id unusable as a file name
    #[error("Invalid linkEdge id: {0:?}")]
    InvalidId(String),

    /// Rule without actions
    #[error("LinkEdge action list cannot be empty")]
    ActionListEmpty,

    /// Cascade of linkEdge actions beyond the allowed depth
    #[error("Execute level is too deep, max depth: {0}")]
    ExecuteTooDeep(usize),

    /// Fired again inside its silent period
    #[error("Execute frequency is too high: {0}")]
    ExecuteTooFrequent(String),

    /// Rule is disabled
    #[error("LinkEdge is disabled: {0}")]
    Disabled(String),

    /// A rule or action condition did not hold
    #[error("Condition mismatch: {0}")]
    ConditionMismatch(String),

    /// Invalid trigger configuration
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Invalid condition configuration
    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    /// Invalid time format
    #[error("Invalid time format: {0}")]
    InvalidTimeFormat(String),

    /// Error from the core cache, shadow or crontab
    #[error(transparent)]
    Core(#[from] CoreError),

    /// IO error (persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LinkEdgeError {
    /// Guard failures that end one firing without being a fault
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::Disabled(_) | Self::ExecuteTooFrequent(_) | Self::ConditionMismatch(_)
        )
    }
}
