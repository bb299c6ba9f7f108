//! Engine error types.
//!
//! Detected anomalies are not errors. A suspicious confidence/occurrence
//! combination produces an `AnomalySignal` routed to the review queue
//! (see `pattern::confidence`); the operation that raised it still
//! succeeds.

use thiserror::Error;

/// Result type alias using EngineError
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A specific structural invariant that failed pre-commit validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvariantViolation {
    #[error("active conversation count {count} exceeds maximum {max}")]
    ActiveCountExceeded { count: u32, max: u32 },

    #[error("active queue positions {found:?} are not a permutation of 1..={count}")]
    QueuePositionsNotPermutation { count: u32, found: Vec<u32> },

    #[error("conversation {id} is {status} but holds queue position {position}")]
    PositionOnInactive {
        id: String,
        status: String,
        position: u32,
    },

    #[error("conversation {conversation_id} sequence numbers are not contiguous: {detail}")]
    SequenceNotContiguous {
        conversation_id: String,
        detail: String,
    },

    #[error(
        "conversation {conversation_id} records {recorded} messages but {actual} are stored"
    )]
    MessageCountMismatch {
        conversation_id: String,
        recorded: u32,
        actual: u32,
    },

    #[error("unrecognized {field} value '{value}' on {entity} {id}")]
    UnrecognizedValue {
        entity: &'static str,
        id: String,
        field: &'static str,
        value: String,
    },

    #[error("{entity} {id} confidence {value} is outside [0, 1]")]
    ConfidenceOutOfBounds {
        entity: &'static str,
        id: String,
        value: f64,
    },

    #[error(
        "pattern {id} holds confidence {confidence} with usage_count {usage_count}, above the occurrence gate ceiling {ceiling}"
    )]
    OccurrenceGateBreached {
        id: String,
        confidence: f64,
        usage_count: u32,
        ceiling: f64,
    },

    #[error("{entity} {id} references missing {referenced}")]
    DanglingReference {
        entity: &'static str,
        id: String,
        referenced: String,
    },
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An invariant was violated pre-commit; the mutation was rolled back.
    #[error("validation failed: {0}")]
    Validation(#[from] InvariantViolation),

    /// Internal sequence bookkeeping disagrees with stored messages.
    #[error(
        "sequence bookkeeping inconsistent for conversation {conversation_id}: expected next {expected}, stored max {found}"
    )]
    SequenceGap {
        conversation_id: String,
        expected: u32,
        found: u32,
    },

    /// The pre-mutation backup could not be taken; nothing was applied.
    #[error("backup failed, mutation aborted: {reason}")]
    BackupFailure { reason: String },

    /// Rollback itself failed. The store is in an unknown state and its
    /// writes are halted until cleared manually.
    #[error("rollback failed on {tier} store, manual intervention required: {reason}")]
    RollbackFailure { tier: &'static str, reason: String },

    /// A previous rollback failure halted this store's writes.
    #[error("writes to {tier} store are halted after a rollback failure; clear_halt() required")]
    WritesHalted { tier: &'static str },

    /// Rejected lifecycle transition (anomaly review, conversation status).
    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error(transparent)]
    Core(#[from] engram_core::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Check if this error is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Check if this error is a rollback failure
    pub fn is_rollback_failure(&self) -> bool {
        matches!(self, Self::RollbackFailure { .. })
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
