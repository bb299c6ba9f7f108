//! Error types for engram-core.

use thiserror::Error;

/// Result type alias using engram-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Storage-level error types
#[derive(Error, Debug)]
pub enum Error {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database not found. Set ENGRAM_DB_PATH or run from a directory containing engram.db.")]
    DatabaseNotFound,

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Entity lookup
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
