//! Error kinds surfaced by the memory engine.
//!
//! Search never returns the degradation kinds (`ProviderUnavailable`,
//! `CorruptIndexArtifact`, `Timeout`) to its caller; they are turned into a
//! `degraded` response. Writes surface them so the connector can retry.

use std::time::Duration;

/// Errors produced by the stores, the index and the engine façade.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("corrupt index artifact for conversation '{conversation_id}': {reason}")]
    CorruptIndexArtifact {
        conversation_id: String,
        reason: String,
    },

    #[error("duplicate write: {0}")]
    DuplicateWrite(String),

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

impl MemoryError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn timeout(operation: &'static str, elapsed: Duration) -> Self {
        Self::Timeout { operation, elapsed }
    }

    /// True for the fatal class that must halt writes for a conversation.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::StorageFailure(_))
    }

    /// True for failures that degrade a search instead of failing it.
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::CorruptIndexArtifact { .. } | Self::Timeout { .. }
        )
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        if let rusqlite::Error::SqliteFailure(ffi_err, _) = &err {
            match ffi_err.code {
                ErrorCode::DiskFull
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::ReadOnly
                | ErrorCode::NotADatabase => {
                    return Self::StorageFailure(err.to_string());
                }
                _ => {}
            }
        }
        Self::Database(err)
    }
}

impl From<bincode::Error> for MemoryError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
