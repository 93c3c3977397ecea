//! # App Error Types
//!
//! What callers of the data layer see when a write fails.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Flow in Ward Sync                              │
//! │                                                                         │
//! │  Data::patients().add(..)                                              │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  Validation failed? ─── ValidationError ──────────┐                    │
//! │         │                                          │                    │
//! │         ▼                                          ▼                    │
//! │  Store apply failed? ─── StoreError ──────► MutationError ──► AppError │
//! │         │                                          ▲                    │
//! │         ▼                                          │                    │
//! │  Outbox append failed? ─── DbError ────────────────┘                    │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  Ok(MutationReceipt) ── push outcome arrives later on the receipt      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Remote rejections never surface here: they arrive as
//! `PushOutcome::RolledBack` plus a toast on the event bus.

use serde::Serialize;
use thiserror::Error;

use ward_core::{Collection, CoreError, ValidationError};
use ward_db::DbError;
use ward_sync::SyncError;

// =============================================================================
// Store Error
// =============================================================================

/// A store operation could not be applied. The snapshot is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: Collection, id: String },

    #[error("{collection}/{id} already exists")]
    AlreadyExists { collection: Collection, id: String },

    /// The resulting document is not a valid record.
    #[error("Invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidRecord { id, reason } => StoreError::InvalidRecord { id, reason },
            other => StoreError::InvalidRecord {
                id: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

// =============================================================================
// Mutation Error
// =============================================================================

/// A write was refused before it reached the remote store.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The payload failed collection validation. Nothing was applied.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The optimistic apply failed and was rolled back.
    #[error("Local apply failed: {0}")]
    LocalApply(#[from] StoreError),

    /// The outbox append failed; the optimistic apply was rolled back.
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// The orchestrator has been shut down.
    #[error("Mutation orchestrator is shut down")]
    ShuttingDown,
}

/// Result type for data layer writes.
pub type MutationResult<T> = Result<T, MutationError>;

// =============================================================================
// App Error
// =============================================================================

/// Serializable error for the UI layer.
///
/// ```json
/// {
///   "code": "VALIDATION_ERROR",
///   "message": "name is required"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppError {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,
}

/// Error codes for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    ValidationError,
    DatabaseError,
    SyncError,
    /// The remote store permanently rejected a change.
    SaveFailed,
    Internal,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        AppError {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::new(ErrorCode::ValidationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AppError::new(ErrorCode::Internal, message)
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::validation(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => AppError::new(ErrorCode::NotFound, err.to_string()),
            StoreError::AlreadyExists { .. } | StoreError::InvalidRecord { .. } => {
                AppError::validation(err.to_string())
            }
        }
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { .. } => AppError::new(ErrorCode::NotFound, err.to_string()),
            other => {
                tracing::error!(error = %other, "Database operation failed");
                AppError::new(ErrorCode::DatabaseError, "Database operation failed")
            }
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Remote(ref e) if e.is_fatal() => {
                AppError::new(ErrorCode::SaveFailed, err.to_string())
            }
            other => AppError::new(ErrorCode::SyncError, other.to_string()),
        }
    }
}

impl From<MutationError> for AppError {
    fn from(err: MutationError) -> Self {
        match err {
            MutationError::Validation(e) => e.into(),
            MutationError::LocalApply(e) => e.into(),
            MutationError::Storage(e) => e.into(),
            MutationError::Sync(e) => e.into(),
            MutationError::ShuttingDown => AppError::internal("Data layer is shutting down"),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

/// Result type for application-level operations.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_validation_code() {
        let err: AppError = MutationError::from(ValidationError::Required {
            field: "name".to_string(),
        })
        .into();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(err.message, "name is required");
    }

    #[test]
    fn test_serializes_screaming_code() {
        let err = AppError::new(ErrorCode::SaveFailed, "denied");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "SAVE_FAILED");
        assert_eq!(json["message"], "denied");
    }

    #[test]
    fn test_store_not_found() {
        let err: AppError = StoreError::NotFound {
            collection: Collection::Tasks,
            id: "t-9".to_string(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("tasks/t-9"));
    }
}
