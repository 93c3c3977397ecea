//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Remote store  │  │     Local storage       │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RemoteError    │  │  DatabaseError          │ │
//! │  │  MissingDeviceId│  │  ├─ fatal       │  │                         │ │
//! │  │  ConfigLoad/Save│  │  └─ transient   │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fatal vs Transient
//! A [`RemoteError`] is fatal when retrying can never succeed: the server
//! refused the write (`permission-denied`) or found it malformed
//! (`invalid-argument`). Everything else is treated as transient and left in
//! the outbox for the flush loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type alias for remote store calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

// =============================================================================
// Remote Error
// =============================================================================

/// Status codes reported by the remote document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteErrorCode {
    PermissionDenied,
    InvalidArgument,
    Unauthenticated,
    NotFound,
    Unavailable,
    DeadlineExceeded,
    Aborted,
    ResourceExhausted,
    Internal,
}

impl RemoteErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteErrorCode::PermissionDenied => "permission-denied",
            RemoteErrorCode::InvalidArgument => "invalid-argument",
            RemoteErrorCode::Unauthenticated => "unauthenticated",
            RemoteErrorCode::NotFound => "not-found",
            RemoteErrorCode::Unavailable => "unavailable",
            RemoteErrorCode::DeadlineExceeded => "deadline-exceeded",
            RemoteErrorCode::Aborted => "aborted",
            RemoteErrorCode::ResourceExhausted => "resource-exhausted",
            RemoteErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned by the remote document store.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        RemoteError {
            code,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::InvalidArgument, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::Unavailable, message)
    }

    /// Returns true if the write must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code,
            RemoteErrorCode::PermissionDenied | RemoteErrorCode::InvalidArgument
        )
    }

    /// Returns true if the write may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        !self.is_fatal()
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering all sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID.
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote store rejected or failed a call.
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Local storage failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Failed to serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync service error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Service is shutting down.
    #[error("Sync service is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ward_db::DbError> for SyncError {
    fn from(err: ward_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_transient(),
            SyncError::DatabaseError(_) | SyncError::ChannelError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RemoteError::permission_denied("rules").is_fatal());
        assert!(RemoteError::invalid_argument("bad field").is_fatal());

        assert!(RemoteError::unavailable("offline").is_transient());
        assert!(RemoteError::new(RemoteErrorCode::DeadlineExceeded, "slow").is_transient());
        assert!(RemoteError::new(RemoteErrorCode::Unauthenticated, "expired").is_transient());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Remote(RemoteError::unavailable("x")).is_retryable());
        assert!(!SyncError::Remote(RemoteError::permission_denied("x")).is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(SyncError::MissingDeviceId.is_config_error());
    }

    #[test]
    fn test_error_display() {
        let err = RemoteError::permission_denied("Missing or insufficient permissions.");
        assert_eq!(
            err.to_string(),
            "permission-denied: Missing or insufficient permissions."
        );
    }
}
