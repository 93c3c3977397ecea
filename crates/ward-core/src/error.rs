//! # Error Types
//!
//! Domain-specific error types for ward-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  ward-core errors (this file)                                          │
//! │  ├── CoreError        - Parsing and record shape failures              │
//! │  └── ValidationError  - Payload validation failures                    │
//! │                                                                         │
//! │  ward-db errors       └── DbError     - Local storage failures         │
//! │  ward-sync errors     └── SyncError   - Remote/transport failures      │
//! │  ward-app errors      └── AppError    - What the UI sees               │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → AppError → toast / caller         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Collection name not one of patients / tasks / units.
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Outbox operation string could not be parsed.
    #[error("Unknown mutation operation: {0}")]
    UnknownOperation(String),

    /// Outbox status string could not be parsed.
    #[error("Unknown mutation status: {0}")]
    UnknownStatus(String),

    /// A document could not be turned into a record (or back).
    ///
    /// ## When This Occurs
    /// - `createdAt` holds something that is not an RFC 3339 timestamp
    /// - `unitId` is not a string
    /// - The payload is not a JSON object
    #[error("Invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates an InvalidRecord error.
    pub fn invalid_record(id: impl Into<String>, reason: impl ToString) -> Self {
        CoreError::InvalidRecord {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Payload validation errors.
///
/// Raised by the collection wrappers before a mutation reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing, null or blank.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Field holds the wrong JSON type.
    #[error("{field} must be a {expected}")]
    WrongType { field: String, expected: String },

    /// Invalid format (e.g. document id containing a path separator).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// The payload has nothing left to write.
    #[error("{field} payload is empty")]
    Empty { field: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
