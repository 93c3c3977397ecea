//! # Validation Module
//!
//! Payload validation for the collection mutation wrappers.
//!
//! ## Where Validation Runs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Data::patients().add(...)                                    │
//! │  └── THIS MODULE: required fields, types, lengths                      │
//! │           │                                                             │
//! │           ▼  (nothing touches the store if this fails)                 │
//! │  Layer 2: MutationOrchestrator                                         │
//! │  └── Store::mutate (record must exist for update/delete)               │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Remote document store                                        │
//! │  └── Security rules (permission-denied / invalid-argument)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use serde_json::json;
//! use ward_core::validation::validate_task_payload;
//!
//! let payload = json!({"title": "Check obs", "completed": false});
//! assert!(validate_task_payload(payload.as_object().unwrap()).is_ok());
//! ```

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::Payload;
use crate::{MAX_SEARCH_QUERY_LEN, SERVER_MANAGED_FIELDS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum length for display names (patients, units) and task titles.
pub const MAX_NAME_LEN: usize = 200;

/// Maximum length of a document id.
pub const MAX_DOC_ID_LEN: usize = 128;

// =============================================================================
// Field Helpers
// =============================================================================

/// Checks that every field in `fields` is present and not blank.
///
/// Null values and whitespace-only strings count as missing.
pub fn validate_required(payload: &Payload, fields: &[&str]) -> ValidationResult<()> {
    for field in fields {
        let present = match payload.get(*field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(ValidationError::Required {
                field: (*field).to_string(),
            });
        }
    }
    Ok(())
}

fn validate_string_field(
    payload: &Payload,
    field: &str,
    max: usize,
) -> ValidationResult<()> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(s)) if s.chars().count() > max => Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        }),
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(ValidationError::WrongType {
            field: field.to_string(),
            expected: "string".to_string(),
        }),
    }
}

fn validate_bool_field(payload: &Payload, field: &str) -> ValidationResult<()> {
    match payload.get(field) {
        None | Some(Value::Bool(_)) => Ok(()),
        Some(_) => Err(ValidationError::WrongType {
            field: field.to_string(),
            expected: "boolean".to_string(),
        }),
    }
}

// =============================================================================
// Collection Validators
// =============================================================================

/// Validates a patient payload.
///
/// ## Rules
/// - `name` is required on create
/// - `name` and `unitId` must be strings, `name` at most 200 characters
///
/// `partial` is true for updates: required fields may be absent, but
/// anything present must still be well-formed.
pub fn validate_patient_payload(payload: &Payload, partial: bool) -> ValidationResult<()> {
    if !partial {
        validate_required(payload, &["name"])?;
    } else if payload.contains_key("name") {
        validate_required(payload, &["name"])?;
    }
    validate_string_field(payload, "name", MAX_NAME_LEN)?;
    validate_string_field(payload, "unitId", MAX_DOC_ID_LEN)?;
    Ok(())
}

/// Validates a task payload.
///
/// ## Rules
/// - `title` is required on create, at most 200 characters
/// - `completed`, when present, must be a boolean
pub fn validate_task_payload(payload: &Payload) -> ValidationResult<()> {
    validate_required(payload, &["title"])?;
    validate_task_fields(payload)
}

/// Validates the fields of a task update without requiring `title`.
pub fn validate_task_patch(payload: &Payload) -> ValidationResult<()> {
    if payload.contains_key("title") {
        validate_required(payload, &["title"])?;
    }
    validate_task_fields(payload)
}

fn validate_task_fields(payload: &Payload) -> ValidationResult<()> {
    validate_string_field(payload, "title", MAX_NAME_LEN)?;
    validate_string_field(payload, "unitId", MAX_DOC_ID_LEN)?;
    validate_bool_field(payload, "completed")
}

/// Validates a unit payload. `name` is required on create.
pub fn validate_unit_payload(payload: &Payload, partial: bool) -> ValidationResult<()> {
    if !partial || payload.contains_key("name") {
        validate_required(payload, &["name"])?;
    }
    validate_string_field(payload, "name", MAX_NAME_LEN)
}

// =============================================================================
// Payload Shaping
// =============================================================================

/// Removes fields owned by the remote store from an update payload.
pub fn strip_server_managed(payload: &Payload) -> Payload {
    payload
        .iter()
        .filter(|(key, _)| !SERVER_MANAGED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Validates a document id.
///
/// ## Rules
/// - Must not be empty
/// - At most 128 characters
/// - Must not contain `/` (it would address a sub-collection remotely)
pub fn validate_doc_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }
    if id.len() > MAX_DOC_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "id".to_string(),
            max: MAX_DOC_ID_LEN,
        });
    }
    if id.contains('/') {
        return Err(ValidationError::InvalidFormat {
            field: "id".to_string(),
            reason: "must not contain '/'".to_string(),
        });
    }
    Ok(())
}

/// Validates and normalizes a search query.
///
/// Returns the trimmed query.
pub fn validate_search_query(query: &str) -> ValidationResult<String> {
    let trimmed = query.trim();
    if trimmed.chars().count() > MAX_SEARCH_QUERY_LEN {
        return Err(ValidationError::TooLong {
            field: "search".to_string(),
            max: MAX_SEARCH_QUERY_LEN,
        });
    }
    Ok(trimmed.to_string())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_required_treats_blank_as_missing() {
        let p = payload(json!({"name": "   "}));
        assert_eq!(
            validate_required(&p, &["name"]),
            Err(ValidationError::Required {
                field: "name".to_string()
            })
        );
        assert!(validate_required(&payload(json!({"name": null})), &["name"]).is_err());
        assert!(validate_required(&payload(json!({"name": "A"})), &["name"]).is_ok());
    }

    #[test]
    fn test_patient_payload() {
        assert!(validate_patient_payload(&payload(json!({"name": "J. Doe"})), false).is_ok());
        assert!(validate_patient_payload(&payload(json!({"bed": 3})), false).is_err());
        // partial update without name is fine
        assert!(validate_patient_payload(&payload(json!({"bed": 3})), true).is_ok());
        // but an explicit blank name is not
        assert!(validate_patient_payload(&payload(json!({"name": ""})), true).is_err());

        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            validate_patient_payload(&payload(json!({"name": long})), false),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_task_payload() {
        assert!(validate_task_payload(&payload(json!({"title": "Obs"}))).is_ok());
        assert!(validate_task_payload(&payload(json!({"completed": true}))).is_err());
        assert_eq!(
            validate_task_payload(&payload(json!({"title": "Obs", "completed": "yes"}))),
            Err(ValidationError::WrongType {
                field: "completed".to_string(),
                expected: "boolean".to_string()
            })
        );
        assert!(validate_task_patch(&payload(json!({"completed": true}))).is_ok());
    }

    #[test]
    fn test_unit_payload() {
        assert!(validate_unit_payload(&payload(json!({"name": "ICU"})), false).is_ok());
        assert!(validate_unit_payload(&payload(json!({})), false).is_err());
        assert!(validate_unit_payload(&payload(json!({})), true).is_ok());
    }

    #[test]
    fn test_strip_server_managed() {
        let stripped = strip_server_managed(&payload(json!({
            "id": "x",
            "createdAt": "2024-01-01T00:00:00Z",
            "createdBy": "someone",
            "bed": 2
        })));
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped.get("bed"), Some(&json!(2)));
    }

    #[test]
    fn test_doc_id() {
        assert!(validate_doc_id("p-123").is_ok());
        assert!(validate_doc_id("").is_err());
        assert!(validate_doc_id("a/b").is_err());
        assert!(validate_doc_id(&"a".repeat(MAX_DOC_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_search_query() {
        assert_eq!(validate_search_query("  doe ").unwrap(), "doe");
        assert!(validate_search_query(&"q".repeat(MAX_SEARCH_QUERY_LEN + 1)).is_err());
    }
}
