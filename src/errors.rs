// Error kinds for the address base
//
// Four failure families, all caught at the per-record boundary during import:
// - FormatError: malformed identifier/derivation input
// - ErrorSet: field-keyed validation failures (includes unresolvable parents)
// - StoreError::Conflict: stale version at save time
// - StoreError::NotFound: lookup misses surfaced by the HTTP layer
//
// None of these abort a batch; the import driver converts them into report
// entries and moves on to the next record.

use serde::Serialize;
use thiserror::Error;

// ============================================================================
// FORMAT ERROR
// ============================================================================

/// Malformed input to an identifier derivation.
#[derive(Debug, Clone, Error)]
#[error("invalid {what} `{input}`: {message}")]
pub struct FormatError {
    pub what: &'static str,
    pub input: String,
    pub message: String,
}

impl FormatError {
    pub fn new(what: &'static str, input: &str, message: &str) -> Self {
        FormatError {
            what,
            input: input.to_string(),
            message: message.to_string(),
        }
    }
}

// ============================================================================
// FIELD-KEYED VALIDATION ERRORS
// ============================================================================

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Structured, field-keyed error set returned by validators.
///
/// A validator either returns a complete change-set or an `ErrorSet`; there
/// are no partial writes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorSet {
    pub errors: Vec<FieldError>,
}

impl ErrorSet {
    pub fn new() -> Self {
        ErrorSet { errors: Vec::new() }
    }

    /// Record a field-level failure.
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Record an unresolvable parent reference (a ReferenceError in the
    /// import report; still field-keyed so the HTTP layer can render it).
    pub fn push_reference(&mut self, field: &str, key: &str) {
        self.push(field, format!("referenced `{}` does not exist", key));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fields that failed, for compact report output.
    pub fn fields(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.field.as_str()).collect()
    }
}

impl std::fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for e in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorSet {}

// ============================================================================
// STORE ERRORS
// ============================================================================

/// Failures raised by the entity store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed: the stored version advanced past
    /// the one the caller observed. The write is refused; retry with the
    /// fresh version.
    #[error("version conflict on {resource} `{key}`: expected {expected}, stored {stored}")]
    Conflict {
        resource: &'static str,
        key: String,
        expected: i64,
        stored: i64,
    },

    /// Lookup by surrogate id or natural key resolved nothing.
    #[error("{resource} `{key}` does not exist")]
    NotFound { resource: &'static str, key: String },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the underlying failure is a UNIQUE constraint violation
    /// (the store-level backstop for create-only entities).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Db(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_set_display() {
        let mut set = ErrorSet::new();
        set.push("insee", "required field is missing");
        set.push_reference("municipality", "insee:99999");
        assert_eq!(
            set.to_string(),
            "insee: required field is missing; municipality: referenced `insee:99999` does not exist"
        );
        assert_eq!(set.fields(), vec!["insee", "municipality"]);
    }

    #[test]
    fn test_empty_error_set() {
        let set = ErrorSet::new();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }

    #[test]
    fn test_format_error_display() {
        let err = FormatError::new("fantoir", "7510", "must be at least 9 characters");
        assert_eq!(
            err.to_string(),
            "invalid fantoir `7510`: must be at least 9 characters"
        );
    }
}
