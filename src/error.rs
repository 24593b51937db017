//! Error types for docbridge
//!
//! Each layer has its own error type; [`Error`] folds them together and
//! adds user-facing suggestions.

use crate::config::ConfigError;
use crate::cursor::CursorError;
use crate::plan::TranslationError;
use crate::script::ScriptEvaluationError;
use crate::store::StoreError;
use crate::types::TypeCoercionError;
use crate::validation::ValidationError;
use thiserror::Error;

/// The main error type for docbridge operations
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Statement Errors (raised before any store round trip)
    // ==========================================================================
    #[error(transparent)]
    Syntax(#[from] dsql::SyntaxError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    ScriptEvaluation(#[from] ScriptEvaluationError),

    #[error(transparent)]
    TypeCoercion(#[from] TypeCoercionError),

    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    // ==========================================================================
    // Execution Errors
    // ==========================================================================
    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    // ==========================================================================
    // Configuration Errors
    // ==========================================================================
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for docbridge operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidIdentifier(kind, value, reason) => {
                Error::InvalidIdentifier { kind, value, reason }
            }
            ValidationError::TooLong(kind, value, _max) => Error::InvalidIdentifier {
                kind,
                value,
                reason: "exceeds maximum length",
            },
            ValidationError::Empty(kind) => Error::InvalidIdentifier {
                kind,
                value: String::new(),
                reason: "cannot be empty",
            },
        }
    }
}

// =============================================================================
// Error Display Helpers
// =============================================================================

impl Error {
    /// Returns a user-friendly suggestion for fixing the error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Syntax(_) => Some("Check the statement near the reported line and column"),
            Error::Translation(err) if err.reason.contains("GROUP BY") => {
                Some("Add the column to GROUP BY or wrap it in an aggregate such as MAX(...)")
            }
            Error::Translation(err) if err.reason.contains("parameter") => {
                Some("Bind a value for every ? and :name placeholder")
            }
            Error::ScriptEvaluation(err) if err.is_timeout() => {
                Some("Simplify the $$...$$ fragment or raise script.timeout_ms")
            }
            Error::ScriptEvaluation(_) => {
                Some("Fragments use shell syntax, e.g. $${ age: { $gt: 30 } }$$")
            }
            Error::TypeCoercion(_) => Some("Write a value that matches the column's type"),
            Error::InvalidIdentifier { .. } => {
                Some("Collection names must be non-empty and contain no '$' or NUL characters")
            }
            Error::Cursor(CursorError::ReplayBufferExhausted { .. }) => {
                Some("Raise replay_buffer_rows or use a forward-only cursor")
            }
            _ => None,
        }
    }

    /// True if the statement failed before reaching the store
    pub fn is_statement_error(&self) -> bool {
        matches!(
            self,
            Error::Syntax(_)
                | Error::Translation(_)
                | Error::ScriptEvaluation(_)
                | Error::TypeCoercion(_)
                | Error::InvalidIdentifier { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::from(TranslationError::new("name", "column 'name' must appear in GROUP BY"));
        assert_eq!(
            err.to_string(),
            "Cannot translate `name`: column 'name' must appear in GROUP BY"
        );
    }

    #[test]
    fn test_error_suggestion() {
        let err = Error::from(TranslationError::new("name", "column 'name' must appear in GROUP BY"));
        assert!(err.suggestion().is_some());
        assert!(err.is_statement_error());

        let err = Error::from(ValidationError::Empty("collection name"));
        assert!(matches!(err, Error::InvalidIdentifier { .. }));
        assert!(err.suggestion().is_some());
    }
}
