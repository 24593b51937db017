//! Input validation for docbridge
//!
//! Names the document store would reject are caught before a statement is
//! translated, so a bad name never reaches the store.

use thiserror::Error;

/// Validation errors; the first field names what was being validated
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid {0} '{1}': {2}")]
    InvalidIdentifier(&'static str, String, &'static str),

    #[error("{0} '{1}' is too long (max {2} bytes)")]
    TooLong(&'static str, String, usize),

    #[error("{0} cannot be empty")]
    Empty(&'static str),
}

/// Maximum length for collection names
pub const MAX_COLLECTION_NAME_LENGTH: usize = 255;

/// Maximum length for database names
pub const MAX_DATABASE_NAME_LENGTH: usize = 63;

/// Characters the store forbids in database names
const DATABASE_FORBIDDEN: &[char] = &['/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|', '?', '\0'];

/// Validate a collection name for reading
///
/// Rules:
/// - Must be 1-255 bytes
/// - Cannot contain `$` or NUL
/// - Cannot start or end with a dot
pub fn validate_collection_name(name: &str) -> Result<(), ValidationError> {
    const KIND: &str = "collection name";
    if name.is_empty() {
        return Err(ValidationError::Empty(KIND));
    }
    if name.len() > MAX_COLLECTION_NAME_LENGTH {
        return Err(ValidationError::TooLong(KIND, name.to_string(), MAX_COLLECTION_NAME_LENGTH));
    }
    if name.contains('$') || name.contains('\0') {
        return Err(ValidationError::InvalidIdentifier(
            KIND,
            name.to_string(),
            "contains '$' or NUL characters",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(ValidationError::InvalidIdentifier(
            KIND,
            name.to_string(),
            "cannot start or end with a dot",
        ));
    }
    Ok(())
}

/// Validate a collection name for writing; `system.*` collections are internal
pub fn validate_writable_collection(name: &str) -> Result<(), ValidationError> {
    validate_collection_name(name)?;
    if name.starts_with("system.") {
        return Err(ValidationError::InvalidIdentifier(
            "collection name",
            name.to_string(),
            "system collections are read-only",
        ));
    }
    Ok(())
}

/// Validate a database name
pub fn validate_database_name(name: &str) -> Result<(), ValidationError> {
    const KIND: &str = "database name";
    if name.is_empty() {
        return Err(ValidationError::Empty(KIND));
    }
    if name.len() > MAX_DATABASE_NAME_LENGTH {
        return Err(ValidationError::TooLong(KIND, name.to_string(), MAX_DATABASE_NAME_LENGTH));
    }
    if name.contains(DATABASE_FORBIDDEN) {
        return Err(ValidationError::InvalidIdentifier(
            KIND,
            name.to_string(),
            "contains one of / \\ . \" $ * < > : | ? or spaces",
        ));
    }
    Ok(())
}

/// Validate a dotted field path used as a write target
pub fn validate_field_path(path: &str) -> Result<(), ValidationError> {
    const KIND: &str = "field path";
    if path.is_empty() {
        return Err(ValidationError::Empty(KIND));
    }
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(ValidationError::InvalidIdentifier(KIND, path.to_string(), "has an empty segment"));
        }
        if segment.starts_with('$') {
            return Err(ValidationError::InvalidIdentifier(
                KIND,
                path.to_string(),
                "segments cannot start with '$'",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_collection_names() {
        assert!(validate_collection_name("users").is_ok());
        assert!(validate_collection_name("my-collection").is_ok());
        assert!(validate_collection_name("logs.2024").is_ok());
        assert!(validate_collection_name("system.views").is_ok());
    }

    #[test]
    fn test_invalid_collection_names() {
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("price$").is_err());
        assert!(validate_collection_name("a\0b").is_err());
        assert!(validate_collection_name(".hidden").is_err());
        assert!(validate_collection_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_system_collections_read_only() {
        assert!(validate_writable_collection("users").is_ok());
        assert!(validate_writable_collection("system.users").is_err());
    }

    #[test]
    fn test_database_names() {
        assert!(validate_database_name("admin").is_ok());
        assert!(validate_database_name("my_db-1").is_ok());
        assert!(validate_database_name("a.b").is_err());
        assert!(validate_database_name("a b").is_err());
        assert!(validate_database_name("../etc").is_err());
        assert!(validate_database_name(&"d".repeat(64)).is_err());
    }

    #[test]
    fn test_field_paths() {
        assert!(validate_field_path("address.city").is_ok());
        assert!(validate_field_path("a..b").is_err());
        assert!(validate_field_path("$set").is_err());
    }
}
