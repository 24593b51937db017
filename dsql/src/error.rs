//! Error types for DSQL parsing

use nom::error::{VerboseError, VerboseErrorKind};
use thiserror::Error;

/// Malformed statement text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Syntax error at line {line}, column {column}: expected {expected}, found {found}")]
pub struct SyntaxError {
    /// Byte offset into the statement
    pub position: usize,
    pub line: usize,
    pub column: usize,
    pub expected: String,
    pub found: String,
}

impl SyntaxError {
    pub fn new(source: &str, position: usize, expected: impl Into<String>) -> Self {
        let position = position.min(source.len());
        let (line, column) = line_column(source, position);
        Self {
            position,
            line,
            column,
            expected: expected.into(),
            found: describe_found(&source[position..]),
        }
    }

    /// Build from a nom error raised while parsing `source`
    pub(crate) fn from_nom(source: &str, err: nom::Err<VerboseError<&str>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => Self::new(source, source.len(), "more input"),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                // The first entry is the innermost failure; the nearest context names what was expected
                let position = e
                    .errors
                    .first()
                    .map(|(rest, _)| source.len() - rest.len())
                    .unwrap_or(0);
                let expected = e
                    .errors
                    .iter()
                    .find_map(|(_, kind)| match kind {
                        VerboseErrorKind::Context(ctx) => Some(ctx.to_string()),
                        _ => None,
                    })
                    .or_else(|| {
                        e.errors.first().map(|(_, kind)| match kind {
                            VerboseErrorKind::Char(c) => format!("'{}'", c),
                            VerboseErrorKind::Nom(k) => format!("{:?}", k).to_lowercase(),
                            VerboseErrorKind::Context(ctx) => ctx.to_string(),
                        })
                    })
                    .unwrap_or_else(|| "statement".to_string());
                Self::new(source, position, expected)
            }
        }
    }
}

fn line_column(source: &str, position: usize) -> (usize, usize) {
    let before = &source[..position];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map(|nl| position - nl).unwrap_or(position + 1);
    (line, column)
}

fn describe_found(rest: &str) -> String {
    let rest = rest.trim_start();
    if rest.is_empty() {
        return "end of input".to_string();
    }
    let token: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace())
        .take(20)
        .collect();
    format!("'{}'", token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_and_column() {
        let err = SyntaxError::new("SELECT *\nFROM\n  42", 16, "identifier");
        assert_eq!(err.line, 3);
        assert_eq!(err.column, 3);
        assert_eq!(err.found, "'42'");
    }

    #[test]
    fn test_end_of_input() {
        let err = SyntaxError::new("SELECT", 6, "select list");
        assert_eq!(err.found, "end of input");
        assert!(err.to_string().contains("expected select list"));
    }
}
