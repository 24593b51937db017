//! Type mapping between native values and relational cells
//!
//! Every native kind maps to one canonical type. Canonical types form a
//! widening lattice used when the same field shows different kinds across
//! documents:
//!
//! ```text
//!                String (top)
//!        /     /    |     \      \
//!   Boolean DateTime Decimal Binary Document Array Opaque
//!                    |
//!                  Float
//!                    |
//!                 Integer
//!                    |
//!                Null (bottom)
//! ```

mod cell;
mod coerce;

pub use cell::Cell;
pub use coerce::{natural_kind, to_canonical, to_native, TypeCoercionError};

use crate::native::NativeKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relational-side type of a column or cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalType {
    #[default]
    Null,
    Boolean,
    Integer,
    Float,
    Decimal,
    String,
    DateTime,
    Binary,
    Document,
    Array,
    Opaque,
}

impl CanonicalType {
    /// Canonical type of a native kind
    pub fn of_kind(kind: NativeKind) -> Self {
        match kind {
            NativeKind::Null | NativeKind::Undefined => CanonicalType::Null,
            NativeKind::Bool => CanonicalType::Boolean,
            NativeKind::Int32 | NativeKind::Int64 => CanonicalType::Integer,
            NativeKind::Double => CanonicalType::Float,
            NativeKind::Decimal128 => CanonicalType::Decimal,
            NativeKind::String | NativeKind::ObjectId => CanonicalType::String,
            NativeKind::DateTime | NativeKind::Timestamp => CanonicalType::DateTime,
            NativeKind::Binary => CanonicalType::Binary,
            NativeKind::Document => CanonicalType::Document,
            NativeKind::Array => CanonicalType::Array,
            NativeKind::Regex | NativeKind::MinKey | NativeKind::MaxKey | NativeKind::JavaScript => {
                CanonicalType::Opaque
            }
        }
    }

    /// Least upper bound of two types
    pub fn widen(self, other: Self) -> Self {
        use CanonicalType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, t) | (t, Null) => t,
            (a, b) if a.numeric_rank().is_some() && b.numeric_rank().is_some() => {
                if a.numeric_rank() > b.numeric_rank() {
                    a
                } else {
                    b
                }
            }
            _ => String,
        }
    }

    /// True if `self` is at least as permissive as `other`
    pub fn covers(self, other: Self) -> bool {
        self.widen(other) == self
    }

    fn numeric_rank(self) -> Option<u8> {
        match self {
            CanonicalType::Integer => Some(0),
            CanonicalType::Float => Some(1),
            CanonicalType::Decimal => Some(2),
            _ => None,
        }
    }

    /// SQL type name reported in column metadata
    pub fn sql_type_name(self) -> &'static str {
        match self {
            CanonicalType::Null => "NULL",
            CanonicalType::Boolean => "BOOLEAN",
            CanonicalType::Integer => "BIGINT",
            CanonicalType::Float => "DOUBLE",
            CanonicalType::Decimal => "DECIMAL",
            CanonicalType::String => "VARCHAR",
            CanonicalType::DateTime => "TIMESTAMP",
            CanonicalType::Binary => "VARBINARY",
            CanonicalType::Document => "OBJECT",
            CanonicalType::Array => "ARRAY",
            CanonicalType::Opaque => "OTHER",
        }
    }

    /// Numeric SQL type code (the `java.sql.Types` numbering relational clients expect)
    pub fn sql_type_code(self) -> i32 {
        match self {
            CanonicalType::Null => 0,
            CanonicalType::Boolean => 16,
            CanonicalType::Integer => -5,
            CanonicalType::Float => 8,
            CanonicalType::Decimal => 3,
            CanonicalType::String => 12,
            CanonicalType::DateTime => 93,
            CanonicalType::Binary => -3,
            CanonicalType::Document => 2000,
            CanonicalType::Array => 2003,
            CanonicalType::Opaque => 1111,
        }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CanonicalType::*;

    const ALL: [CanonicalType; 11] = [
        Null, Boolean, Integer, Float, Decimal, String, DateTime, Binary, Document, Array, Opaque,
    ];

    #[test]
    fn test_numeric_chain() {
        assert_eq!(Integer.widen(Float), Float);
        assert_eq!(Float.widen(Integer), Float);
        assert_eq!(Float.widen(Decimal), Decimal);
        assert_eq!(Integer.widen(Decimal), Decimal);
    }

    #[test]
    fn test_null_is_bottom_and_string_is_top() {
        for t in ALL {
            assert_eq!(Null.widen(t), t);
            assert_eq!(String.widen(t), String);
        }
        assert_eq!(Boolean.widen(Integer), String);
        assert_eq!(DateTime.widen(Document), String);
    }

    #[test]
    fn test_widening_is_monotone() {
        // Folding any sequence never produces a type narrower than any input
        for a in ALL {
            for b in ALL {
                for c in ALL {
                    let merged = a.widen(b).widen(c);
                    assert!(merged.covers(a) && merged.covers(b) && merged.covers(c));
                    assert_eq!(merged, a.widen(b.widen(c)), "associative for {a:?} {b:?} {c:?}");
                }
            }
        }
    }

    #[test]
    fn test_object_id_reports_as_string() {
        assert_eq!(CanonicalType::of_kind(NativeKind::ObjectId), String);
        assert_eq!(CanonicalType::of_kind(NativeKind::Timestamp), DateTime);
    }
}
