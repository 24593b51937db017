//! Relational cell values

use super::CanonicalType;
use crate::native::{document_to_string, format_millis, to_extended_json, Document, JsonMode, NativeKind, NativeValue, ObjectId};
use base64::Engine as _;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// One value of a row, or a bound parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    /// Store identifier; reads as its hex string, keeps the raw bytes
    Identifier(ObjectId),
    Binary { subtype: u8, bytes: Vec<u8> },
    /// Epoch milliseconds (UTC)
    DateTime(i64),
    /// Store timestamp; reads as a date-time, keeps the increment
    Timestamp { time: u32, increment: u32 },
    /// Embedded document, kept structured
    Document(Document),
    /// Array, kept structured
    Array(Vec<NativeValue>),
    /// Kinds with no relational counterpart; `bytes` is canonical extended JSON
    Opaque { kind: NativeKind, bytes: Vec<u8> },
}

impl Cell {
    pub fn canonical_type(&self) -> CanonicalType {
        match self {
            Cell::Null => CanonicalType::Null,
            Cell::Boolean(_) => CanonicalType::Boolean,
            Cell::Integer(_) => CanonicalType::Integer,
            Cell::Float(_) => CanonicalType::Float,
            Cell::Decimal(_) => CanonicalType::Decimal,
            Cell::String(_) | Cell::Identifier(_) => CanonicalType::String,
            Cell::Binary { .. } => CanonicalType::Binary,
            Cell::DateTime(_) | Cell::Timestamp { .. } => CanonicalType::DateTime,
            Cell::Document(_) => CanonicalType::Document,
            Cell::Array(_) => CanonicalType::Array,
            Cell::Opaque { .. } => CanonicalType::Opaque,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    // ========================================================================
    // Permissive accessors: best-effort reads, never errors
    // ========================================================================

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Boolean(b) => Some(*b),
            Cell::Integer(i) => Some(*i != 0),
            Cell::Float(f) => Some(*f != 0.0),
            Cell::Decimal(d) => Some(!d.is_zero()),
            Cell::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Integer view; floats and decimals truncate toward zero
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Integer(i) => Some(*i),
            Cell::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Cell::Decimal(d) => d.trunc().to_i64(),
            Cell::Boolean(b) => Some(i64::from(*b)),
            Cell::DateTime(ms) => Some(*ms),
            Cell::Timestamp { time, .. } => Some(i64::from(*time) * 1000),
            Cell::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(i) => Some(*i as f64),
            Cell::Float(f) => Some(*f),
            Cell::Decimal(d) => d.to_f64(),
            Cell::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Cell::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Cell::Integer(i) => Some(Decimal::from(*i)),
            Cell::Float(f) => Decimal::from_f64(*f),
            Cell::Decimal(d) => Some(*d),
            Cell::String(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        }
    }

    /// Epoch milliseconds
    pub fn as_datetime(&self) -> Option<i64> {
        match self {
            Cell::DateTime(ms) | Cell::Integer(ms) => Some(*ms),
            Cell::Timestamp { time, .. } => Some(i64::from(*time) * 1000),
            Cell::String(s) => dsql::parse_timestamp(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Cell::Binary { bytes, .. } | Cell::Opaque { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    /// Display string for any non-null cell
    pub fn as_string(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("NULL"),
            Cell::Boolean(b) => write!(f, "{}", b),
            Cell::Integer(i) => write!(f, "{}", i),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Decimal(d) => write!(f, "{}", d),
            Cell::String(s) => f.write_str(s),
            Cell::Identifier(oid) => f.write_str(&oid.to_hex()),
            Cell::Binary { bytes, .. } => {
                f.write_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            Cell::DateTime(ms) => f.write_str(&format_millis(*ms)),
            Cell::Timestamp { time, .. } => f.write_str(&format_millis(i64::from(*time) * 1000)),
            Cell::Document(doc) => f.write_str(&document_to_string(doc)),
            Cell::Array(items) => {
                let json = to_extended_json(&NativeValue::Array(items.clone()), JsonMode::Relaxed);
                write!(f, "{}", json)
            }
            Cell::Opaque { bytes, .. } => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

impl From<bool> for Cell {
    fn from(b: bool) -> Self {
        Cell::Boolean(b)
    }
}

impl From<i64> for Cell {
    fn from(i: i64) -> Self {
        Cell::Integer(i)
    }
}

impl From<i32> for Cell {
    fn from(i: i32) -> Self {
        Cell::Integer(i64::from(i))
    }
}

impl From<f64> for Cell {
    fn from(f: f64) -> Self {
        Cell::Float(f)
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::String(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::String(s)
    }
}

impl From<Decimal> for Cell {
    fn from(d: Decimal) -> Self {
        Cell::Decimal(d)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Cell::Null)
    }
}
