//! Native document model
//!
//! Values as the document store sees them: ordered documents over the full
//! set of native kinds, plus extended-JSON conversion and the store's
//! cross-kind ordering.

mod compare;
mod json;
mod object_id;

pub use compare::{compare, values_equal};
pub use json::{from_extended_json, to_extended_json, JsonMode};
pub(crate) use json::document_to_string;
pub use object_id::ObjectId;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value of any native kind
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Undefined,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Decimal128(Decimal),
    String(String),
    /// Milliseconds since the Unix epoch (UTC)
    DateTime(i64),
    /// Internal replication timestamp
    Timestamp { time: u32, increment: u32 },
    ObjectId(ObjectId),
    Binary { subtype: u8, bytes: Vec<u8> },
    Regex { pattern: String, options: String },
    Document(Document),
    Array(Vec<NativeValue>),
    MinKey,
    MaxKey,
    JavaScript(String),
}

/// The kind tag of a native value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NativeKind {
    Null,
    Undefined,
    Bool,
    Int32,
    Int64,
    Double,
    Decimal128,
    String,
    DateTime,
    Timestamp,
    ObjectId,
    Binary,
    Regex,
    Document,
    Array,
    MinKey,
    MaxKey,
    JavaScript,
}

impl NativeKind {
    pub const ALL: [NativeKind; 18] = [
        NativeKind::Null,
        NativeKind::Undefined,
        NativeKind::Bool,
        NativeKind::Int32,
        NativeKind::Int64,
        NativeKind::Double,
        NativeKind::Decimal128,
        NativeKind::String,
        NativeKind::DateTime,
        NativeKind::Timestamp,
        NativeKind::ObjectId,
        NativeKind::Binary,
        NativeKind::Regex,
        NativeKind::Document,
        NativeKind::Array,
        NativeKind::MinKey,
        NativeKind::MaxKey,
        NativeKind::JavaScript,
    ];

    /// The store's type alias, as used by `$type`
    pub fn alias(self) -> &'static str {
        match self {
            NativeKind::Null => "null",
            NativeKind::Undefined => "undefined",
            NativeKind::Bool => "bool",
            NativeKind::Int32 => "int",
            NativeKind::Int64 => "long",
            NativeKind::Double => "double",
            NativeKind::Decimal128 => "decimal",
            NativeKind::String => "string",
            NativeKind::DateTime => "date",
            NativeKind::Timestamp => "timestamp",
            NativeKind::ObjectId => "objectId",
            NativeKind::Binary => "binData",
            NativeKind::Regex => "regex",
            NativeKind::Document => "object",
            NativeKind::Array => "array",
            NativeKind::MinKey => "minKey",
            NativeKind::MaxKey => "maxKey",
            NativeKind::JavaScript => "javascript",
        }
    }

    /// The store's numeric type code
    pub fn code(self) -> i32 {
        match self {
            NativeKind::Double => 1,
            NativeKind::String => 2,
            NativeKind::Document => 3,
            NativeKind::Array => 4,
            NativeKind::Binary => 5,
            NativeKind::Undefined => 6,
            NativeKind::ObjectId => 7,
            NativeKind::Bool => 8,
            NativeKind::DateTime => 9,
            NativeKind::Null => 10,
            NativeKind::Regex => 11,
            NativeKind::JavaScript => 13,
            NativeKind::Int32 => 16,
            NativeKind::Timestamp => 17,
            NativeKind::Int64 => 18,
            NativeKind::Decimal128 => 19,
            NativeKind::MinKey => -1,
            NativeKind::MaxKey => 127,
        }
    }

    pub fn from_alias(alias: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.alias() == alias)
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            NativeKind::Int32 | NativeKind::Int64 | NativeKind::Double | NativeKind::Decimal128
        )
    }
}

impl fmt::Display for NativeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alias())
    }
}

impl NativeValue {
    pub fn kind(&self) -> NativeKind {
        match self {
            NativeValue::Null => NativeKind::Null,
            NativeValue::Undefined => NativeKind::Undefined,
            NativeValue::Bool(_) => NativeKind::Bool,
            NativeValue::Int32(_) => NativeKind::Int32,
            NativeValue::Int64(_) => NativeKind::Int64,
            NativeValue::Double(_) => NativeKind::Double,
            NativeValue::Decimal128(_) => NativeKind::Decimal128,
            NativeValue::String(_) => NativeKind::String,
            NativeValue::DateTime(_) => NativeKind::DateTime,
            NativeValue::Timestamp { .. } => NativeKind::Timestamp,
            NativeValue::ObjectId(_) => NativeKind::ObjectId,
            NativeValue::Binary { .. } => NativeKind::Binary,
            NativeValue::Regex { .. } => NativeKind::Regex,
            NativeValue::Document(_) => NativeKind::Document,
            NativeValue::Array(_) => NativeKind::Array,
            NativeValue::MinKey => NativeKind::MinKey,
            NativeValue::MaxKey => NativeKind::MaxKey,
            NativeValue::JavaScript(_) => NativeKind::JavaScript,
        }
    }

    /// Null or undefined
    pub fn is_null(&self) -> bool {
        matches!(self, NativeValue::Null | NativeValue::Undefined)
    }

    pub fn is_numeric(&self) -> bool {
        self.kind().is_numeric()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NativeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integral value of an integer kind, or of a double/decimal with no fraction
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NativeValue::Int32(i) => Some(i64::from(*i)),
            NativeValue::Int64(i) => Some(*i),
            NativeValue::Double(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => Some(*f as i64),
            NativeValue::Decimal128(d) if d.fract().is_zero() => d.to_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NativeValue::Int32(i) => Some(f64::from(*i)),
            NativeValue::Int64(i) => Some(*i as f64),
            NativeValue::Double(f) => Some(*f),
            NativeValue::Decimal128(d) => d.to_f64(),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            NativeValue::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<NativeValue>> {
        match self {
            NativeValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Truthiness as aggregation expressions see it
    pub fn is_truthy(&self) -> bool {
        match self {
            NativeValue::Null | NativeValue::Undefined => false,
            NativeValue::Bool(b) => *b,
            NativeValue::Int32(i) => *i != 0,
            NativeValue::Int64(i) => *i != 0,
            NativeValue::Double(f) => *f != 0.0,
            NativeValue::Decimal128(d) => !d.is_zero(),
            _ => true,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for NativeValue {
    fn from(b: bool) -> Self {
        NativeValue::Bool(b)
    }
}

impl From<i32> for NativeValue {
    fn from(i: i32) -> Self {
        NativeValue::Int32(i)
    }
}

impl From<i64> for NativeValue {
    fn from(i: i64) -> Self {
        NativeValue::Int64(i)
    }
}

impl From<f64> for NativeValue {
    fn from(f: f64) -> Self {
        NativeValue::Double(f)
    }
}

impl From<&str> for NativeValue {
    fn from(s: &str) -> Self {
        NativeValue::String(s.to_string())
    }
}

impl From<String> for NativeValue {
    fn from(s: String) -> Self {
        NativeValue::String(s)
    }
}

impl From<Document> for NativeValue {
    fn from(d: Document) -> Self {
        NativeValue::Document(d)
    }
}

impl From<Vec<NativeValue>> for NativeValue {
    fn from(a: Vec<NativeValue>) -> Self {
        NativeValue::Array(a)
    }
}

impl From<ObjectId> for NativeValue {
    fn from(oid: ObjectId) -> Self {
        NativeValue::ObjectId(oid)
    }
}

impl From<Decimal> for NativeValue {
    fn from(d: Decimal) -> Self {
        NativeValue::Decimal128(d)
    }
}

/// Shell-style rendering (`ObjectId("...")`, `ISODate("...")`, `NumberLong(7)`)
impl fmt::Display for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeValue::Null => f.write_str("null"),
            NativeValue::Undefined => f.write_str("undefined"),
            NativeValue::Bool(b) => write!(f, "{}", b),
            NativeValue::Int32(i) => write!(f, "{}", i),
            NativeValue::Int64(i) => write!(f, "NumberLong({})", i),
            NativeValue::Double(d) => {
                if d.fract() == 0.0 && d.is_finite() {
                    write!(f, "{:.1}", d)
                } else {
                    write!(f, "{}", d)
                }
            }
            NativeValue::Decimal128(d) => write!(f, "NumberDecimal(\"{}\")", d),
            NativeValue::String(s) => write!(f, "{:?}", s),
            NativeValue::DateTime(ms) => write!(f, "ISODate(\"{}\")", format_millis(*ms)),
            NativeValue::Timestamp { time, increment } => {
                write!(f, "Timestamp({}, {})", time, increment)
            }
            NativeValue::ObjectId(oid) => write!(f, "ObjectId(\"{}\")", oid),
            NativeValue::Binary { subtype, bytes } => {
                use base64::Engine as _;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                write!(f, "BinData({}, \"{}\")", subtype, encoded)
            }
            NativeValue::Regex { pattern, options } => write!(f, "/{}/{}", pattern, options),
            NativeValue::Document(d) => write!(f, "{}", d),
            NativeValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            NativeValue::MinKey => f.write_str("MinKey"),
            NativeValue::MaxKey => f.write_str("MaxKey"),
            NativeValue::JavaScript(code) => write!(f, "Code({:?})", code),
        }
    }
}

/// ISO-8601 with millisecond precision, or the raw number when out of range
pub fn format_millis(ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

// ============================================================================
// Document
// ============================================================================

/// An ordered key/value document
///
/// Field order is insertion order; keys are unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, NativeValue)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity) }
    }

    /// Set a top-level field, keeping its position if it already exists
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<NativeValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&NativeValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut NativeValue> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<NativeValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NativeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolve a dotted path; numeric segments index into arrays
    pub fn get_path(&self, path: &str) -> Option<&NativeValue> {
        let mut segments = path.split('.');
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                NativeValue::Document(d) => d.get(segment)?,
                NativeValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate documents
    ///
    /// A non-document value in the middle of the path is replaced.
    pub fn set_path(&mut self, path: &str, value: NativeValue) {
        match path.split_once('.') {
            None => self.insert(path, value),
            Some((head, rest)) => {
                if !matches!(self.get(head), Some(NativeValue::Document(_))) {
                    self.insert(head, Document::new());
                }
                if let Some(NativeValue::Document(child)) = self.get_mut(head) {
                    child.set_path(rest, value);
                }
            }
        }
    }

    /// Remove a dotted path
    pub fn remove_path(&mut self, path: &str) -> Option<NativeValue> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head) {
                Some(NativeValue::Document(child)) => child.remove_path(rest),
                _ => None,
            },
        }
    }
}

impl<K: Into<String>, V: Into<NativeValue>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, NativeValue);
    type IntoIter = std::vec::IntoIter<(String, NativeValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{ ")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_doc() -> Document {
        let mut address = Document::new();
        address.insert("city", "Oslo");
        address.insert("zip", 150);

        let mut doc = Document::new();
        doc.insert("name", "Ada");
        doc.insert("address", address);
        doc.insert("tags", vec![NativeValue::from("a"), NativeValue::from("b")]);
        doc
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut doc = make_doc();
        doc.insert("name", "Grace");
        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["name", "address", "tags"]);
        assert_eq!(doc.get("name"), Some(&NativeValue::from("Grace")));
    }

    #[test]
    fn test_get_path() {
        let doc = make_doc();
        assert_eq!(doc.get_path("address.city"), Some(&NativeValue::from("Oslo")));
        assert_eq!(doc.get_path("tags.1"), Some(&NativeValue::from("b")));
        assert_eq!(doc.get_path("address.country"), None);
        assert_eq!(doc.get_path("name.first"), None);
    }

    #[test]
    fn test_set_and_remove_path() {
        let mut doc = make_doc();
        doc.set_path("address.country", NativeValue::from("NO"));
        doc.set_path("meta.created.by", NativeValue::from("cli"));
        assert_eq!(doc.get_path("address.country"), Some(&NativeValue::from("NO")));
        assert_eq!(doc.get_path("meta.created.by"), Some(&NativeValue::from("cli")));

        assert_eq!(doc.remove_path("address.zip"), Some(NativeValue::Int32(150)));
        assert!(doc.get_path("address.zip").is_none());
    }

    #[test]
    fn test_kind_aliases() {
        for kind in NativeKind::ALL {
            assert_eq!(NativeKind::from_alias(kind.alias()), Some(kind));
            assert_eq!(NativeKind::from_code(kind.code()), Some(kind));
        }
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(NativeValue::Double(3.0).as_i64(), Some(3));
        assert_eq!(NativeValue::Double(3.5).as_i64(), None);
        assert_eq!(NativeValue::Int32(7).as_f64(), Some(7.0));
        assert!(!NativeValue::Int64(0).is_truthy());
        assert!(NativeValue::from("").is_truthy());
    }

    #[test]
    fn test_display_shell_style() {
        let doc: Document = [("n", NativeValue::Int64(7)), ("d", NativeValue::DateTime(0))]
            .into_iter()
            .collect();
        assert_eq!(
            doc.to_string(),
            "{ n: NumberLong(7), d: ISODate(\"1970-01-01T00:00:00.000Z\") }"
        );
    }
}
