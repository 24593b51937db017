//! Extended JSON conversion
//!
//! Reads both canonical and relaxed forms (`{"$oid": ...}`, `{"$date": ...}`,
//! `{"$numberLong": ...}`, ...). Writes relaxed form for display and explain
//! output, canonical form where the kind must survive the trip.

use super::{format_millis, Document, NativeValue, ObjectId};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::str::FromStr;

/// Output flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonMode {
    /// Numbers as plain JSON where that loses nothing a reader cares about
    Relaxed,
    /// Every non-string kind wrapped so it round-trips exactly
    Canonical,
}

/// Convert a native value to extended JSON
pub fn to_extended_json(value: &NativeValue, mode: JsonMode) -> Value {
    let canonical = mode == JsonMode::Canonical;
    match value {
        NativeValue::Null => Value::Null,
        NativeValue::Undefined => json!({ "$undefined": true }),
        NativeValue::Bool(b) => Value::Bool(*b),
        NativeValue::Int32(i) if canonical => json!({ "$numberInt": i.to_string() }),
        NativeValue::Int32(i) => json!(i),
        NativeValue::Int64(i) if canonical => json!({ "$numberLong": i.to_string() }),
        NativeValue::Int64(i) => json!(i),
        NativeValue::Double(f) => double_json(*f, canonical),
        NativeValue::Decimal128(d) => json!({ "$numberDecimal": d.to_string() }),
        NativeValue::String(s) => Value::String(s.clone()),
        NativeValue::DateTime(ms) => {
            let year_in_range = (0..253_402_300_800_000).contains(ms);
            if canonical || !year_in_range {
                json!({ "$date": { "$numberLong": ms.to_string() } })
            } else {
                json!({ "$date": format_millis(*ms) })
            }
        }
        NativeValue::Timestamp { time, increment } => {
            json!({ "$timestamp": { "t": time, "i": increment } })
        }
        NativeValue::ObjectId(oid) => json!({ "$oid": oid.to_hex() }),
        NativeValue::Binary { subtype, bytes } => json!({
            "$binary": { "base64": BASE64.encode(bytes), "subType": format!("{:02x}", subtype) }
        }),
        NativeValue::Regex { pattern, options } => json!({
            "$regularExpression": { "pattern": pattern, "options": options }
        }),
        NativeValue::Document(doc) => document_to_json(doc, mode),
        NativeValue::Array(items) => {
            Value::Array(items.iter().map(|v| to_extended_json(v, mode)).collect())
        }
        NativeValue::MinKey => json!({ "$minKey": 1 }),
        NativeValue::MaxKey => json!({ "$maxKey": 1 }),
        NativeValue::JavaScript(code) => json!({ "$code": code }),
    }
}

pub(crate) fn document_to_json(doc: &Document, mode: JsonMode) -> Value {
    let mut map = Map::with_capacity(doc.len());
    for (k, v) in doc.iter() {
        map.insert(k.to_string(), to_extended_json(v, mode));
    }
    Value::Object(map)
}

fn double_json(f: f64, canonical: bool) -> Value {
    if f.is_nan() {
        json!({ "$numberDouble": "NaN" })
    } else if f.is_infinite() {
        json!({ "$numberDouble": if f > 0.0 { "Infinity" } else { "-Infinity" } })
    } else if canonical || f.fract() == 0.0 {
        // Whole doubles would read back as integers in plain form
        json!({ "$numberDouble": format!("{:?}", f) })
    } else {
        json!(f)
    }
}

/// Convert extended JSON (canonical or relaxed) to a native value
///
/// Plain integers become int32 when they fit, int64 otherwise. Malformed
/// wrappers are kept as ordinary documents.
pub fn from_extended_json(value: &Value) -> NativeValue {
    match value {
        Value::Null => NativeValue::Null,
        Value::Bool(b) => NativeValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i32::try_from(i).map(NativeValue::Int32).unwrap_or(NativeValue::Int64(i))
            } else {
                NativeValue::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => NativeValue::String(s.clone()),
        Value::Array(items) => NativeValue::Array(items.iter().map(from_extended_json).collect()),
        Value::Object(map) => {
            if let Some(special) = wrapper(map) {
                return special;
            }
            NativeValue::Document(
                map.iter().map(|(k, v)| (k.clone(), from_extended_json(v))).collect(),
            )
        }
    }
}

fn wrapper(map: &Map<String, Value>) -> Option<NativeValue> {
    let (key, inner) = map.iter().next()?;
    if !key.starts_with('$') {
        return None;
    }

    match (key.as_str(), map.len()) {
        ("$oid", 1) => ObjectId::parse_str(inner.as_str()?).map(NativeValue::ObjectId),
        ("$numberInt", 1) => inner.as_str()?.parse().ok().map(NativeValue::Int32),
        ("$numberLong", 1) => inner.as_str()?.parse().ok().map(NativeValue::Int64),
        ("$numberDouble", 1) => {
            let f = match inner.as_str()? {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other.parse().ok()?,
            };
            Some(NativeValue::Double(f))
        }
        ("$numberDecimal", 1) => Decimal::from_str(inner.as_str()?)
            .or_else(|_| Decimal::from_scientific(inner.as_str().unwrap_or_default()))
            .ok()
            .map(NativeValue::Decimal128),
        ("$date", 1) => parse_date(inner).map(NativeValue::DateTime),
        ("$timestamp", 1) => {
            let time = inner.get("t")?.as_u64()?;
            let increment = inner.get("i")?.as_u64()?;
            Some(NativeValue::Timestamp {
                time: u32::try_from(time).ok()?,
                increment: u32::try_from(increment).ok()?,
            })
        }
        ("$binary", 1) => {
            let bytes = BASE64.decode(inner.get("base64")?.as_str()?).ok()?;
            let subtype = u8::from_str_radix(inner.get("subType")?.as_str()?, 16).ok()?;
            Some(NativeValue::Binary { subtype, bytes })
        }
        ("$binary", 2) => {
            // Legacy form: {"$binary": "<base64>", "$type": "<hex>"}
            let bytes = BASE64.decode(inner.as_str()?).ok()?;
            let subtype = u8::from_str_radix(map.get("$type")?.as_str()?, 16).ok()?;
            Some(NativeValue::Binary { subtype, bytes })
        }
        ("$regularExpression", 1) => Some(NativeValue::Regex {
            pattern: inner.get("pattern")?.as_str()?.to_string(),
            options: inner.get("options")?.as_str()?.to_string(),
        }),
        ("$regex", 2) => Some(NativeValue::Regex {
            pattern: inner.as_str()?.to_string(),
            options: map.get("$options")?.as_str()?.to_string(),
        }),
        ("$minKey", 1) => Some(NativeValue::MinKey),
        ("$maxKey", 1) => Some(NativeValue::MaxKey),
        ("$undefined", 1) => Some(NativeValue::Undefined),
        ("$code", 1) => Some(NativeValue::JavaScript(inner.as_str()?.to_string())),
        _ => None,
    }
}

fn parse_date(inner: &Value) -> Option<i64> {
    match inner {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        Value::Number(n) => n.as_i64(),
        Value::Object(obj) => obj.get("$numberLong")?.as_str()?.parse().ok(),
        _ => None,
    }
}

/// Render a document as relaxed extended JSON text
pub(crate) fn document_to_string(doc: &Document) -> String {
    document_to_json(doc, JsonMode::Relaxed).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json_kinds() {
        assert_eq!(from_extended_json(&json!(5)), NativeValue::Int32(5));
        assert_eq!(from_extended_json(&json!(5_000_000_000i64)), NativeValue::Int64(5_000_000_000));
        assert_eq!(from_extended_json(&json!(1.5)), NativeValue::Double(1.5));
    }

    #[test]
    fn test_wrappers() {
        let v = from_extended_json(&json!({
            "_id": { "$oid": "64b0f0c2a1b2c3d4e5f60718" },
            "at": { "$date": "2024-01-02T00:00:00Z" },
            "n": { "$numberLong": "7" },
            "price": { "$numberDecimal": "9.99" },
            "re": { "$regex": "^a", "$options": "i" },
        }));
        let doc = v.as_document().unwrap();
        assert!(matches!(doc.get("_id"), Some(NativeValue::ObjectId(_))));
        assert_eq!(doc.get("at"), Some(&NativeValue::DateTime(1_704_153_600_000)));
        assert_eq!(doc.get("n"), Some(&NativeValue::Int64(7)));
        assert_eq!(
            doc.get("price"),
            Some(&NativeValue::Decimal128(Decimal::from_str("9.99").unwrap()))
        );
        assert!(matches!(doc.get("re"), Some(NativeValue::Regex { .. })));
    }

    #[test]
    fn test_canonical_round_trip_keeps_kind() {
        let values = vec![
            NativeValue::Int32(3),
            NativeValue::Int64(3),
            NativeValue::Double(3.0),
            NativeValue::Undefined,
            NativeValue::Timestamp { time: 10, increment: 2 },
            NativeValue::Binary { subtype: 4, bytes: vec![1, 2, 3] },
            NativeValue::MinKey,
            NativeValue::JavaScript("function() {}".into()),
            NativeValue::DateTime(-5),
        ];
        for v in values {
            let json = to_extended_json(&v, JsonMode::Canonical);
            assert_eq!(from_extended_json(&json), v);
        }
    }

    #[test]
    fn test_relaxed_output() {
        let doc: Document = [("a", NativeValue::Int64(1)), ("b", NativeValue::Double(0.5))]
            .into_iter()
            .collect();
        assert_eq!(document_to_string(&doc), r#"{"a":1,"b":0.5}"#);
    }

    #[test]
    fn test_malformed_wrapper_stays_document() {
        let v = from_extended_json(&json!({ "$oid": 12 }));
        assert!(matches!(v, NativeValue::Document(_)));
    }
}
