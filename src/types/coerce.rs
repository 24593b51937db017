//! Conversions between cells and native values
//!
//! Reads (`to_canonical`) always succeed. Writes (`to_native`) are strict:
//! anything that would lose information is a `TypeCoercionError`.

use super::{CanonicalType, Cell};
use crate::native::{from_extended_json, to_extended_json, JsonMode, NativeKind, NativeValue, ObjectId};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

/// A cell could not be represented as the requested native kind
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Cannot convert {from} to {to}: {reason}")]
pub struct TypeCoercionError {
    pub from: CanonicalType,
    pub to: NativeKind,
    pub reason: String,
}

impl TypeCoercionError {
    fn new(cell: &Cell, to: NativeKind, reason: impl Into<String>) -> Self {
        Self {
            from: cell.canonical_type(),
            to,
            reason: reason.into(),
        }
    }
}

/// Map a native value to its cell
pub fn to_canonical(value: &NativeValue) -> Cell {
    match value {
        NativeValue::Null | NativeValue::Undefined => Cell::Null,
        NativeValue::Bool(b) => Cell::Boolean(*b),
        NativeValue::Int32(i) => Cell::Integer(i64::from(*i)),
        NativeValue::Int64(i) => Cell::Integer(*i),
        NativeValue::Double(f) => Cell::Float(*f),
        NativeValue::Decimal128(d) => Cell::Decimal(*d),
        NativeValue::String(s) => Cell::String(s.clone()),
        NativeValue::DateTime(ms) => Cell::DateTime(*ms),
        NativeValue::Timestamp { time, increment } => Cell::Timestamp {
            time: *time,
            increment: *increment,
        },
        NativeValue::ObjectId(oid) => Cell::Identifier(*oid),
        NativeValue::Binary { subtype, bytes } => Cell::Binary {
            subtype: *subtype,
            bytes: bytes.clone(),
        },
        NativeValue::Document(doc) => Cell::Document(doc.clone()),
        NativeValue::Array(items) => Cell::Array(items.clone()),
        NativeValue::Regex { .. }
        | NativeValue::MinKey
        | NativeValue::MaxKey
        | NativeValue::JavaScript(_) => Cell::Opaque {
            kind: value.kind(),
            bytes: to_extended_json(value, JsonMode::Canonical).to_string().into_bytes(),
        },
    }
}

/// The kind a cell is written as when no schema says otherwise
pub fn natural_kind(cell: &Cell) -> NativeKind {
    match cell {
        Cell::Null => NativeKind::Null,
        Cell::Boolean(_) => NativeKind::Bool,
        Cell::Integer(i) if i32::try_from(*i).is_ok() => NativeKind::Int32,
        Cell::Integer(_) => NativeKind::Int64,
        Cell::Float(_) => NativeKind::Double,
        Cell::Decimal(_) => NativeKind::Decimal128,
        Cell::String(_) => NativeKind::String,
        Cell::Identifier(_) => NativeKind::ObjectId,
        Cell::Binary { .. } => NativeKind::Binary,
        Cell::DateTime(_) => NativeKind::DateTime,
        Cell::Timestamp { .. } => NativeKind::Timestamp,
        Cell::Document(_) => NativeKind::Document,
        Cell::Array(_) => NativeKind::Array,
        Cell::Opaque { kind, .. } => *kind,
    }
}

/// Convert a cell to the given native kind, failing on any loss
///
/// Null converts to every kind (as `null`, or `undefined` when that is the target).
pub fn to_native(cell: &Cell, kind: NativeKind) -> Result<NativeValue, TypeCoercionError> {
    let err = |reason: &str| TypeCoercionError::new(cell, kind, reason);

    match (cell, kind) {
        (Cell::Null, NativeKind::Undefined) => Ok(NativeValue::Undefined),
        (Cell::Null, _) => Ok(NativeValue::Null),

        (Cell::Boolean(b), NativeKind::Bool) => Ok(NativeValue::Bool(*b)),

        (Cell::Integer(i), NativeKind::Int32) => i32::try_from(*i)
            .map(NativeValue::Int32)
            .map_err(|_| err("value out of 32-bit range")),
        (Cell::Integer(i), NativeKind::Int64) => Ok(NativeValue::Int64(*i)),
        (Cell::Integer(i), NativeKind::Double) => {
            let f = *i as f64;
            if f as i64 == *i && i.unsigned_abs() <= (1u64 << 53) {
                Ok(NativeValue::Double(f))
            } else {
                Err(err("integer not exactly representable as double"))
            }
        }
        (Cell::Integer(i), NativeKind::Decimal128) => Ok(NativeValue::Decimal128(Decimal::from(*i))),
        (Cell::Integer(ms), NativeKind::DateTime) => Ok(NativeValue::DateTime(*ms)),

        (Cell::Float(f), NativeKind::Double) => Ok(NativeValue::Double(*f)),
        (Cell::Float(f), NativeKind::Int32 | NativeKind::Int64) => {
            if !f.is_finite() || f.fract() != 0.0 {
                return Err(err("fractional or non-finite value"));
            }
            if kind == NativeKind::Int32 {
                if *f < f64::from(i32::MIN) || *f > f64::from(i32::MAX) {
                    return Err(err("value out of 32-bit range"));
                }
                Ok(NativeValue::Int32(*f as i32))
            } else {
                if *f < -9.223_372_036_854_776e18 || *f >= 9.223_372_036_854_776e18 {
                    return Err(err("value out of 64-bit range"));
                }
                Ok(NativeValue::Int64(*f as i64))
            }
        }
        (Cell::Float(f), NativeKind::Decimal128) => float_to_decimal(*f)
            .map(NativeValue::Decimal128)
            .ok_or_else(|| err("value not representable as decimal")),

        (Cell::Decimal(d), NativeKind::Decimal128) => Ok(NativeValue::Decimal128(*d)),
        (Cell::Decimal(d), NativeKind::Double) => {
            let f = d.to_f64().ok_or_else(|| err("value out of double range"))?;
            match float_to_decimal(f) {
                Some(back) if back == *d => Ok(NativeValue::Double(f)),
                _ => Err(err("decimal digits would be lost as double")),
            }
        }
        (Cell::Decimal(d), NativeKind::Int32 | NativeKind::Int64) => {
            if !d.fract().is_zero() {
                return Err(err("fractional value"));
            }
            let i = d.to_i64().ok_or_else(|| err("value out of 64-bit range"))?;
            to_native(&Cell::Integer(i), kind)
        }

        (Cell::String(s), NativeKind::String) => Ok(NativeValue::String(s.clone())),
        (Cell::String(s), NativeKind::ObjectId) => ObjectId::parse_str(s)
            .map(NativeValue::ObjectId)
            .ok_or_else(|| err("not a 24-digit hex identifier")),
        (Cell::String(s), NativeKind::DateTime) => dsql::parse_timestamp(s)
            .map(NativeValue::DateTime)
            .ok_or_else(|| err("unparsable date")),
        (Cell::String(s), NativeKind::Decimal128) => Decimal::from_str(s.trim())
            .map(NativeValue::Decimal128)
            .map_err(|_| err("unparsable decimal")),

        (Cell::Identifier(oid), NativeKind::ObjectId) => Ok(NativeValue::ObjectId(*oid)),
        (Cell::Identifier(oid), NativeKind::String) => Ok(NativeValue::String(oid.to_hex())),

        (Cell::Binary { subtype, bytes }, NativeKind::Binary) => Ok(NativeValue::Binary {
            subtype: *subtype,
            bytes: bytes.clone(),
        }),

        (Cell::DateTime(ms), NativeKind::DateTime) => Ok(NativeValue::DateTime(*ms)),
        (Cell::DateTime(ms), NativeKind::Timestamp) => {
            if ms % 1000 != 0 {
                return Err(err("timestamps have second precision"));
            }
            u32::try_from(ms / 1000)
                .map(|time| NativeValue::Timestamp { time, increment: 0 })
                .map_err(|_| err("value out of timestamp range"))
        }
        (Cell::Timestamp { time, increment }, NativeKind::Timestamp) => Ok(NativeValue::Timestamp {
            time: *time,
            increment: *increment,
        }),
        (Cell::Timestamp { time, .. }, NativeKind::DateTime) => Ok(NativeValue::DateTime(i64::from(*time) * 1000)),

        (Cell::Document(doc), NativeKind::Document) => Ok(NativeValue::Document(doc.clone())),
        (Cell::Array(items), NativeKind::Array) => Ok(NativeValue::Array(items.clone())),

        (Cell::Opaque { kind: stored, bytes }, _) if *stored == kind => {
            let json: serde_json::Value =
                serde_json::from_slice(bytes).map_err(|_| err("corrupt extended JSON"))?;
            let value = from_extended_json(&json);
            if value.kind() == kind {
                Ok(value)
            } else {
                Err(err("extended JSON does not hold the stored kind"))
            }
        }

        _ => Err(err("incompatible kinds")),
    }
}

/// Decimal with the shortest decimal form that reads back as `f`
fn float_to_decimal(f: f64) -> Option<Decimal> {
    if !f.is_finite() {
        return None;
    }
    Decimal::from_str(&f.to_string())
        .or_else(|_| Decimal::from_scientific(&format!("{:e}", f)))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::Document;
    use proptest::prelude::*;

    fn samples() -> Vec<NativeValue> {
        let mut doc = Document::new();
        doc.insert("a", 1);
        vec![
            NativeValue::Null,
            NativeValue::Undefined,
            NativeValue::Bool(true),
            NativeValue::Int32(-7),
            NativeValue::Int64(1 << 40),
            NativeValue::Double(2.5),
            NativeValue::Decimal128(Decimal::from_str("10.25").unwrap()),
            NativeValue::from("text"),
            NativeValue::DateTime(1_704_153_600_123),
            NativeValue::Timestamp { time: 1_700_000_000, increment: 0 },
            NativeValue::Timestamp { time: 1_700_000_000, increment: 5 },
            NativeValue::ObjectId(ObjectId::parse_str("64b0f0c2a1b2c3d4e5f60718").unwrap()),
            NativeValue::Binary { subtype: 0, bytes: vec![0xde, 0xad] },
            NativeValue::Regex { pattern: "^a".into(), options: "i".into() },
            NativeValue::Document(doc),
            NativeValue::Array(vec![NativeValue::Int32(1), NativeValue::from("x")]),
            NativeValue::MinKey,
            NativeValue::MaxKey,
            NativeValue::JavaScript("return 1".into()),
        ]
    }

    #[test]
    fn test_round_trip_every_kind() {
        for value in samples() {
            let cell = to_canonical(&value);
            let back = to_native(&cell, value.kind()).unwrap();
            assert_eq!(back, value, "round trip through {:?}", cell);
        }
    }

    #[test]
    fn test_canonical_type_matches_kind_table() {
        for value in samples() {
            assert_eq!(
                to_canonical(&value).canonical_type(),
                CanonicalType::of_kind(value.kind()),
                "{:?}",
                value
            );
        }
    }

    #[test]
    fn test_timestamp_keeps_increment() {
        let value = NativeValue::Timestamp { time: 1_700_000_000, increment: 5 };
        let cell = to_canonical(&value);
        assert_eq!(cell.canonical_type(), CanonicalType::DateTime);
        assert_eq!(cell.as_datetime(), Some(1_700_000_000_000));
        assert_eq!(to_native(&cell, NativeKind::Timestamp), Ok(value));
        assert_eq!(
            to_native(&cell, NativeKind::DateTime),
            Ok(NativeValue::DateTime(1_700_000_000_000))
        );
    }

    #[test]
    fn test_fractional_float_to_int_fails() {
        let err = to_native(&Cell::Float(2.5), NativeKind::Int64).unwrap_err();
        assert_eq!(err.from, CanonicalType::Float);
        assert_eq!(err.to, NativeKind::Int64);
        assert!(to_native(&Cell::Float(2.0), NativeKind::Int64).is_ok());
    }

    #[test]
    fn test_out_of_range_int32() {
        assert!(to_native(&Cell::Integer(1 << 40), NativeKind::Int32).is_err());
        assert_eq!(
            to_native(&Cell::Integer(12), NativeKind::Int32),
            Ok(NativeValue::Int32(12))
        );
    }

    #[test]
    fn test_unparsable_strings() {
        assert!(to_native(&Cell::from("not-an-id"), NativeKind::ObjectId).is_err());
        assert!(to_native(&Cell::from("yesterday"), NativeKind::DateTime).is_err());
        assert!(to_native(&Cell::from("2024-01-02T00:00:00Z"), NativeKind::DateTime).is_ok());
    }

    #[test]
    fn test_decimal_float_loss() {
        let exact = Cell::Decimal(Decimal::from_str("9.99").unwrap());
        assert_eq!(to_native(&exact, NativeKind::Double), Ok(NativeValue::Double(9.99)));

        let long = Cell::Decimal(Decimal::from_str("0.1234567890123456789").unwrap());
        assert!(to_native(&long, NativeKind::Double).is_err());
    }

    #[test]
    fn test_kind_mismatch() {
        assert!(to_native(&Cell::Boolean(true), NativeKind::Int32).is_err());
        assert!(to_native(&Cell::from("x"), NativeKind::Document).is_err());
    }

    #[test]
    fn test_natural_kind() {
        assert_eq!(natural_kind(&Cell::Integer(5)), NativeKind::Int32);
        assert_eq!(natural_kind(&Cell::Integer(1 << 40)), NativeKind::Int64);
    }

    fn arb_scalar() -> impl Strategy<Value = NativeValue> {
        prop_oneof![
            Just(NativeValue::Null),
            Just(NativeValue::Undefined),
            any::<bool>().prop_map(NativeValue::Bool),
            any::<i32>().prop_map(NativeValue::Int32),
            any::<i64>().prop_map(NativeValue::Int64),
            any::<f64>()
                .prop_filter("NaN never compares equal", |f| !f.is_nan())
                .prop_map(NativeValue::Double),
            (any::<i64>(), 0u32..=10).prop_map(|(n, scale)| NativeValue::Decimal128(Decimal::new(n, scale))),
            "[a-zA-Z0-9 _-]{0,12}".prop_map(NativeValue::String),
            (-62_135_596_800_000i64..253_402_300_799_000).prop_map(NativeValue::DateTime),
            (any::<u32>(), any::<u32>()).prop_map(|(time, increment)| NativeValue::Timestamp { time, increment }),
            any::<[u8; 12]>().prop_map(|bytes| NativeValue::ObjectId(ObjectId::from_bytes(bytes))),
            (0u8..=8, prop::collection::vec(any::<u8>(), 0..16))
                .prop_map(|(subtype, bytes)| NativeValue::Binary { subtype, bytes }),
            ("[a-z^$.*]{0,8}", prop::sample::select(vec!["", "i", "m", "im", "sx"])).prop_map(|(pattern, options)| {
                NativeValue::Regex { pattern, options: options.to_string() }
            }),
            Just(NativeValue::MinKey),
            Just(NativeValue::MaxKey),
        ]
    }

    fn arb_value() -> impl Strategy<Value = NativeValue> {
        arb_scalar().prop_recursive(2, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(NativeValue::Array),
                prop::collection::vec(("[a-z]{1,6}", inner), 0..4).prop_map(|fields| {
                    let mut doc = Document::new();
                    for (key, value) in fields {
                        doc.insert(key.as_str(), value);
                    }
                    NativeValue::Document(doc)
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip_keeps_kind_and_value(value in arb_value()) {
            let cell = to_canonical(&value);
            prop_assert_eq!(cell.canonical_type(), CanonicalType::of_kind(value.kind()));
            prop_assert_eq!(to_native(&cell, value.kind()), Ok(value));
        }

        #[test]
        fn prop_natural_kind_writes_back_the_same_cell(value in arb_scalar()) {
            let cell = to_canonical(&value);
            let written = to_native(&cell, natural_kind(&cell)).unwrap();
            prop_assert_eq!(to_canonical(&written), cell);
        }
    }
}
