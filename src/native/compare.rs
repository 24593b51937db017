//! Cross-kind ordering, as the store sorts and compares values

use super::NativeValue;
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// Sort bracket of a value's kind; numbers share one bracket
fn rank(value: &NativeValue) -> u8 {
    match value {
        NativeValue::MinKey => 0,
        NativeValue::Null | NativeValue::Undefined => 1,
        NativeValue::Int32(_)
        | NativeValue::Int64(_)
        | NativeValue::Double(_)
        | NativeValue::Decimal128(_) => 2,
        NativeValue::String(_) => 3,
        NativeValue::Document(_) => 4,
        NativeValue::Array(_) => 5,
        NativeValue::Binary { .. } => 6,
        NativeValue::ObjectId(_) => 7,
        NativeValue::Bool(_) => 8,
        NativeValue::DateTime(_) => 9,
        NativeValue::Timestamp { .. } => 10,
        NativeValue::Regex { .. } => 11,
        NativeValue::JavaScript(_) => 12,
        NativeValue::MaxKey => 13,
    }
}

/// Total order over native values
pub fn compare(a: &NativeValue, b: &NativeValue) -> Ordering {
    let by_rank = rank(a).cmp(&rank(b));
    if by_rank != Ordering::Equal {
        return by_rank;
    }

    match (a, b) {
        (NativeValue::String(x), NativeValue::String(y)) => x.cmp(y),
        (NativeValue::Bool(x), NativeValue::Bool(y)) => x.cmp(y),
        (NativeValue::DateTime(x), NativeValue::DateTime(y)) => x.cmp(y),
        (NativeValue::ObjectId(x), NativeValue::ObjectId(y)) => x.cmp(y),
        (
            NativeValue::Timestamp { time: t1, increment: i1 },
            NativeValue::Timestamp { time: t2, increment: i2 },
        ) => (t1, i1).cmp(&(t2, i2)),
        (
            NativeValue::Binary { subtype: s1, bytes: b1 },
            NativeValue::Binary { subtype: s2, bytes: b2 },
        ) => b1.len().cmp(&b2.len()).then(s1.cmp(s2)).then_with(|| b1.cmp(b2)),
        (
            NativeValue::Regex { pattern: p1, options: o1 },
            NativeValue::Regex { pattern: p2, options: o2 },
        ) => p1.cmp(p2).then_with(|| o1.cmp(o2)),
        (NativeValue::JavaScript(x), NativeValue::JavaScript(y)) => x.cmp(y),
        (NativeValue::Document(x), NativeValue::Document(y)) => {
            for ((k1, v1), (k2, v2)) in x.iter().zip(y.iter()) {
                let ord = k1.cmp(k2).then_with(|| compare(v1, v2));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (NativeValue::Array(x), NativeValue::Array(y)) => {
            for (v1, v2) in x.iter().zip(y.iter()) {
                let ord = compare(v1, v2);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ if a.is_numeric() => compare_numbers(a, b),
        _ => Ordering::Equal,
    }
}

/// Equality with numeric kinds compared by value (`1 == 1.0 == NumberLong(1)`)
pub fn values_equal(a: &NativeValue, b: &NativeValue) -> bool {
    compare(a, b) == Ordering::Equal
}

fn compare_numbers(a: &NativeValue, b: &NativeValue) -> Ordering {
    if let (Some(x), Some(y)) = (integral(a), integral(b)) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (as_decimal(a), as_decimal(b)) {
        if matches!(a, NativeValue::Decimal128(_)) || matches!(b, NativeValue::Decimal128(_)) {
            return x.cmp(&y);
        }
    }

    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    // NaN sorts below every other number and equals itself
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

fn integral(value: &NativeValue) -> Option<i64> {
    match value {
        NativeValue::Int32(i) => Some(i64::from(*i)),
        NativeValue::Int64(i) => Some(*i),
        _ => None,
    }
}

fn as_decimal(value: &NativeValue) -> Option<Decimal> {
    match value {
        NativeValue::Int32(i) => Some(Decimal::from(*i)),
        NativeValue::Int64(i) => Some(Decimal::from(*i)),
        NativeValue::Decimal128(d) => Some(*d),
        NativeValue::Double(f) => Decimal::from_f64_retain(*f),
        _ => None,
    }
}
