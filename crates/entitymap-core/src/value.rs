//! Dynamic column values.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A dynamically-typed column value.
///
/// Records hold one `Value` per declared column. Identity keys are built from
/// values too, so besides the derived `PartialEq` every value has a total
/// order ([`Value::total_cmp`]) and a matching hash ([`Value::hash_into`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Value generated by the store on insert (auto-increment), not known yet
    Default,
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is still waiting for the store to generate it.
    pub const fn is_default(&self) -> bool {
        matches!(self, Value::Default)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Default => "DEFAULT",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) | Value::Timestamp(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// The form used inside identity keys: integers are widened to `BigInt`.
    #[must_use]
    pub fn canonical(self) -> Self {
        match self {
            Value::Int(v) => Value::BigInt(i64::from(v)),
            other => other,
        }
    }

    /// Ordering rank of the value class. Integers of both widths share a rank.
    const fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::BigInt(_) => 2,
            Value::Double(_) => 3,
            Value::Text(_) => 4,
            Value::Bytes(_) => 5,
            Value::Timestamp(_) => 6,
            Value::Uuid(_) => 7,
            Value::Json(_) => 8,
            Value::Default => 9,
        }
    }

    /// Total order over values.
    ///
    /// Values of different classes order by class; integers compare
    /// numerically regardless of width, doubles use `f64::total_cmp`, JSON
    /// compares by its serialized text.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(_) | Value::BigInt(_), Value::Int(_) | Value::BigInt(_)) => {
                // Both arms are integers, `as_i64` cannot fail here.
                self.as_i64().cmp(&other.as_i64())
            }
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Equality under [`Value::total_cmp`] (`NaN` equals itself, `Int(1)` equals `BigInt(1)`).
    pub fn same_as(&self, other: &Value) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }

    /// Feed this value into `hasher`, consistently with [`Value::total_cmp`].
    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        self.rank().hash(hasher);
        match self {
            Value::Null | Value::Default => {}
            Value::Bool(b) => b.hash(hasher),
            Value::Int(_) | Value::BigInt(_) | Value::Timestamp(_) => {
                self.as_i64().hash(hasher);
            }
            Value::Double(f) => f.to_bits().hash(hasher),
            Value::Text(s) => s.hash(hasher),
            Value::Bytes(b) => b.hash(hasher),
            Value::Uuid(u) => u.hash(hasher),
            Value::Json(j) => j.to_string().hash(hasher),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::BigInt(v) | Value::Timestamp(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{}", j),
            Value::Default => write!(f, "DEFAULT"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        v.hash_into(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn integers_compare_across_widths() {
        assert!(Value::Int(7).same_as(&Value::BigInt(7)));
        assert_eq!(hash_of(&Value::Int(7)), hash_of(&Value::BigInt(7)));
        assert_eq!(Value::Int(2).total_cmp(&Value::BigInt(10)), Ordering::Less);
    }

    #[test]
    fn different_classes_never_equal() {
        assert!(!Value::BigInt(42).same_as(&Value::Text("42".into())));
        assert_ne!(
            hash_of(&Value::BigInt(42)),
            hash_of(&Value::Text("42".into()))
        );
        assert_eq!(Value::Null.total_cmp(&Value::Bool(false)), Ordering::Less);
    }

    #[test]
    fn doubles_have_total_order() {
        let nan = Value::Double(f64::NAN);
        assert!(nan.same_as(&nan.clone()));
        assert_eq!(
            Value::Double(-1.5).total_cmp(&Value::Double(2.0)),
            Ordering::Less
        );
    }

    #[test]
    fn canonical_widens_int() {
        assert_eq!(Value::Int(3).canonical(), Value::BigInt(3));
        assert_eq!(Value::Text("x".into()).canonical(), Value::Text("x".into()));
    }

    #[test]
    fn option_conversion() {
        assert_eq!(Value::from(Some(5_i64)), Value::BigInt(5));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from("abc"), Value::Text("abc".to_string()));
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(Value::BigInt(9).to_string(), "9");
        assert_eq!(Value::Text("a".into()).to_string(), "'a'");
        assert_eq!(Value::Uuid([0xab; 16]).to_string(), "ab".repeat(16));
    }
}
