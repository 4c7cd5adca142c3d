use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, SyncError, SyncResult};

/// A single column value.
///
/// `Integer` and `Number` both represent numbers, kept apart so integer keys compare and
/// hash exactly. Values are totally ordered, floats by [`f64::total_cmp`], so they can be
/// used in primary keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(timestamp) => Some(*timestamp),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) | Value::Number(_) => 2,
            Value::Text(_) => 3,
            Value::Timestamp(_) => 4,
        }
    }

    /// Appends a type tagged, length prefixed encoding of the value.
    pub(crate) fn encode_canonical(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(0),
            Value::Bool(value) => {
                buf.push(1);
                buf.push(u8::from(*value));
            }
            Value::Integer(value) => {
                buf.push(2);
                buf.extend_from_slice(&value.to_be_bytes());
            }
            Value::Number(value) => {
                buf.push(3);
                buf.extend_from_slice(&value.to_bits().to_be_bytes());
            }
            Value::Text(value) => {
                buf.push(4);
                buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
                buf.extend_from_slice(value.as_bytes());
            }
            Value::Timestamp(value) => {
                buf.push(5);
                buf.extend_from_slice(&value.timestamp_micros().to_be_bytes());
            }
        }
    }

    /// Appends an unambiguous textual encoding of the value, used to build store keys.
    pub(crate) fn write_key_text(&self, out: &mut String) {
        match self {
            Value::Null => out.push('z'),
            Value::Bool(value) => out.push_str(if *value { "b1" } else { "b0" }),
            Value::Integer(value) => {
                out.push('i');
                out.push_str(&value.to_string());
            }
            Value::Number(value) => {
                out.push('n');
                out.push_str(&format!("{:016x}", value.to_bits()));
            }
            Value::Text(value) => {
                out.push('t');
                out.push_str(&value.len().to_string());
                out.push(':');
                out.push_str(value);
            }
            Value::Timestamp(value) => {
                out.push('s');
                out.push_str(&value.timestamp_micros().to_string());
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            // Integers sort before numbers of the same magnitude.
            (Value::Integer(a), Value::Number(b)) => {
                (*a as f64).total_cmp(b).then(Ordering::Less)
            }
            (Value::Number(a), Value::Integer(b)) => {
                a.total_cmp(&(*b as f64)).then(Ordering::Greater)
            }
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(value) => value.hash(state),
            Value::Integer(value) => value.hash(state),
            Value::Number(value) => value.to_bits().hash(state),
            Value::Text(value) => value.hash(state),
            Value::Timestamp(value) => value.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Number(value) => write!(f, "{value}"),
            Value::Text(value) => write!(f, "{value:?}"),
            Value::Timestamp(value) => write!(f, "{}", value.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Converts plain JSON as typed by an operator. Strings stay text, use the tagged form for
/// timestamps.
impl TryFrom<serde_json::Value> for Value {
    type Error = SyncError;

    fn try_from(value: serde_json::Value) -> SyncResult<Self> {
        let value = match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(value) => Value::Bool(value),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(integer) => Value::Integer(integer),
                None => match number.as_f64() {
                    Some(float) => Value::Number(float),
                    None => bail!(
                        ErrorKind::ConversionError,
                        "Number out of range",
                        number.to_string()
                    ),
                },
            },
            serde_json::Value::String(text) => Value::Text(text),
            serde_json::Value::Object(map) if map.contains_key("type") => {
                serde_json::from_value(serde_json::Value::Object(map))?
            }
            other => bail!(
                ErrorKind::ConversionError,
                "Unsupported JSON value for a column",
                other.to_string()
            ),
        };

        Ok(value)
    }
}
