//! Property values and column storage types
//!
//! Every persisted property maps to one of five storage types:
//! - `Integer`: 64-bit signed integer
//! - `Float`: 64-bit float
//! - `Text`: UTF-8 string (also used for node ids)
//! - `Boolean`: stored as 0/1
//! - `Timestamp`: UTC instant, stored as milliseconds since the epoch

use crate::{Error, Result};
use crate::key::NodeKey;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Storage type code of a physical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
}

impl ColumnType {
    /// Get the string representation of the column type
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
        }
    }

    /// SQL type affinity used when creating tables
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean | ColumnType::Timestamp => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    /// Get all column types
    pub fn all() -> &'static [ColumnType] {
        &[
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Text,
            ColumnType::Boolean,
            ColumnType::Timestamp,
        ]
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "integer" | "int" | "bigint" | "long" => Ok(ColumnType::Integer),
            "float" | "real" | "double" | "number" => Ok(ColumnType::Float),
            "text" | "string" | "varchar" | "char" => Ok(ColumnType::Text),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "timestamp" | "date" | "datetime" => Ok(ColumnType::Timestamp),
            _ => Err(Error::Config(format!("Unknown column type: {}", s))),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A property value held by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Identity of another node, resolved through the node manager
    Reference(NodeKey),
}

impl Value {
    /// Storage type this value naturally maps to (`None` for null and references)
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null | Value::Reference(_) => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert this value so it fits a column of type `ty`.
    ///
    /// Only lossless widenings are accepted: integer → float and
    /// integer milliseconds → timestamp.
    pub fn coerce(self, ty: ColumnType) -> Result<Value> {
        match (self, ty) {
            (Value::Null, _) => Ok(Value::Null),
            (v @ Value::Integer(_), ColumnType::Integer) => Ok(v),
            (Value::Integer(i), ColumnType::Float) => Ok(Value::Float(i as f64)),
            (Value::Integer(ms), ColumnType::Timestamp) => Value::timestamp_from_millis(ms),
            (v @ Value::Float(_), ColumnType::Float) => Ok(v),
            (v @ Value::Text(_), ColumnType::Text) => Ok(v),
            (v @ Value::Boolean(_), ColumnType::Boolean) => Ok(v),
            (v @ Value::Timestamp(_), ColumnType::Timestamp) => Ok(v),
            (v, ty) => Err(Error::InvalidValue(format!("{} does not fit a {} column", v, ty))),
        }
    }

    /// Parse a textual value (e.g. from the command line) as type `ty`.
    pub fn parse_as(ty: ColumnType, s: &str) -> Result<Value> {
        let invalid = || Error::InvalidValue(format!("cannot parse {:?} as {}", s, ty));
        match ty {
            ColumnType::Integer => s.parse().map(Value::Integer).map_err(|_| invalid()),
            ColumnType::Float => s.parse().map(Value::Float).map_err(|_| invalid()),
            ColumnType::Text => Ok(Value::Text(s.to_string())),
            ColumnType::Boolean => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Boolean(true)),
                "false" | "0" | "no" => Ok(Value::Boolean(false)),
                _ => Err(invalid()),
            },
            ColumnType::Timestamp => DateTime::parse_from_rfc3339(s)
                .map(|dt| Value::Timestamp(dt.with_timezone(&Utc)))
                .map_err(|_| invalid()),
        }
    }

    /// Build a timestamp from milliseconds since the epoch
    pub fn timestamp_from_millis(ms: i64) -> Result<Value> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .map(Value::Timestamp)
            .ok_or_else(|| Error::InvalidValue(format!("timestamp out of range: {}", ms)))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&NodeKey> {
        match self {
            Value::Reference(key) => Some(key),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Reference(key) => write!(f, "-> {}", key),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<NodeKey> for Value {
    fn from(key: NodeKey) -> Self {
        Value::Reference(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_aliases() {
        assert_eq!(ColumnType::from_str("varchar").unwrap(), ColumnType::Text);
        assert_eq!(ColumnType::from_str("BIGINT").unwrap(), ColumnType::Integer);
        assert_eq!(ColumnType::from_str("datetime").unwrap(), ColumnType::Timestamp);
        assert!(ColumnType::from_str("blob").is_err());
    }

    #[test]
    fn test_coerce_widens_integer() {
        assert_eq!(Value::Integer(3).coerce(ColumnType::Float).unwrap(), Value::Float(3.0));
        assert_eq!(Value::Null.coerce(ColumnType::Text).unwrap(), Value::Null);
    }

    #[test]
    fn test_coerce_rejects_mismatch() {
        let err = Value::from("abc").coerce(ColumnType::Integer).unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
        assert!(Value::Float(1.5).coerce(ColumnType::Integer).is_err());
    }

    #[test]
    fn test_parse_as() {
        assert_eq!(Value::parse_as(ColumnType::Integer, "42").unwrap(), Value::Integer(42));
        assert_eq!(Value::parse_as(ColumnType::Boolean, "yes").unwrap(), Value::Boolean(true));
        assert!(Value::parse_as(ColumnType::Integer, "4x2").is_err());

        let ts = Value::parse_as(ColumnType::Timestamp, "2024-05-01T10:00:00Z").unwrap();
        assert_eq!(ts, Value::timestamp_from_millis(1_714_557_600_000).unwrap());
    }
}
