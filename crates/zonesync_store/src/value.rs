//! Attribute values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in time, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the epoch.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

/// A fixed-point decimal: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decimal {
    mantissa: i64,
    scale: u32,
}

impl Decimal {
    /// Creates a decimal from a mantissa and a scale.
    pub const fn new(mantissa: i64, scale: u32) -> Self {
        Self { mantissa, scale }
    }

    /// Returns the unscaled value.
    pub const fn mantissa(&self) -> i64 {
        self.mantissa
    }

    /// Returns the number of fractional digits.
    pub const fn scale(&self) -> u32 {
        self.scale
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = u128::from(self.mantissa.unsigned_abs());
        if self.scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let divisor = 10u128.pow(self.scale);
        write!(
            f,
            "{sign}{}.{:0width$}",
            digits / divisor,
            digits % divisor,
            width = self.scale as usize
        )
    }
}

/// A typed attribute value. An absent attribute is "null".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Date.
    Date(Timestamp),
    /// Fixed-point decimal.
    Decimal(Decimal),
}

impl AttributeValue {
    /// Returns the variant name, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Integer(_) => "integer",
            AttributeValue::Double(_) => "double",
            AttributeValue::Text(_) => "text",
            AttributeValue::Bytes(_) => "bytes",
            AttributeValue::Date(_) => "date",
            AttributeValue::Decimal(_) => "decimal",
        }
    }

    /// Returns the text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a bytes value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttributeValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the boolean, if this is a bool value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the integer, if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the float, if this is a double value.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the timestamp, if this is a date value.
    pub fn as_date(&self) -> Option<Timestamp> {
        match self {
            AttributeValue::Date(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the decimal, if this is a decimal value.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            AttributeValue::Decimal(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        AttributeValue::Bytes(value)
    }
}

impl From<Timestamp> for AttributeValue {
    fn from(value: Timestamp) -> Self {
        AttributeValue::Date(value)
    }
}

impl From<Decimal> for AttributeValue {
    fn from(value: Decimal) -> Self {
        AttributeValue::Decimal(value)
    }
}
