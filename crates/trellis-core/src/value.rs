//! Dynamically typed values shared by params, verifier input, and data rows.
//!
//! [`Value`] is the currency of everything that crosses a request boundary:
//! query and body params are decoded into it, the
//! [`Verifier`](crate::verifier::Verifier) coerces it, and the data layer
//! stores rows as [`Values`] maps. [`FieldType`] names the types a declared
//! field or source attribute can be coerced to.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// An ordered mapping of field names to values.
pub type Values = BTreeMap<String, Value>;

/// A single dynamically typed value.
///
/// Serializes to plain JSON (`null`, `true`, `1`, `"text"`, ...). Date-times
/// serialize as RFC 3339 strings; deserializing never produces
/// [`Value::DateTime`], strings stay strings until a [`FieldType`] coerces
/// them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent or explicit null.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Integer(i64),
    /// A floating-point number.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// A point in time with its original offset.
    DateTime(DateTime<FixedOffset>),
    /// An ordered list.
    List(Vec<Value>),
    /// A nested mapping.
    Map(Values),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Return the integer content, if this is an integer.
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Return the boolean content, if this is a boolean.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Return the date-time content, if this is a date-time.
    pub const fn as_datetime(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            Self::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    /// Borrow the nested mapping, if this is a map.
    pub const fn as_map(&self) -> Option<&Values> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow the list content, if this is a list.
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    /// Returns `true` when this is a string that is empty after trimming,
    /// an empty list or map, or null.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.trim().is_empty(),
            Self::List(list) => list.is_empty(),
            Self::Map(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Convert into a `serde_json::Value`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
            Self::DateTime(dt) => f.write_str(&dt.to_rfc3339()),
            Self::List(_) | Self::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Integer),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Self::DateTime(dt)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt.fixed_offset())
    }
}

impl From<Vec<Self>> for Value {
    fn from(list: Vec<Self>) -> Self {
        Self::List(list)
    }
}

impl From<Values> for Value {
    fn from(map: Values) -> Self {
        Self::Map(map)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

/// Build a [`Values`] map from `key => value` pairs.
///
/// ```
/// use trellis_core::values;
///
/// let row = values! { "id" => 1, "title" => "hello" };
/// assert_eq!(row.len(), 2);
/// ```
#[macro_export]
macro_rules! values {
    () => { $crate::value::Values::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::value::Values::new();
        $( map.insert(::std::string::String::from($key), $crate::value::Value::from($value)); )+
        map
    }};
}

/// The types a declared field or attribute can be coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// UTF-8 text.
    String,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// Date-time with offset.
    Datetime,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Datetime => "datetime",
        };
        f.write_str(name)
    }
}

/// A value could not be coerced to the requested [`FieldType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("is not a valid {expected}")]
pub struct CoercionError {
    /// The type the value was being coerced to.
    pub expected: FieldType,
}

/// Accepted non-RFC 3339 date-time layouts, tried in order.
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%d %H:%M:%S%.f %z"];
const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

impl FieldType {
    /// Coerce `value` to this type. Null passes through untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CoercionError`] when the value has no sensible
    /// representation in this type.
    pub fn coerce(self, value: Value) -> Result<Value, CoercionError> {
        let err = CoercionError { expected: self };
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),

            (Self::String, Value::String(s)) => Ok(Value::String(s)),
            (Self::String, Value::List(_) | Value::Map(_)) => Err(err),
            (Self::String, other) => Ok(Value::String(other.to_string())),

            (Self::Integer, Value::Integer(i)) => Ok(Value::Integer(i)),
            (Self::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::Integer).map_err(|_| err)
            }

            (Self::Float, Value::Float(x)) => Ok(Value::Float(x)),
            (Self::Float, Value::Integer(i)) => {
                #[allow(clippy::cast_precision_loss, reason = "integer params widen to float")]
                let widened = i as f64;
                Ok(Value::Float(widened))
            }
            (Self::Float, Value::String(s)) => {
                s.trim().parse::<f64>().map(Value::Float).map_err(|_| err)
            }

            (Self::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (Self::Boolean, Value::Integer(0)) => Ok(Value::Bool(false)),
            (Self::Boolean, Value::Integer(1)) => Ok(Value::Bool(true)),
            (Self::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(err),
            },

            (Self::Datetime, Value::DateTime(dt)) => Ok(Value::DateTime(dt)),
            (Self::Datetime, Value::Integer(secs)) => Utc
                .timestamp_opt(secs, 0)
                .single()
                .map(|dt| Value::DateTime(dt.fixed_offset()))
                .ok_or(err),
            (Self::Datetime, Value::String(s)) => parse_datetime(s.trim())
                .map(Value::DateTime)
                .ok_or(err),

            _ => Err(err),
        }
    }
}

fn parse_datetime(input: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt);
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(input, fmt).ok())
    {
        return Some(dt);
    }
    if let Some(naive) = NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
    {
        return Some(naive.and_utc().fixed_offset());
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn coerces_datetime_with_offset() {
        let coerced = FieldType::Datetime
            .coerce(Value::from("2019-06-14 09:15:39 -0700"))
            .unwrap();
        let dt = coerced.as_datetime().unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S %z").to_string(), "2019-06-14 09:15:39 -0700");
    }

    #[test]
    fn coerces_rfc3339_datetime() {
        let coerced = FieldType::Datetime
            .coerce(Value::from("2024-01-02T03:04:05Z"))
            .unwrap();
        assert!(coerced.as_datetime().is_some());
    }

    #[test]
    fn rejects_garbage_datetime() {
        let err = FieldType::Datetime.coerce(Value::from("yesterday-ish")).unwrap_err();
        assert_eq!(err.to_string(), "is not a valid datetime");
    }

    #[test]
    fn integer_from_string_param() {
        assert_eq!(FieldType::Integer.coerce(Value::from("42")).unwrap(), Value::Integer(42));
        assert!(FieldType::Integer.coerce(Value::from("4x2")).is_err());
    }

    #[test]
    fn null_passes_through_every_type() {
        for ty in [FieldType::String, FieldType::Integer, FieldType::Datetime] {
            assert_eq!(ty.coerce(Value::Null).unwrap(), Value::Null);
        }
    }

    #[test]
    fn boolean_accepts_form_spellings() {
        assert_eq!(FieldType::Boolean.coerce(Value::from("on")).unwrap(), Value::Bool(true));
        assert_eq!(FieldType::Boolean.coerce(Value::from("0")).unwrap(), Value::Bool(false));
    }

    #[test]
    fn json_numbers_keep_integer_precision() {
        let value = Value::from(serde_json::json!({"id": 7, "score": 1.5}));
        let map = value.as_map().unwrap();
        assert_eq!(map.get("id"), Some(&Value::Integer(7)));
        assert_eq!(map.get("score"), Some(&Value::Float(1.5)));
    }

    #[test]
    fn values_macro_builds_map() {
        let row = values! { "id" => 1, "title" => "hello" };
        assert_eq!(row.get("title").and_then(Value::as_str), Some("hello"));
    }
}
