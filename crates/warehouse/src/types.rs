// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Field types, typed values and their backend-native representation
//!
//! The backend-native form is a JSON value. Encoding is lossless except for
//! datetimes, which are normalized to UTC and truncated to whole seconds.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backend-native representation of an encoded value
pub type Native = serde_json::Value;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// The closed set of field types a schema may declare
///
/// Serialized as a short name (`str`, `int`, `list<date>`, ...) so schema
/// declarations read naturally in YAML.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    Date,
    DateTime,
    Decimal,
    Duration,
    List(Box<FieldType>),
}

impl FieldType {
    pub fn list(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    /// Types with a total order and stable equality, usable as primary-key components
    #[must_use]
    pub fn is_key_type(&self) -> bool {
        matches!(
            self,
            FieldType::Str
                | FieldType::Int
                | FieldType::Bool
                | FieldType::Date
                | FieldType::DateTime
                | FieldType::Decimal
        )
    }

    /// Whether values of this type may carry naive datetimes awaiting a timezone
    #[must_use]
    pub fn holds_datetimes(&self) -> bool {
        match self {
            FieldType::DateTime => true,
            FieldType::List(inner) => inner.holds_datetimes(),
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Str => write!(f, "str"),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::Date => write!(f, "date"),
            FieldType::DateTime => write!(f, "datetime"),
            FieldType::Decimal => write!(f, "decimal"),
            FieldType::Duration => write!(f, "duration"),
            FieldType::List(inner) => write!(f, "list<{inner}>"),
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if let Some(inner) = name
            .strip_prefix("list<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return Ok(FieldType::list(inner.parse()?));
        }
        match name.to_ascii_lowercase().as_str() {
            "str" | "string" => Ok(FieldType::Str),
            "int" | "integer" => Ok(FieldType::Int),
            "float" => Ok(FieldType::Float),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "date" => Ok(FieldType::Date),
            "datetime" | "timestamp" => Ok(FieldType::DateTime),
            "decimal" => Ok(FieldType::Decimal),
            "duration" => Ok(FieldType::Duration),
            other => Err(format!("unsupported field type '{other}'")),
        }
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.to_string()
    }
}

/// A typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    /// A timezone-aware instant; equality compares instants
    DateTime(DateTime<FixedOffset>),
    /// A naive datetime, valid only once a schema timezone is attributed to it
    LocalDateTime(NaiveDateTime),
    Decimal(Decimal),
    Duration(TimeDelta),
    List(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Str(_) => "str",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::LocalDateTime(_) => "naive datetime",
            Value::Decimal(_) => "decimal",
            Value::Duration(_) => "duration",
            Value::List(_) => "list",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            Value::DateTime(dt) => Some(dt),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for Value {
    fn from(value: DateTime<Tz>) -> Self {
        Value::DateTime(value.fixed_offset())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::LocalDateTime(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Decimal(value)
    }
}

impl From<TimeDelta> for Value {
    fn from(value: TimeDelta) -> Self {
        Value::Duration(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// A value that does not fit its declared type; the schema adds the field name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError {
    pub expected: String,
    pub actual: String,
}

impl CodecError {
    fn new(expected: &FieldType, actual: impl Into<String>) -> Self {
        Self {
            expected: expected.to_string(),
            actual: actual.into(),
        }
    }

    pub fn for_field(self, field: &str) -> crate::error::SchemaError {
        crate::error::SchemaError::type_mismatch(field, self.expected, self.actual)
    }
}

/// Structural and range check of a value against a declared type
///
/// `Null` validates against every type. Naive datetimes never validate here;
/// the schema must attribute a timezone first.
#[must_use]
pub fn validate(value: &Value, ty: &FieldType) -> bool {
    match (value, ty) {
        (Value::Null, _) => true,
        (Value::Str(_), FieldType::Str)
        | (Value::Int(_), FieldType::Int)
        | (Value::Float(_), FieldType::Float)
        | (Value::Bool(_), FieldType::Bool)
        | (Value::Date(_), FieldType::Date)
        | (Value::Decimal(_), FieldType::Decimal)
        | (Value::Duration(_), FieldType::Duration) => true,
        (Value::DateTime(dt), FieldType::DateTime) => {
            DateTime::from_timestamp(dt.timestamp(), 0).is_some()
        }
        (Value::List(items), FieldType::List(inner)) => items
            .iter()
            .all(|item| !item.is_null() && validate(item, inner)),
        _ => false,
    }
}

/// Encode a value into its backend-native form
pub fn encode(value: &Value, ty: &FieldType) -> Result<Native, CodecError> {
    if !validate(value, ty) {
        return Err(CodecError::new(ty, value.type_name()));
    }
    let native = match (value, ty) {
        (Value::Null, _) => Native::Null,
        (Value::Str(s), _) => Native::String(s.clone()),
        (Value::Int(i), _) => Native::from(*i),
        (Value::Float(f), _) => encode_float(*f),
        (Value::Bool(b), _) => Native::Bool(*b),
        (Value::Date(d), _) => Native::String(d.format(DATE_FORMAT).to_string()),
        (Value::DateTime(dt), _) => Native::from(dt.timestamp()),
        (Value::Decimal(d), _) => serde_json::json!({
            "mantissa": d.mantissa().to_string(),
            "scale": d.scale(),
        }),
        (Value::Duration(d), _) => serde_json::json!([d.num_seconds(), d.subsec_nanos()]),
        (Value::List(items), FieldType::List(inner)) => Native::Array(
            items
                .iter()
                .map(|item| encode(item, inner))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        _ => return Err(CodecError::new(ty, value.type_name())),
    };
    Ok(native)
}

fn encode_float(f: f64) -> Native {
    match serde_json::Number::from_f64(f) {
        Some(n) => Native::Number(n),
        None if f.is_nan() => Native::String("NaN".into()),
        None if f.is_sign_positive() => Native::String("inf".into()),
        None => Native::String("-inf".into()),
    }
}

/// Decode a backend-native value; datetimes come back in UTC
pub fn decode(native: &Native, ty: &FieldType) -> Result<Value, CodecError> {
    let mismatch = || CodecError::new(ty, native_kind(native));
    let value = match (native, ty) {
        (Native::Null, _) => Value::Null,
        (Native::String(s), FieldType::Str) => Value::Str(s.clone()),
        (Native::Number(n), FieldType::Int) => Value::Int(n.as_i64().ok_or_else(mismatch)?),
        (Native::Number(n), FieldType::Float) => Value::Float(n.as_f64().ok_or_else(mismatch)?),
        (Native::String(s), FieldType::Float) => match s.as_str() {
            "NaN" => Value::Float(f64::NAN),
            "inf" => Value::Float(f64::INFINITY),
            "-inf" => Value::Float(f64::NEG_INFINITY),
            _ => return Err(mismatch()),
        },
        (Native::Bool(b), FieldType::Bool) => Value::Bool(*b),
        (Native::String(s), FieldType::Date) => {
            Value::Date(NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| mismatch())?)
        }
        (Native::Number(n), FieldType::DateTime) => {
            let secs = n.as_i64().ok_or_else(mismatch)?;
            let dt = DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(mismatch)?;
            Value::DateTime(dt.fixed_offset())
        }
        (Native::String(s), FieldType::DateTime) => {
            let dt = DateTime::parse_from_rfc3339(s).map_err(|_| mismatch())?;
            let secs = dt.timestamp();
            let utc = DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(mismatch)?;
            Value::DateTime(utc.fixed_offset())
        }
        (Native::Object(map), FieldType::Decimal) => {
            let mantissa = map
                .get("mantissa")
                .and_then(Native::as_str)
                .and_then(|m| m.parse::<i128>().ok())
                .ok_or_else(mismatch)?;
            let scale = map
                .get("scale")
                .and_then(Native::as_u64)
                .and_then(|s| u32::try_from(s).ok())
                .ok_or_else(mismatch)?;
            Value::Decimal(
                Decimal::try_from_i128_with_scale(mantissa, scale).map_err(|_| mismatch())?,
            )
        }
        (Native::String(s), FieldType::Decimal) => {
            Value::Decimal(Decimal::from_str_exact(s).map_err(|_| mismatch())?)
        }
        (Native::Array(parts), FieldType::Duration) => {
            let [secs, nanos] = parts.as_slice() else {
                return Err(mismatch());
            };
            let secs = secs.as_i64().ok_or_else(mismatch)?;
            let nanos = nanos.as_i64().ok_or_else(mismatch)?;
            let whole = TimeDelta::try_seconds(secs).ok_or_else(mismatch)?;
            Value::Duration(
                whole
                    .checked_add(&TimeDelta::nanoseconds(nanos))
                    .ok_or_else(mismatch)?,
            )
        }
        (Native::Array(items), FieldType::List(inner)) => Value::List(
            items
                .iter()
                .map(|item| decode(item, inner))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        _ => return Err(mismatch()),
    };
    Ok(value)
}

fn native_kind(native: &Native) -> &'static str {
    match native {
        Native::Null => "null",
        Native::Bool(_) => "boolean",
        Native::Number(_) => "number",
        Native::String(_) => "string",
        Native::Array(_) => "array",
        Native::Object(_) => "object",
    }
}
