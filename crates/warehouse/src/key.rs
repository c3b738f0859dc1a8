// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Storage key derivation
//!
//! A storage key is the lowercase hex form of an order-preserving tuple encoding
//! of the primary-key values. Each component is a type tag followed by a payload
//! whose byte order matches the value order:
//!
//! - strings: UTF-8 with `0x00` escaped as `0x00 0xFF`, terminated by `0x00`
//! - integers, dates, datetimes: sign-flipped big-endian
//! - booleans: one byte
//! - decimals: sign class, exponent and significant digits, complemented when negative
//!
//! The encoding is injective, so distinct primary keys never share a storage key,
//! and the encoding of a leading subset of components is a byte prefix of every
//! key that starts with those components.

use crate::error::SchemaError;
use crate::schema::{Record, Schema};
use crate::types::{self, FieldType, Value};
use chrono::Datelike;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_DECIMAL: u8 = 0x03;
const TAG_DATE: u8 = 0x04;
const TAG_DATETIME: u8 = 0x05;
const TAG_STR: u8 = 0x06;

const DECIMAL_NEGATIVE: u8 = 0x01;
const DECIMAL_ZERO: u8 = 0x02;
const DECIMAL_POSITIVE: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// The empty key, a prefix of every key
    pub fn root() -> Self {
        StorageKey(String::new())
    }

    /// Key for a single string component, used for catalog and checkpoint documents
    pub fn for_name(name: &str) -> Self {
        let mut buf = Vec::with_capacity(name.len() + 2);
        encode_str(&mut buf, name);
        StorageKey(hex::encode(buf))
    }

    /// Parse a key previously rendered with `as_str`
    pub fn parse(encoded: &str) -> Result<Self, String> {
        if encoded.len() % 2 != 0
            || !encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(format!("'{encoded}' is not a lowercase hex storage key"));
        }
        Ok(StorageKey(encoded.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Prefix relation on whole components
    pub fn starts_with(&self, prefix: &StorageKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StorageKey::parse(&value)
    }
}

impl From<StorageKey> for String {
    fn from(value: StorageKey) -> Self {
        value.0
    }
}

/// Derive the storage key of a record from its primary-key fields
pub fn derive_key(record: &Record, schema: &Schema) -> Result<StorageKey, SchemaError> {
    let mut buf = Vec::new();
    for field in schema.primary_key_fields() {
        let value = match record.get(field) {
            None | Some(Value::Null) => {
                return Err(SchemaError::MissingPrimaryKey {
                    field: field.clone(),
                });
            }
            Some(value) => value,
        };
        encode_component(&mut buf, field, value, schema)?;
    }
    Ok(StorageKey(hex::encode(buf)))
}

/// Derive a full key from primary-key values given in declaration order
pub fn derive_from_values(values: &[Value], schema: &Schema) -> Result<StorageKey, SchemaError> {
    let fields = schema.primary_key_fields();
    if values.len() != fields.len() {
        return Err(SchemaError::InvalidDeclaration(format!(
            "expected {} primary key values, got {}",
            fields.len(),
            values.len()
        )));
    }
    derive_prefix(values, schema)
}

/// Derive the key prefix matching every key whose leading components equal `values`
pub fn derive_prefix(values: &[Value], schema: &Schema) -> Result<StorageKey, SchemaError> {
    let fields = schema.primary_key_fields();
    if values.len() > fields.len() {
        return Err(SchemaError::InvalidDeclaration(format!(
            "expected at most {} primary key values, got {}",
            fields.len(),
            values.len()
        )));
    }
    let mut buf = Vec::new();
    for (field, value) in fields.iter().zip(values) {
        if value.is_null() {
            return Err(SchemaError::MissingPrimaryKey {
                field: field.clone(),
            });
        }
        encode_component(&mut buf, field, value, schema)?;
    }
    Ok(StorageKey(hex::encode(buf)))
}

fn encode_component(
    buf: &mut Vec<u8>,
    field: &str,
    value: &Value,
    schema: &Schema,
) -> Result<(), SchemaError> {
    let ty = schema
        .field_type(field)
        .ok_or_else(|| SchemaError::InvalidDeclaration(format!("no type for '{field}'")))?;
    let mismatch = || SchemaError::type_mismatch(field, ty.to_string(), value.type_name());
    if !types::validate(value, ty) {
        return Err(mismatch());
    }
    match (value, ty) {
        (Value::Bool(b), FieldType::Bool) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*b));
        }
        (Value::Int(i), FieldType::Int) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&flip_i64(*i));
        }
        (Value::Decimal(d), FieldType::Decimal) => {
            buf.push(TAG_DECIMAL);
            encode_decimal(buf, *d);
        }
        (Value::Date(d), FieldType::Date) => {
            buf.push(TAG_DATE);
            let days = d.num_days_from_ce();
            buf.extend_from_slice(&((days as u32) ^ 0x8000_0000).to_be_bytes());
        }
        (Value::DateTime(dt), FieldType::DateTime) => {
            buf.push(TAG_DATETIME);
            buf.extend_from_slice(&flip_i64(dt.timestamp()));
        }
        (Value::Str(s), FieldType::Str) => {
            buf.push(TAG_STR);
            encode_str(buf, s);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn flip_i64(i: i64) -> [u8; 8] {
    ((i as u64) ^ (1 << 63)).to_be_bytes()
}

fn encode_str(buf: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        buf.push(b);
        if b == 0x00 {
            buf.push(0xFF);
        }
    }
    buf.push(0x00);
}

/// Decimals as `0.DIGITS x 10^exponent` with trailing zeros stripped, so equal
/// values of different scale (1.0 and 1.00) share one encoding
fn encode_decimal(buf: &mut Vec<u8>, d: Decimal) {
    if d.is_zero() {
        buf.push(DECIMAL_ZERO);
        return;
    }
    let digits = d.mantissa().unsigned_abs().to_string();
    let exponent = digits.len() as i64 - i64::from(d.scale());
    let digits = digits.trim_end_matches('0');
    let biased = ((exponent as i32) as u32) ^ 0x8000_0000;

    if d.is_sign_negative() {
        buf.push(DECIMAL_NEGATIVE);
        buf.extend_from_slice(&(!biased).to_be_bytes());
        buf.extend(digits.bytes().map(|b| 0xFF - b));
        buf.push(0xFF);
    } else {
        buf.push(DECIMAL_POSITIVE);
        buf.extend_from_slice(&biased.to_be_bytes());
        buf.extend_from_slice(digits.as_bytes());
        buf.push(0x00);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SourceDeclaration;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn schema_for(fields: &[(&str, FieldType)]) -> Schema {
        let mut decl = SourceDeclaration::new(fields.iter().map(|(name, _)| *name));
        for (name, ty) in fields {
            decl = decl.field(*name, ty.clone());
        }
        decl.to_schema("keys", 1).unwrap()
    }

    fn key_of(schema: &Schema, values: &[Value]) -> StorageKey {
        derive_from_values(values, schema).unwrap()
    }

    fn assert_sorted(schema: &Schema, ordered: Vec<Value>) {
        let keys: Vec<StorageKey> = ordered
            .iter()
            .map(|v| key_of(schema, std::slice::from_ref(v)))
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_derivation_is_deterministic_and_ignores_other_fields() {
        let schema = SourceDeclaration::new(["url"])
            .field("url", FieldType::Str)
            .field("filename", FieldType::Str)
            .to_schema("documents", 1)
            .unwrap();
        let a = Record::new().with("url", "http://a").with("filename", "x.pdf");
        let b = Record::new().with("url", "http://a").with("filename", "y.pdf");
        assert_eq!(derive_key(&a, &schema).unwrap(), derive_key(&a, &schema).unwrap());
        assert_eq!(derive_key(&a, &schema).unwrap(), derive_key(&b, &schema).unwrap());
    }

    #[test]
    fn test_missing_or_null_key_field() {
        let schema = schema_for(&[("id", FieldType::Int)]);
        assert!(matches!(
            derive_key(&Record::new(), &schema),
            Err(SchemaError::MissingPrimaryKey { .. })
        ));
        assert!(matches!(
            derive_key(&Record::new().with("id", Value::Null), &schema),
            Err(SchemaError::MissingPrimaryKey { .. })
        ));
    }

    #[test]
    fn test_integer_order() {
        let schema = schema_for(&[("id", FieldType::Int)]);
        assert_sorted(
            &schema,
            [i64::MIN, -1_000_000, -1, 0, 1, 255, 256, i64::MAX]
                .into_iter()
                .map(Value::Int)
                .collect(),
        );
    }

    #[test]
    fn test_string_order_and_embedded_nul() {
        let schema = schema_for(&[("name", FieldType::Str)]);
        assert_sorted(
            &schema,
            ["", "\0", "\0\0", "a", "a\0", "a\0b", "ab", "b"]
                .into_iter()
                .map(Value::from)
                .collect(),
        );
    }

    #[test]
    fn test_decimal_order_ignores_scale() {
        let schema = schema_for(&[("amount", FieldType::Decimal)]);
        let dec = |s: &str| Value::Decimal(Decimal::from_str_exact(s).unwrap());
        assert_sorted(
            &schema,
            ["-1000", "-12.5", "-12.4", "-1", "-0.123", "-0.12", "0", "0.001", "0.12", "0.123", "1", "9.99", "10", "100.5"]
                .into_iter()
                .map(dec)
                .collect(),
        );
        assert_eq!(key_of(&schema, &[dec("1.0")]), key_of(&schema, &[dec("1.00")]));
        assert_eq!(key_of(&schema, &[dec("0.00")]), key_of(&schema, &[dec("0")]));
        assert_ne!(key_of(&schema, &[dec("10")]), key_of(&schema, &[dec("1")]));
    }

    #[test]
    fn test_temporal_order() {
        let schema = schema_for(&[("day", FieldType::Date)]);
        assert_sorted(
            &schema,
            vec![
                Value::Date(NaiveDate::from_ymd_opt(-44, 3, 15).unwrap()),
                Value::Date(NaiveDate::from_ymd_opt(1969, 12, 31).unwrap()),
                Value::Date(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
                Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
            ],
        );

        let schema = schema_for(&[("at", FieldType::DateTime)]);
        assert_sorted(
            &schema,
            vec![
                Value::from(Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap()),
                Value::from(Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap()),
                Value::from(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()),
            ],
        );
    }

    #[test]
    fn test_same_instant_in_different_zones_shares_a_key() {
        let schema = schema_for(&[("at", FieldType::DateTime)]);
        let utc = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let tokyo = utc.with_timezone(&chrono_tz::Asia::Tokyo);
        assert_eq!(
            key_of(&schema, &[Value::from(utc)]),
            key_of(&schema, &[Value::from(tokyo)])
        );
    }

    #[test]
    fn test_composite_prefix() {
        let schema = schema_for(&[("site", FieldType::Str), ("day", FieldType::Int)]);
        let prefix = derive_prefix(&[Value::from("ab")], &schema).unwrap();
        let inside = key_of(&schema, &[Value::from("ab"), Value::Int(3)]);
        let longer = key_of(&schema, &[Value::from("abc"), Value::Int(3)]);
        assert!(inside.starts_with(&prefix));
        assert!(!longer.starts_with(&prefix));
        assert!(inside.starts_with(&StorageKey::root()));

        // component boundaries cannot be confused
        let split_a = key_of(&schema, &[Value::from("a"), Value::Int(1)]);
        let split_b = key_of(&schema, &[Value::from("a\0"), Value::Int(1)]);
        assert_ne!(split_a, split_b);

        assert!(derive_from_values(&[Value::from("ab")], &schema).is_err());
        assert!(derive_prefix(&[Value::Int(1)], &schema).is_err());
    }

    #[test]
    fn test_key_serde_rejects_garbage() {
        let key = StorageKey::for_name("documents");
        let json = serde_json::to_string(&key).unwrap();
        let back: StorageKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<StorageKey>("\"not hex\"").is_err());
        assert!(StorageKey::parse("ABC").is_err());
    }
}
