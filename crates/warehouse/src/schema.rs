// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Dataset schemas, records and schema declarations
//!
//! A [`Schema`] is an immutable, versioned description of one layer of a dataset:
//! the source layer, or the parsed layer of one parser. Declarations are the
//! serializable form users register; the catalog turns them into schemas.

use crate::error::SchemaError;
use crate::types::{self, FieldType, Native, Value};
use bytes::Bytes;
use chrono::TimeZone;
use chrono_tz::Tz;
use diagnostics::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Which layer of a dataset a schema describes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Source,
    Parsed(String),
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Source => write!(f, "source"),
            Layer::Parsed(parser) => write!(f, "parsed/{parser}"),
        }
    }
}

/// The index namespace holding the entries of one schema version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    dataset: String,
    layer: Layer,
    version: u32,
    name: String,
}

impl Namespace {
    pub fn new(dataset: impl Into<String>, layer: Layer, version: u32) -> Self {
        let dataset = dataset.into();
        let name = format!("{dataset}/{layer}/v{version}");
        Self {
            dataset,
            layer,
            version,
            name,
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Dataset and parser names become index namespaces and object paths
pub(crate) fn check_name(kind: &str, name: &str) -> Result<(), SchemaError> {
    let valid = !name.is_empty()
        && !name.starts_with('_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidDeclaration(format!(
            "{kind} name '{name}' must be non-empty ASCII alphanumerics, '_', '-' or '.', not starting with '_'"
        )))
    }
}

/// Typed fields plus an optional opaque payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
    payload: Option<Bytes>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn set_payload(&mut self, payload: Option<Bytes>) {
        self.payload = payload;
    }

    pub fn take_payload(&mut self) -> Option<Bytes> {
        self.payload.take()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            payload: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    dataset: String,
    layer: Layer,
    version: u32,
    primary_key_fields: Vec<String>,
    required_metadata_fields: BTreeSet<String>,
    type_map: BTreeMap<String, FieldType>,
    timezone: Option<Tz>,
}

impl Schema {
    /// Build a schema, checking the declaration invariants
    pub fn new(
        dataset: impl Into<String>,
        layer: Layer,
        version: u32,
        primary_key_fields: Vec<String>,
        required_metadata_fields: impl IntoIterator<Item = String>,
        type_map: BTreeMap<String, FieldType>,
        timezone: Option<Tz>,
    ) -> Result<Self, SchemaError> {
        let dataset = dataset.into();
        check_name("dataset", &dataset)?;
        if let Layer::Parsed(parser) = &layer {
            check_name("parser", parser)?;
        }
        if version == 0 {
            return Err(SchemaError::InvalidDeclaration(
                "schema versions start at 1".into(),
            ));
        }
        if primary_key_fields.is_empty() {
            return Err(SchemaError::InvalidDeclaration(format!(
                "dataset '{dataset}' declares no primary key fields"
            )));
        }

        let mut seen = BTreeSet::new();
        for field in &primary_key_fields {
            if !seen.insert(field.as_str()) {
                return Err(SchemaError::InvalidDeclaration(format!(
                    "primary key field '{field}' declared twice"
                )));
            }
            match type_map.get(field) {
                None => {
                    return Err(SchemaError::InvalidDeclaration(format!(
                        "primary key field '{field}' has no declared type"
                    )));
                }
                Some(ty) if !ty.is_key_type() => {
                    return Err(SchemaError::InvalidDeclaration(format!(
                        "primary key field '{field}' has type {ty}, which is not orderable"
                    )));
                }
                Some(_) => {}
            }
        }

        let required_metadata_fields: BTreeSet<String> =
            required_metadata_fields.into_iter().collect();
        if let Some(field) = required_metadata_fields
            .iter()
            .find(|f| !type_map.contains_key(*f))
        {
            return Err(SchemaError::InvalidDeclaration(format!(
                "required field '{field}' has no declared type"
            )));
        }

        Ok(Self {
            dataset,
            layer,
            version,
            primary_key_fields,
            required_metadata_fields,
            type_map,
            timezone,
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn primary_key_fields(&self) -> &[String] {
        &self.primary_key_fields
    }

    pub fn required_metadata_fields(&self) -> &BTreeSet<String> {
        &self.required_metadata_fields
    }

    pub fn type_map(&self) -> &BTreeMap<String, FieldType> {
        &self.type_map
    }

    pub fn field_type(&self, field: &str) -> Option<&FieldType> {
        self.type_map.get(field)
    }

    pub fn timezone(&self) -> Option<Tz> {
        self.timezone
    }

    pub fn is_primary_key(&self, field: &str) -> bool {
        self.primary_key_fields.iter().any(|f| f == field)
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.dataset.clone(), self.layer.clone(), self.version)
    }

    /// Check a record against this schema. Pure.
    pub fn validate(&self, record: &Record) -> Result<(), SchemaError> {
        for field in &self.primary_key_fields {
            if record.get(field).is_none_or(Value::is_null) {
                return Err(SchemaError::MissingPrimaryKey {
                    field: field.clone(),
                });
            }
        }
        for field in &self.required_metadata_fields {
            if record.get(field).is_none_or(Value::is_null) {
                return Err(SchemaError::MissingRequiredMetadata {
                    field: field.clone(),
                });
            }
        }
        for (field, value) in record.fields() {
            if let Some(ty) = self.type_map.get(field) {
                if !types::validate(value, ty) {
                    return Err(SchemaError::type_mismatch(
                        field.as_str(),
                        ty.to_string(),
                        value.type_name(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Attribute naive datetimes to the schema timezone, drop untyped non-string
    /// fields, then validate
    pub fn normalize(&self, mut record: Record) -> Result<Record, SchemaError> {
        let mut dropped = Vec::new();
        for (field, value) in record.fields.iter_mut() {
            match self.type_map.get(field) {
                Some(ty) if ty.holds_datetimes() => {
                    let taken = std::mem::replace(value, Value::Null);
                    *value = self.attribute_timezone(field, taken)?;
                }
                Some(_) => {}
                None if matches!(value, Value::Str(_)) => {}
                None => dropped.push(field.clone()),
            }
        }
        for field in dropped {
            if let Some(value) = record.fields.remove(&field) {
                if !value.is_null() {
                    let dataset = self.dataset.as_str();
                    let kind = value.type_name();
                    log_warn!(
                        "dropping untyped field {field} of type {kind} from {dataset} record",
                        field: field.as_str(),
                        kind: kind,
                        dataset: dataset
                    );
                }
            }
        }
        self.validate(&record)?;
        Ok(record)
    }

    fn attribute_timezone(&self, field: &str, value: Value) -> Result<Value, SchemaError> {
        match value {
            Value::LocalDateTime(naive) => {
                let tz = self.timezone.ok_or_else(|| {
                    SchemaError::type_mismatch(field, "datetime with timezone", "naive datetime")
                })?;
                let local = tz.from_local_datetime(&naive).earliest().ok_or_else(|| {
                    SchemaError::type_mismatch(
                        field,
                        "datetime",
                        format!("nonexistent local time {naive} in {tz}"),
                    )
                })?;
                Ok(Value::DateTime(local.fixed_offset()))
            }
            Value::List(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(|item| self.attribute_timezone(field, item))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            other => Ok(other),
        }
    }

    fn present_in_timezone(&self, value: Value) -> Value {
        let Some(tz) = self.timezone else {
            return value;
        };
        match value {
            Value::DateTime(dt) => Value::DateTime(dt.with_timezone(&tz).fixed_offset()),
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.present_in_timezone(item))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Encode the fields of a normalized record into backend-native metadata
    pub fn encode_metadata(
        &self,
        record: &Record,
    ) -> Result<BTreeMap<String, Native>, SchemaError> {
        let mut metadata = BTreeMap::new();
        for (field, value) in record.fields() {
            let native = match (self.type_map.get(field), value) {
                (Some(ty), _) => types::encode(value, ty).map_err(|e| e.for_field(field))?,
                (None, Value::Str(s)) => Native::String(s.clone()),
                (None, _) => continue,
            };
            metadata.insert(field.clone(), native);
        }
        Ok(metadata)
    }

    /// Decode backend-native metadata; datetimes are presented in the schema timezone
    pub fn decode_metadata(
        &self,
        metadata: &BTreeMap<String, Native>,
    ) -> Result<Record, SchemaError> {
        let mut record = Record::new();
        for (field, native) in metadata {
            let value = match (self.type_map.get(field), native) {
                (Some(ty), _) => {
                    let value = types::decode(native, ty).map_err(|e| e.for_field(field))?;
                    self.present_in_timezone(value)
                }
                (None, Native::String(s)) => Value::Str(s.clone()),
                (None, Native::Null) => Value::Null,
                (None, _) => {
                    return Err(SchemaError::type_mismatch(
                        field.as_str(),
                        "str",
                        "non-string untyped value",
                    ));
                }
            };
            record.insert(field.clone(), value);
        }
        Ok(record)
    }
}

/// Serializable declaration of a dataset's source layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDeclaration {
    pub primary_key_fields: Vec<String>,
    #[serde(default)]
    pub required_metadata_fields: Vec<String>,
    pub metadata_type_map: BTreeMap<String, FieldType>,
    /// Attributed to naive datetimes in source records; absent means they are rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<Tz>,
}

impl SourceDeclaration {
    pub fn new<I, S>(primary_key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary_key_fields: primary_key_fields.into_iter().map(Into::into).collect(),
            required_metadata_fields: Vec::new(),
            metadata_type_map: BTreeMap::new(),
            timezone: None,
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.metadata_type_map.insert(name.into(), ty);
        self
    }

    #[must_use]
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.required_metadata_fields.push(name.into());
        self
    }

    #[must_use]
    pub fn timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    pub fn to_schema(&self, dataset: &str, version: u32) -> Result<Schema, SchemaError> {
        Schema::new(
            dataset,
            Layer::Source,
            version,
            self.primary_key_fields.clone(),
            self.required_metadata_fields.iter().cloned(),
            self.metadata_type_map.clone(),
            self.timezone,
        )
    }
}

/// Serializable declaration of one parser's output rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDeclaration {
    pub parser: String,
    pub primary_key_fields: Vec<String>,
    pub row_type_map: BTreeMap<String, FieldType>,
    pub timezone: Tz,
}

impl ParsedDeclaration {
    pub fn new<I, S>(parser: impl Into<String>, primary_key_fields: I, timezone: Tz) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parser: parser.into(),
            primary_key_fields: primary_key_fields.into_iter().map(Into::into).collect(),
            row_type_map: BTreeMap::new(),
            timezone,
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.row_type_map.insert(name.into(), ty);
        self
    }

    pub fn to_schema(&self, dataset: &str, version: u32) -> Result<Schema, SchemaError> {
        Schema::new(
            dataset,
            Layer::Parsed(self.parser.clone()),
            version,
            self.primary_key_fields.clone(),
            std::iter::empty(),
            self.row_type_map.clone(),
            Some(self.timezone),
        )
    }
}
