// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Persisted dataset registrations
//!
//! Each dataset has one catalog document holding every source schema version,
//! every parser with its schema versions, which versions are active, and which
//! parser is the default. Updates are compare-and-swap on the document revision.

use crate::config::RetryConfig;
use crate::error::{BackendError, Result, WarehouseError};
use crate::index::{CATALOG_NAMESPACE, Document, IndexBackend, ReadMode, WriteCondition};
use crate::key::StorageKey;
use crate::retry::retry_backend;
use crate::schema::{Layer, ParsedDeclaration, Schema, SourceDeclaration, check_name};
use diagnostics::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserRegistration {
    /// Version `n` is `versions[n - 1]`
    pub versions: Vec<ParsedDeclaration>,
    pub active_version: u32,
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRegistration {
    pub dataset: String,
    /// Version `n` is `source_versions[n - 1]`
    pub source_versions: Vec<SourceDeclaration>,
    pub active_source_version: u32,
    #[serde(default)]
    pub parsers: BTreeMap<String, ParserRegistration>,
    #[serde(skip)]
    revision: u64,
}

impl DatasetRegistration {
    fn from_document(doc: Document) -> std::result::Result<Self, BackendError> {
        let mut registration: DatasetRegistration = serde_json::from_value(doc.body)
            .map_err(|source| BackendError::CorruptDocument {
                key: doc.key.to_string(),
                source,
            })?;
        registration.revision = doc.revision;
        Ok(registration)
    }

    pub fn latest_source_version(&self) -> u32 {
        version_count(self.source_versions.len())
    }

    pub fn parser(&self, name: &str) -> Result<&ParserRegistration> {
        self.parsers
            .get(name)
            .ok_or_else(|| WarehouseError::UnknownParser {
                dataset: self.dataset.clone(),
                parser: name.to_string(),
            })
    }

    pub fn default_parser(&self) -> Option<&str> {
        self.parsers
            .iter()
            .find(|(_, parser)| parser.default)
            .map(|(name, _)| name.as_str())
    }

    pub fn source_schema(&self, version: u32) -> Result<Schema> {
        let declaration = version
            .checked_sub(1)
            .and_then(|i| self.source_versions.get(i as usize))
            .ok_or_else(|| WarehouseError::UnknownSchemaVersion {
                dataset: self.dataset.clone(),
                version,
            })?;
        Ok(declaration.to_schema(&self.dataset, version)?)
    }

    pub fn parser_schema(&self, parser: &str, version: u32) -> Result<Schema> {
        let declaration = version
            .checked_sub(1)
            .and_then(|i| self.parser(parser).ok()?.versions.get(i as usize));
        match declaration {
            Some(declaration) => Ok(declaration.to_schema(&self.dataset, version)?),
            None => {
                self.parser(parser)?;
                Err(WarehouseError::UnknownSchemaVersion {
                    dataset: self.dataset.clone(),
                    version,
                })
            }
        }
    }

    /// Schema of a layer at a version
    pub fn schema(&self, layer: &Layer, version: u32) -> Result<Schema> {
        match layer {
            Layer::Source => self.source_schema(version),
            Layer::Parsed(parser) => self.parser_schema(parser, version),
        }
    }

    pub fn active_version(&self, layer: &Layer) -> Result<u32> {
        match layer {
            Layer::Source => Ok(self.active_source_version),
            Layer::Parsed(parser) => Ok(self.parser(parser)?.active_version),
        }
    }
}

fn version_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// What a registration call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub version: u32,
    /// A new version was recorded
    pub created: bool,
    /// The version is the one stores currently write to
    pub active: bool,
}

enum Change<T> {
    Write(DatasetRegistration, T),
    Keep(T),
}

#[derive(Debug, Clone)]
pub struct Catalog {
    backend: Arc<dyn IndexBackend>,
    retry: RetryConfig,
    attempts: usize,
}

impl Catalog {
    pub fn new(backend: Arc<dyn IndexBackend>, retry: RetryConfig, attempts: usize) -> Self {
        Self {
            backend,
            retry,
            attempts,
        }
    }

    async fn load(&self, dataset: &str) -> Result<Option<DatasetRegistration>> {
        let key = StorageKey::for_name(dataset);
        let key_ref = &key;
        let document = retry_backend("catalog read", &self.retry, || async move {
            self.backend
                .get(CATALOG_NAMESPACE, key_ref, ReadMode::Consistent)
                .await
        })
        .await
        .map_err(|e| match e {
            BackendError::ConsistentReadUnavailable(reason) => {
                WarehouseError::ConsistencyViolation {
                    namespace: CATALOG_NAMESPACE.to_string(),
                    key: dataset.to_string(),
                    reason,
                }
            }
            other => WarehouseError::Backend(other),
        })?;
        Ok(document
            .map(DatasetRegistration::from_document)
            .transpose()?)
    }

    /// The registration of a dataset
    pub async fn registration(&self, dataset: &str) -> Result<DatasetRegistration> {
        self.load(dataset)
            .await?
            .ok_or_else(|| WarehouseError::UnknownDataset(dataset.to_string()))
    }

    /// Read-modify-write of one dataset document, retried when another writer wins
    async fn modify<T>(
        &self,
        dataset: &str,
        mut apply: impl FnMut(Option<&DatasetRegistration>) -> Result<Change<T>>,
    ) -> Result<T> {
        let key = StorageKey::for_name(dataset);
        for _ in 0..self.attempts {
            let current = self.load(dataset).await?;
            let (next, result) = match apply(current.as_ref())? {
                Change::Keep(result) => return Ok(result),
                Change::Write(next, result) => (next, result),
            };
            let condition = WriteCondition::expecting(current.as_ref().map(|c| c.revision));
            let body = serde_json::to_value(&next).map_err(|source| {
                BackendError::CorruptDocument {
                    key: dataset.to_string(),
                    source,
                }
            })?;
            let (key_ref, body_ref) = (&key, &body);
            let written = retry_backend("catalog write", &self.retry, || async move {
                self.backend
                    .put(CATALOG_NAMESPACE, key_ref, body_ref.clone(), condition)
                    .await
            })
            .await;
            match written {
                Ok(_) => return Ok(result),
                Err(e) if e.is_conflict() => {
                    log_debug!("catalog update of {dataset} raced another writer, retrying", dataset: dataset);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(WarehouseError::Backend(BackendError::Conflict(format!(
            "catalog entry for '{dataset}' is contended"
        ))))
    }

    /// Register a dataset's source layer, or a new version of it
    ///
    /// The first registration is version 1 and active immediately. A declaration
    /// equal to the latest version is a no-op. Later versions stay inactive until
    /// a migration promotes them. The primary key fields can never change.
    pub async fn register_source(
        &self,
        dataset: &str,
        declaration: &SourceDeclaration,
    ) -> Result<Registration> {
        check_name("dataset", dataset)?;
        let _ = declaration.to_schema(dataset, 1)?;

        let registration = self
            .modify(dataset, |current| {
                let Some(current) = current else {
                    return Ok(Change::Write(
                        DatasetRegistration {
                            dataset: dataset.to_string(),
                            source_versions: vec![declaration.clone()],
                            active_source_version: 1,
                            parsers: BTreeMap::new(),
                            revision: 0,
                        },
                        Registration {
                            version: 1,
                            created: true,
                            active: true,
                        },
                    ));
                };

                let latest = current.latest_source_version();
                if current.source_versions.last() == Some(declaration) {
                    return Ok(Change::Keep(Registration {
                        version: latest,
                        created: false,
                        active: latest == current.active_source_version,
                    }));
                }
                let same_key = current
                    .source_versions
                    .last()
                    .is_none_or(|last| last.primary_key_fields == declaration.primary_key_fields);
                if !same_key {
                    return Err(WarehouseError::InvalidArgument(format!(
                        "primary key fields of dataset '{dataset}' cannot change"
                    )));
                }
                let mut next = current.clone();
                next.source_versions.push(declaration.clone());
                Ok(Change::Write(
                    next,
                    Registration {
                        version: latest + 1,
                        created: true,
                        active: false,
                    },
                ))
            })
            .await?;

        if registration.created {
            let version = registration.version;
            log_info!("registered source schema {dataset} v{version}", dataset: dataset, version: version);
        }
        Ok(registration)
    }

    /// Register a parser of a dataset, or a new version of it
    ///
    /// The first parser of a dataset becomes its default; `promote_default`
    /// makes this parser the default instead of the current one.
    pub async fn register_parser(
        &self,
        dataset: &str,
        declaration: &ParsedDeclaration,
        promote_default: bool,
    ) -> Result<Registration> {
        let _ = declaration.to_schema(dataset, 1)?;
        let name = declaration.parser.as_str();

        let registration = self
            .modify(dataset, |current| {
                let current =
                    current.ok_or_else(|| WarehouseError::UnknownDataset(dataset.to_string()))?;
                let mut next = current.clone();
                let first_parser = next.parsers.is_empty();

                let registration = match next.parsers.get_mut(name) {
                    None => {
                        next.parsers.insert(
                            name.to_string(),
                            ParserRegistration {
                                versions: vec![declaration.clone()],
                                active_version: 1,
                                default: first_parser,
                            },
                        );
                        Registration {
                            version: 1,
                            created: true,
                            active: true,
                        }
                    }
                    Some(parser) => {
                        let latest = version_count(parser.versions.len());
                        if parser.versions.last() == Some(declaration) {
                            Registration {
                                version: latest,
                                created: false,
                                active: latest == parser.active_version,
                            }
                        } else if parser
                            .versions
                            .last()
                            .is_some_and(|last| last.primary_key_fields != declaration.primary_key_fields)
                        {
                            return Err(WarehouseError::InvalidArgument(format!(
                                "primary key fields of parser '{name}' of '{dataset}' cannot change"
                            )));
                        } else {
                            parser.versions.push(declaration.clone());
                            Registration {
                                version: latest + 1,
                                created: true,
                                active: false,
                            }
                        }
                    }
                };

                if promote_default {
                    for (parser_name, parser) in next.parsers.iter_mut() {
                        parser.default = parser_name == name;
                    }
                }

                if next == *current {
                    Ok(Change::Keep(registration))
                } else {
                    Ok(Change::Write(next, registration))
                }
            })
            .await?;

        if registration.created {
            let version = registration.version;
            log_info!(
                "registered parser {parser} of {dataset} v{version}",
                parser: name,
                dataset: dataset,
                version: version
            );
        }
        Ok(registration)
    }

    /// Make `version` the version stores and reads use for a layer
    pub async fn promote(&self, dataset: &str, layer: &Layer, version: u32) -> Result<()> {
        self.modify(dataset, |current| {
            let current =
                current.ok_or_else(|| WarehouseError::UnknownDataset(dataset.to_string()))?;
            let _ = current.schema(layer, version)?;
            if current.active_version(layer)? == version {
                return Ok(Change::Keep(()));
            }
            let mut next = current.clone();
            match layer {
                Layer::Source => next.active_source_version = version,
                Layer::Parsed(parser) => {
                    if let Some(p) = next.parsers.get_mut(parser) {
                        p.active_version = version;
                    }
                }
            }
            Ok(Change::Write(next, ()))
        })
        .await?;
        let layer_name = layer.to_string();
        log_info!(
            "promoted {dataset} {layer} to v{version}",
            dataset: dataset,
            layer: layer_name.as_str(),
            version: version
        );
        Ok(())
    }

    pub async fn list_datasets(&self) -> Result<Vec<String>> {
        let mut datasets = Vec::new();
        let mut cursor: Option<StorageKey> = None;
        let root = StorageKey::root();
        loop {
            let (root_ref, cursor_ref) = (&root, &cursor);
            let page = retry_backend("catalog scan", &self.retry, || async move {
                self.backend
                    .scan(
                        CATALOG_NAMESPACE,
                        root_ref,
                        cursor_ref.as_ref(),
                        100,
                        ReadMode::Consistent,
                    )
                    .await
            })
            .await?;
            let done = page.len() < 100;
            for document in page {
                cursor = Some(document.key.clone());
                datasets.push(DatasetRegistration::from_document(document)?.dataset);
            }
            if done {
                return Ok(datasets);
            }
        }
    }

    pub async fn source_schema(&self, dataset: &str, version: u32) -> Result<Schema> {
        self.registration(dataset).await?.source_schema(version)
    }

    pub async fn active_source_schema(&self, dataset: &str) -> Result<Schema> {
        let registration = self.registration(dataset).await?;
        registration.source_schema(registration.active_source_version)
    }

    pub async fn default_parser(&self, dataset: &str) -> Result<String> {
        self.registration(dataset)
            .await?
            .default_parser()
            .map(str::to_string)
            .ok_or_else(|| WarehouseError::NotFound(format!("dataset '{dataset}' has no parsers")))
    }

    /// Schema of a parser; `None` picks the default parser and its active version
    pub async fn parser_schema(
        &self,
        dataset: &str,
        parser: Option<&str>,
        version: Option<u32>,
    ) -> Result<Schema> {
        let registration = self.registration(dataset).await?;
        let parser = match parser {
            Some(parser) => parser.to_string(),
            None => registration
                .default_parser()
                .map(str::to_string)
                .ok_or_else(|| {
                    WarehouseError::NotFound(format!("dataset '{dataset}' has no parsers"))
                })?,
        };
        let version = match version {
            Some(version) => version,
            None => registration.parser(&parser)?.active_version,
        };
        registration.parser_schema(&parser, version)
    }
}
