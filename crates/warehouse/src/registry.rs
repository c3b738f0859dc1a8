// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The authoritative index of storage key to entry
//!
//! One entry per key per namespace. Writes are compare-and-swap on the entry
//! revision, so concurrent writers to one key serialize without client-side
//! locking; a writer that loses the race re-reads and re-applies.

use crate::blob::Locator;
use crate::config::{RegistryConfig, RetryConfig};
use crate::error::{BackendError, Result, WarehouseError};
use crate::fingerprint::Fingerprint;
use crate::index::{Document, IndexBackend, ReadMode, WriteCondition};
use crate::key::StorageKey;
use crate::retry::retry_backend;
use crate::schema::Namespace;
use crate::types::Native;
use chrono::{DateTime, Utc};
use diagnostics::*;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The source entry a migrated entry was produced from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOrigin {
    pub key: StorageKey,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub key: StorageKey,
    pub schema_version: u32,
    pub metadata: BTreeMap<String, Native>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<Locator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// UTC, whole seconds
    pub last_modified: DateTime<Utc>,
    /// Parsed-layer entries: the source entry they were parsed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<StorageKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_from: Option<MigrationOrigin>,
    /// Index revision this entry was read at; not part of the stored body
    #[serde(skip)]
    pub revision: u64,
}

impl RegistryEntry {
    fn from_document(doc: Document) -> std::result::Result<Self, BackendError> {
        let mut entry: RegistryEntry =
            serde_json::from_value(doc.body).map_err(|source| BackendError::CorruptDocument {
                key: doc.key.to_string(),
                source,
            })?;
        entry.revision = doc.revision;
        Ok(entry)
    }
}

/// Desired state of an entry, applied by [`Registry::upsert`]
#[derive(Debug, Clone, PartialEq)]
pub struct EntryWrite {
    pub schema_version: u32,
    pub metadata: BTreeMap<String, Native>,
    pub locator: Option<Locator>,
    pub fingerprint: Option<Fingerprint>,
    pub source_key: Option<StorageKey>,
    pub migrated_from: Option<MigrationOrigin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// No entry existed under the key
    Created,
    /// The entry pointed at different content and was replaced
    Replaced,
    /// Same content, different metadata; metadata was rewritten in place
    MetadataUpdated,
    /// The entry already matched; nothing was written
    Unchanged,
}

fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

#[derive(Debug, Clone)]
pub struct Registry {
    backend: Arc<dyn IndexBackend>,
    config: RegistryConfig,
    retry: RetryConfig,
}

impl Registry {
    pub fn new(backend: Arc<dyn IndexBackend>, config: RegistryConfig, retry: RetryConfig) -> Self {
        Self {
            backend,
            config,
            retry,
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    /// Read an entry with the given consistency
    ///
    /// A consistent read that the backend cannot serve fails with
    /// `ConsistencyViolation`; it never falls back to a possibly stale read.
    pub async fn lookup(
        &self,
        namespace: &Namespace,
        key: &StorageKey,
        mode: ReadMode,
    ) -> Result<Option<RegistryEntry>> {
        let document = retry_backend("registry lookup", &self.retry, || async move {
            self.backend.get(namespace.as_str(), key, mode).await
        })
        .await
        .map_err(|e| consistency_error(namespace, key, e))?;
        Ok(document.map(RegistryEntry::from_document).transpose()?)
    }

    /// Read reflecting every write acknowledged before the call
    pub async fn consistent_lookup(
        &self,
        namespace: &Namespace,
        key: &StorageKey,
    ) -> Result<Option<RegistryEntry>> {
        self.lookup(namespace, key, ReadMode::Consistent).await
    }

    pub async fn fingerprint_of(
        &self,
        namespace: &Namespace,
        key: &StorageKey,
    ) -> Result<Option<Fingerprint>> {
        Ok(self
            .consistent_lookup(namespace, key)
            .await?
            .and_then(|entry| entry.fingerprint))
    }

    /// Atomically create or update the entry under `key`
    ///
    /// Concurrent upserts to one key are linearized by the backend's conditional
    /// write; the final entry is exactly one writer's complete value.
    pub async fn upsert(
        &self,
        namespace: &Namespace,
        key: &StorageKey,
        write: EntryWrite,
    ) -> Result<(UpsertOutcome, RegistryEntry)> {
        match self.upsert_unless(namespace, key, write, |_| false).await? {
            Some(written) => Ok(written),
            None => Err(WarehouseError::Backend(BackendError::Conflict(format!(
                "{namespace}/{key}: upsert declined"
            )))),
        }
    }

    /// Upsert on behalf of a migration
    ///
    /// An entry that was written directly rather than migrated is newer than
    /// anything a migration could produce; it is left alone and `None` returned.
    pub async fn upsert_migrated(
        &self,
        namespace: &Namespace,
        key: &StorageKey,
        write: EntryWrite,
    ) -> Result<Option<(UpsertOutcome, RegistryEntry)>> {
        self.upsert_unless(namespace, key, write, |current| {
            current.migrated_from.is_none()
        })
        .await
    }

    async fn upsert_unless(
        &self,
        namespace: &Namespace,
        key: &StorageKey,
        write: EntryWrite,
        keep: impl Fn(&RegistryEntry) -> bool,
    ) -> Result<Option<(UpsertOutcome, RegistryEntry)>> {
        for attempt in 1..=self.config.upsert_attempts {
            let current = self.consistent_lookup(namespace, key).await?;
            let (outcome, entry) = match current {
                None => (UpsertOutcome::Created, new_entry(key, &write)),
                Some(current) if keep(&current) => return Ok(None),
                Some(current) => {
                    let same_content = current.fingerprint == write.fingerprint;
                    let same_metadata = current.metadata == write.metadata
                        && current.schema_version == write.schema_version
                        && current.source_key == write.source_key
                        && current.migrated_from == write.migrated_from;
                    if same_content && same_metadata {
                        return Ok(Some((UpsertOutcome::Unchanged, current)));
                    }
                    let outcome = if same_content {
                        UpsertOutcome::MetadataUpdated
                    } else {
                        UpsertOutcome::Replaced
                    };
                    let mut entry = new_entry(key, &write);
                    entry.revision = current.revision;
                    (outcome, entry)
                }
            };

            let condition = if outcome == UpsertOutcome::Created {
                WriteCondition::Absent
            } else {
                WriteCondition::Revision(entry.revision)
            };
            match self.put_entry(namespace, &entry, condition).await {
                Ok(revision) => {
                    let mut entry = entry;
                    entry.revision = revision;
                    return Ok(Some((outcome, entry)));
                }
                Err(e) if e.is_conflict() => {
                    let ns = namespace.as_str();
                    let key_text = key.as_str();
                    log_debug!(
                        "upsert of {key} in {ns} lost a race (attempt {attempt}), re-reading",
                        key: key_text,
                        ns: ns,
                        attempt: attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(WarehouseError::Backend(BackendError::Conflict(format!(
            "{namespace}/{key}: still contended after {} attempts",
            self.config.upsert_attempts
        ))))
    }

    async fn put_entry(
        &self,
        namespace: &Namespace,
        entry: &RegistryEntry,
        condition: WriteCondition,
    ) -> std::result::Result<u64, BackendError> {
        let key = &entry.key;
        let body = serde_json::to_value(entry).map_err(|source| BackendError::CorruptDocument {
            key: key.to_string(),
            source,
        })?;
        let body = &body;
        retry_backend("registry write", &self.retry, || async move {
            self.backend
                .put(namespace.as_str(), key, body.clone(), condition)
                .await
        })
        .await
    }

    /// Lazily stream every entry whose key starts with `prefix`, in key order
    pub fn query_prefix(
        &self,
        namespace: &Namespace,
        prefix: StorageKey,
    ) -> BoxStream<'_, Result<RegistryEntry>> {
        self.scan_from(namespace, prefix, None)
    }

    /// Like [`Registry::query_prefix`], resuming after `start_after`
    pub fn scan_from(
        &self,
        namespace: &Namespace,
        prefix: StorageKey,
        start_after: Option<StorageKey>,
    ) -> BoxStream<'_, Result<RegistryEntry>> {
        self.pages(namespace.clone(), prefix, start_after).boxed()
    }

    fn pages(
        &self,
        namespace: Namespace,
        prefix: StorageKey,
        start_after: Option<StorageKey>,
    ) -> impl Stream<Item = Result<RegistryEntry>> + Send + '_ {
        let page_size = self.config.page_size;
        async_stream::try_stream! {
            let mut cursor = start_after;
            loop {
                let page = {
                    let (ns, prefix_ref, cursor_ref) = (&namespace, &prefix, &cursor);
                    retry_backend("registry scan", &self.retry, || async move {
                        self.backend
                            .scan(ns.as_str(), prefix_ref, cursor_ref.as_ref(), page_size, ReadMode::Consistent)
                            .await
                    })
                    .await
                    .map_err(|e| consistency_error(&namespace, &prefix, e))?
                };
                let full = page.len() == page_size;
                let count = page.len();
                let ns = namespace.as_str();
                log_debug!("scanned {count} entries from {ns}", count: count, ns: ns);
                for document in page {
                    cursor = Some(document.key.clone());
                    yield RegistryEntry::from_document(document)?;
                }
                if !full {
                    break;
                }
            }
        }
    }
}

fn new_entry(key: &StorageKey, write: &EntryWrite) -> RegistryEntry {
    RegistryEntry {
        key: key.clone(),
        schema_version: write.schema_version,
        metadata: write.metadata.clone(),
        locator: write.locator.clone(),
        fingerprint: write.fingerprint.clone(),
        last_modified: now_seconds(),
        source_key: write.source_key.clone(),
        migrated_from: write.migrated_from.clone(),
        revision: 0,
    }
}

fn consistency_error(namespace: &Namespace, key: &StorageKey, err: BackendError) -> WarehouseError {
    match err {
        BackendError::ConsistentReadUnavailable(reason) => WarehouseError::ConsistencyViolation {
            namespace: namespace.to_string(),
            key: key.to_string(),
            reason,
        },
        other => WarehouseError::Backend(other),
    }
}
