// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::{Document, IndexBackend, ReadMode, WriteCondition, format_version};
use crate::config::BackendVersion;
use crate::error::BackendError;
use crate::key::StorageKey;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

type Table = BTreeMap<StorageKey, Document>;

#[derive(Debug, Default)]
struct Tables {
    primary: HashMap<String, Table>,
    /// What eventually consistent reads observe
    replica: HashMap<String, Table>,
}

/// In-memory index backend for tests and embedded use
///
/// Consistent reads go to the primary copy. Eventual reads go to a replica that
/// is either updated with every write or, with [`MemoryIndex::with_lagging_replica`],
/// only when [`MemoryIndex::sync_replica`] is called. Fault switches simulate a
/// degraded or unreachable backend.
#[derive(Debug)]
pub struct MemoryIndex {
    tables: Arc<Mutex<Tables>>,
    version: BackendVersion,
    lagging_replica: bool,
    consistent_reads: AtomicBool,
    available: AtomicBool,
    transient_failures: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            version: format_version(),
            lagging_replica: false,
            consistent_reads: AtomicBool::new(true),
            available: AtomicBool::new(true),
            transient_failures: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Report a different backend version
    #[must_use]
    pub fn with_version(mut self, version: BackendVersion) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_lagging_replica(mut self) -> Self {
        self.lagging_replica = true;
        self
    }

    /// Bring the eventually consistent replica up to date
    pub async fn sync_replica(&self) {
        let mut tables = self.tables.lock().await;
        tables.replica = tables.primary.clone();
    }

    /// Toggle the strongly consistent read path
    pub fn set_consistent_reads(&self, enabled: bool) {
        self.consistent_reads.store(enabled, Ordering::SeqCst);
    }

    /// Toggle reachability of the whole backend
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a transient error
    pub fn inject_transient_failures(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_faults(&self) -> Result<(), BackendError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory index is offline".into()));
        }
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BackendError::Transient("injected transient failure".into()));
        }
        Ok(())
    }

    fn check_mode(&self, mode: ReadMode) -> Result<(), BackendError> {
        if mode == ReadMode::Consistent && !self.consistent_reads.load(Ordering::SeqCst) {
            return Err(BackendError::ConsistentReadUnavailable(
                "memory index primary is degraded".into(),
            ));
        }
        Ok(())
    }
}

impl Tables {
    fn table(&self, namespace: &str, mode: ReadMode) -> Option<&Table> {
        match mode {
            ReadMode::Consistent => self.primary.get(namespace),
            ReadMode::Eventual => self.replica.get(namespace),
        }
    }
}

#[async_trait]
impl IndexBackend for MemoryIndex {
    async fn backend_version(&self) -> Result<BackendVersion, BackendError> {
        self.check_faults()?;
        Ok(self.version.clone())
    }

    async fn get(
        &self,
        namespace: &str,
        key: &StorageKey,
        mode: ReadMode,
    ) -> Result<Option<Document>, BackendError> {
        self.check_faults()?;
        self.check_mode(mode)?;
        let tables = self.tables.lock().await;
        Ok(tables
            .table(namespace, mode)
            .and_then(|table| table.get(key))
            .cloned())
    }

    async fn put(
        &self,
        namespace: &str,
        key: &StorageKey,
        body: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<u64, BackendError> {
        self.check_faults()?;
        let mut tables = self.tables.lock().await;
        let table = tables.primary.entry(namespace.to_string()).or_default();
        let current = table.get(key).map(|doc| doc.revision);
        let holds = match condition {
            WriteCondition::Absent => current.is_none(),
            WriteCondition::Revision(expected) => current == Some(expected),
        };
        if !holds {
            return Err(BackendError::Conflict(format!("{namespace}/{key}")));
        }

        let revision = current.map_or(1, |r| r + 1);
        let document = Document {
            key: key.clone(),
            revision,
            body,
        };
        if !self.lagging_replica {
            tables
                .replica
                .entry(namespace.to_string())
                .or_default()
                .insert(key.clone(), document.clone());
        }
        tables
            .primary
            .entry(namespace.to_string())
            .or_default()
            .insert(key.clone(), document);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(revision)
    }

    async fn scan(
        &self,
        namespace: &str,
        prefix: &StorageKey,
        start_after: Option<&StorageKey>,
        limit: usize,
        mode: ReadMode,
    ) -> Result<Vec<Document>, BackendError> {
        self.check_faults()?;
        self.check_mode(mode)?;
        let tables = self.tables.lock().await;
        let Some(table) = tables.table(namespace, mode) else {
            return Ok(Vec::new());
        };
        Ok(table
            .range(prefix.clone()..)
            .skip_while(|(key, _)| start_after.is_some_and(|after| *key <= after))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}
