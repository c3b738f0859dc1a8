// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Metadata/index backend seam
//!
//! The index stores revisioned JSON documents keyed by [`StorageKey`] inside a
//! namespace. Registry entries, catalog registrations and migration checkpoints
//! all live here. Backends must provide per-document conditional writes and an
//! ordered scan; everything above builds atomicity out of those two.

mod memory;
mod objects;

pub use memory::MemoryIndex;
pub use objects::ObjectStoreIndex;

use crate::config::BackendVersion;
use crate::error::BackendError;
use crate::key::StorageKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Document format version written by this crate's own backends
pub fn format_version() -> BackendVersion {
    BackendVersion::new(2, 1, 0)
}

/// Namespace of dataset registrations
pub const CATALOG_NAMESPACE: &str = "_catalog";

/// Namespace of migration checkpoints
pub const MIGRATION_NAMESPACE: &str = "_migrations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Reflects every write acknowledged before the read began
    Consistent,
    /// May lag behind recent writes
    Eventual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: StorageKey,
    /// Assigned by the backend, starts at 1 and increases with every write
    pub revision: u64,
    pub body: serde_json::Value,
}

/// Precondition for a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// No document exists under the key
    Absent,
    /// The current document has exactly this revision
    Revision(u64),
}

impl WriteCondition {
    /// Condition matching the revision last read, or absence if nothing was read
    pub(crate) fn expecting(revision: Option<u64>) -> Self {
        revision.map_or(WriteCondition::Absent, WriteCondition::Revision)
    }
}

#[async_trait]
pub trait IndexBackend: Send + Sync + std::fmt::Debug {
    async fn backend_version(&self) -> Result<BackendVersion, BackendError>;

    async fn get(
        &self,
        namespace: &str,
        key: &StorageKey,
        mode: ReadMode,
    ) -> Result<Option<Document>, BackendError>;

    /// Write `body` if `condition` holds, returning the new revision.
    /// Fails with `BackendError::Conflict` otherwise.
    async fn put(
        &self,
        namespace: &str,
        key: &StorageKey,
        body: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<u64, BackendError>;

    /// Up to `limit` documents whose key starts with `prefix` and sorts after
    /// `start_after`, in key order
    async fn scan(
        &self,
        namespace: &str,
        prefix: &StorageKey,
        start_after: Option<&StorageKey>,
        limit: usize,
        mode: ReadMode,
    ) -> Result<Vec<Document>, BackendError>;
}
