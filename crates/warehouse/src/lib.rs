// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Warehouse - typed, schema-validated storage of source and parsed records
//!
//! Records are validated against a declared schema, keyed by an order-preserving
//! encoding of their primary key fields, indexed in a revisioned document store
//! and their payloads kept once per content fingerprint in an object store.
//!
//! Set WAREHOUSE_LOG to control logging (see the `diagnostics` crate).

/// Supported field types and their backend encoding
pub mod types;

/// Dataset declarations, records and validation
pub mod schema;

/// Storage key derivation
pub mod key;

pub mod fingerprint;

// Error types
pub mod error;

pub mod config;

/// Cancellation and deadlines
pub mod context;

// Bounded backoff shared by the index and blob layers
mod retry;

/// Index backends
pub mod index;

/// Content-addressed blob transfer
pub mod blob;

pub mod registry;

pub mod catalog;

pub mod migration;

/// Dataset export to another object store
pub mod export;

mod warehouse;

pub use blob::{BlobBackend, BlobStore, Locator};
pub use catalog::{Catalog, DatasetRegistration, ParserRegistration, Registration};
pub use config::{BackendVersion, WarehouseConfig};
pub use context::OpContext;
pub use error::{BackendError, Result, SchemaError, WarehouseError};
pub use export::{ExportReport, ExportedEntry};
pub use fingerprint::Fingerprint;
pub use index::{IndexBackend, MemoryIndex, ObjectStoreIndex, ReadMode, WriteCondition};
pub use key::StorageKey;
pub use migration::{EntryTransform, MigrationPlan, MigrationReport, WithPayload};
pub use registry::{RegistryEntry, UpsertOutcome};
pub use schema::{Layer, Namespace, ParsedDeclaration, Record, Schema, SourceDeclaration};
pub use types::{FieldType, Value};
pub use warehouse::{Fetch, StoreReceipt, StoredRecord, Warehouse};
