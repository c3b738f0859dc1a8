// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The public operation surface
//!
//! A [`Warehouse`] composes the catalog, registry and blob store over one index
//! backend and one blob backend. Source records are stored under the dataset's
//! active source schema; parsed records under a parser's active schema, linked
//! to the source entry they were parsed from.

use crate::blob::{BlobBackend, BlobStore, Locator};
use crate::catalog::{Catalog, DatasetRegistration, Registration};
use crate::config::{BackendVersion, WarehouseConfig};
use crate::context::OpContext;
use crate::error::{Result, WarehouseError};
use crate::export::{ExportReport, Exporter};
use crate::fingerprint::Fingerprint;
use crate::index::IndexBackend;
use crate::key::{StorageKey, derive_from_values, derive_key, derive_prefix};
use crate::migration::{EntryTransform, MigrationPlan, MigrationReport, Migrator};
use crate::registry::{EntryWrite, Registry, RegistryEntry, UpsertOutcome};
use crate::retry::retry_backend;
use crate::schema::{ParsedDeclaration, Record, Schema, SourceDeclaration};
use crate::types::Value;
use chrono::{DateTime, Utc};
use diagnostics::*;
use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use object_store::ObjectStore;
use std::sync::Arc;

/// How much of an entry a read returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    MetadataOnly,
    WithPayload,
}

/// A decoded entry
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: StorageKey,
    pub schema_version: u32,
    /// Carries the payload when read with [`Fetch::WithPayload`]
    pub record: Record,
    pub fingerprint: Option<Fingerprint>,
    pub locator: Option<Locator>,
    pub last_modified: DateTime<Utc>,
    pub source_key: Option<StorageKey>,
}

/// What a store did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    pub key: StorageKey,
    pub outcome: UpsertOutcome,
    pub fingerprint: Option<Fingerprint>,
    /// Payload bytes were transferred to the blob store
    pub blob_written: bool,
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Source,
    /// `None` is the dataset's default parser
    Parsed(Option<&'a str>),
}

#[derive(Debug, Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    backend_version: BackendVersion,
    catalog: Catalog,
    registry: Registry,
    blobs: BlobStore,
}

impl Warehouse {
    /// Connect to a pair of backends
    ///
    /// Fails with `BackendTooOld` when the index backend reports a version below
    /// `config.min_backend_version`; nothing else touches the backend first.
    pub async fn connect(
        config: WarehouseConfig,
        index: Arc<dyn IndexBackend>,
        blobs: Arc<dyn BlobBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let required = config.min_version()?;
        let index_ref = &index;
        let actual = retry_backend("backend version", &config.retry, || async move {
            index_ref.backend_version().await
        })
        .await?;
        if actual < required {
            return Err(WarehouseError::BackendTooOld {
                required: required.to_string(),
                actual: actual.to_string(),
            });
        }
        let version = actual.to_string();
        log_info!("connected to index backend {version}", version: version.as_str());

        Ok(Self {
            catalog: Catalog::new(
                index.clone(),
                config.retry.clone(),
                config.registry.upsert_attempts,
            ),
            registry: Registry::new(index, config.registry.clone(), config.retry.clone()),
            blobs: BlobStore::new(blobs, &config),
            backend_version: actual,
            config,
        })
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    pub fn backend_version(&self) -> &BackendVersion {
        &self.backend_version
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn register_source(
        &self,
        dataset: &str,
        declaration: &SourceDeclaration,
    ) -> Result<Registration> {
        self.catalog.register_source(dataset, declaration).await
    }

    pub async fn register_parser(
        &self,
        dataset: &str,
        declaration: &ParsedDeclaration,
        promote_default: bool,
    ) -> Result<Registration> {
        self.catalog
            .register_parser(dataset, declaration, promote_default)
            .await
    }

    pub async fn registration(&self, dataset: &str) -> Result<DatasetRegistration> {
        self.catalog.registration(dataset).await
    }

    pub async fn list_datasets(&self) -> Result<Vec<String>> {
        self.catalog.list_datasets().await
    }

    async fn active_schema(&self, dataset: &str, target: Target<'_>) -> Result<Schema> {
        match target {
            Target::Source => self.catalog.active_source_schema(dataset).await,
            Target::Parsed(parser) => self.catalog.parser_schema(dataset, parser, None).await,
        }
    }

    /// Validate and persist a source record, transferring its payload at most once
    pub async fn store(
        &self,
        ctx: &OpContext,
        dataset: &str,
        record: Record,
    ) -> Result<StoreReceipt> {
        ctx.check()?;
        let schema = self.active_schema(dataset, Target::Source).await?;
        self.write(ctx, &schema, record, None).await
    }

    /// Persist a record parsed from the source entry under `source_key`
    pub async fn store_parsed(
        &self,
        ctx: &OpContext,
        dataset: &str,
        parser: Option<&str>,
        source_key: &StorageKey,
        record: Record,
    ) -> Result<StoreReceipt> {
        ctx.check()?;
        let source = self.active_schema(dataset, Target::Source).await?;
        let exists = ctx
            .run(self.registry.consistent_lookup(&source.namespace(), source_key))
            .await?
            .is_some();
        if !exists {
            return Err(WarehouseError::NotFound(format!(
                "source entry {source_key} of '{dataset}'"
            )));
        }
        let schema = self.active_schema(dataset, Target::Parsed(parser)).await?;
        self.write(ctx, &schema, record, Some(source_key.clone()))
            .await
    }

    async fn write(
        &self,
        ctx: &OpContext,
        schema: &Schema,
        mut record: Record,
        source_key: Option<StorageKey>,
    ) -> Result<StoreReceipt> {
        let payload = record.take_payload();
        let record = schema.normalize(record)?;
        let key = derive_key(&record, schema)?;
        let namespace = schema.namespace();
        let metadata = schema.encode_metadata(&record)?;

        let (locator, fingerprint, blob_written) = match payload {
            None => (None, None, false),
            Some(bytes) => {
                let fingerprint = Fingerprint::of(&bytes);
                let current = ctx
                    .run(self.registry.consistent_lookup(&namespace, &key))
                    .await?;
                let known = current
                    .filter(|entry| entry.fingerprint.as_ref() == Some(&fingerprint))
                    .and_then(|entry| entry.locator);
                match known {
                    Some(locator) => (Some(locator), Some(fingerprint), false),
                    None => {
                        let (locator, written) =
                            self.blobs.store_payload(ctx, &bytes, &fingerprint).await?;
                        (Some(locator), Some(fingerprint), written)
                    }
                }
            }
        };

        let write = EntryWrite {
            schema_version: schema.version(),
            metadata,
            locator,
            fingerprint: fingerprint.clone(),
            source_key,
            migrated_from: None,
        };
        let (outcome, _) = ctx
            .run(self.registry.upsert(&namespace, &key, write))
            .await?;
        ctx.run(self.confirm_active(schema)).await?;
        let outcome_name = format!("{outcome:?}");
        log_info!(
            "stored {key} in {namespace}: {outcome}",
            key: key.as_str(),
            namespace: namespace.as_str(),
            outcome: outcome_name.as_str()
        );
        Ok(StoreReceipt {
            key,
            outcome,
            fingerprint,
            blob_written,
        })
    }

    /// Rewrite non-key metadata fields of an existing source entry
    ///
    /// Fields in `updates` replace the stored values; a `Null` clears a field.
    /// The payload is left as it is.
    pub async fn update_metadata(
        &self,
        ctx: &OpContext,
        dataset: &str,
        key_values: &[Value],
        updates: Record,
    ) -> Result<StoreReceipt> {
        ctx.check()?;
        let schema = self.active_schema(dataset, Target::Source).await?;
        if let Some(field) = updates.fields().keys().find(|f| schema.is_primary_key(f)) {
            return Err(WarehouseError::InvalidArgument(format!(
                "primary key field '{field}' cannot be updated"
            )));
        }
        if updates.payload().is_some() {
            return Err(WarehouseError::InvalidArgument(
                "metadata updates cannot carry a payload".into(),
            ));
        }

        let key = derive_from_values(key_values, &schema)?;
        let namespace = schema.namespace();
        let entry = ctx
            .run(self.registry.consistent_lookup(&namespace, &key))
            .await?
            .ok_or_else(|| WarehouseError::NotFound(format!("{key} in {namespace}")))?;

        let mut record = schema.decode_metadata(&entry.metadata)?;
        for (field, value) in updates.fields() {
            record.insert(field.clone(), value.clone());
        }
        let record = schema.normalize(record)?;
        let write = EntryWrite {
            schema_version: schema.version(),
            metadata: schema.encode_metadata(&record)?,
            locator: entry.locator.clone(),
            fingerprint: entry.fingerprint.clone(),
            source_key: entry.source_key.clone(),
            migrated_from: None,
        };
        let (outcome, _) = ctx
            .run(self.registry.upsert(&namespace, &key, write))
            .await?;
        ctx.run(self.confirm_active(&schema)).await?;
        Ok(StoreReceipt {
            key,
            outcome,
            fingerprint: entry.fingerprint,
            blob_written: false,
        })
    }

    /// Fail a write whose version was promoted away from while it was in flight
    ///
    /// A migration carries over old-version writes only until it has promoted,
    /// so a write that lands after that must not be acknowledged.
    async fn confirm_active(&self, schema: &Schema) -> Result<()> {
        let active = self
            .catalog
            .registration(schema.dataset())
            .await?
            .active_version(schema.layer())?;
        if active == schema.version() {
            return Ok(());
        }
        let namespace = schema.namespace().to_string();
        log_warn!(
            "write to {namespace} raced promotion of v{active}",
            namespace: namespace.as_str(),
            active: active
        );
        Err(WarehouseError::VersionSuperseded { namespace, active })
    }

    /// Consistent read of one source entry by its primary key values
    pub async fn get(
        &self,
        ctx: &OpContext,
        dataset: &str,
        key_values: &[Value],
        fetch: Fetch,
    ) -> Result<Option<StoredRecord>> {
        ctx.check()?;
        let schema = self.active_schema(dataset, Target::Source).await?;
        let key = derive_from_values(key_values, &schema)?;
        self.read(ctx, &schema, &key, fetch).await
    }

    pub async fn get_by_key(
        &self,
        ctx: &OpContext,
        dataset: &str,
        key: &StorageKey,
        fetch: Fetch,
    ) -> Result<Option<StoredRecord>> {
        ctx.check()?;
        let schema = self.active_schema(dataset, Target::Source).await?;
        self.read(ctx, &schema, key, fetch).await
    }

    pub async fn get_parsed(
        &self,
        ctx: &OpContext,
        dataset: &str,
        parser: Option<&str>,
        key_values: &[Value],
        fetch: Fetch,
    ) -> Result<Option<StoredRecord>> {
        ctx.check()?;
        let schema = self.active_schema(dataset, Target::Parsed(parser)).await?;
        let key = derive_from_values(key_values, &schema)?;
        self.read(ctx, &schema, &key, fetch).await
    }

    pub async fn fingerprint_of(
        &self,
        ctx: &OpContext,
        dataset: &str,
        key_values: &[Value],
    ) -> Result<Option<Fingerprint>> {
        ctx.check()?;
        let schema = self.active_schema(dataset, Target::Source).await?;
        let key = derive_from_values(key_values, &schema)?;
        ctx.run(self.registry.fingerprint_of(&schema.namespace(), &key))
            .await
    }

    async fn read(
        &self,
        ctx: &OpContext,
        schema: &Schema,
        key: &StorageKey,
        fetch: Fetch,
    ) -> Result<Option<StoredRecord>> {
        let entry = ctx
            .run(self.registry.consistent_lookup(&schema.namespace(), key))
            .await?;
        match entry {
            Some(entry) => Ok(Some(self.materialize(ctx, schema, entry, fetch).await?)),
            None => Ok(None),
        }
    }

    async fn materialize(
        &self,
        ctx: &OpContext,
        schema: &Schema,
        entry: RegistryEntry,
        fetch: Fetch,
    ) -> Result<StoredRecord> {
        let mut record = schema.decode_metadata(&entry.metadata)?;
        if fetch == Fetch::WithPayload {
            if let (Some(locator), Some(fingerprint)) = (&entry.locator, &entry.fingerprint) {
                let payload = self.blobs.fetch_payload(ctx, locator, fingerprint).await?;
                record.set_payload(Some(payload));
            }
        }
        Ok(StoredRecord {
            key: entry.key,
            schema_version: entry.schema_version,
            record,
            fingerprint: entry.fingerprint,
            locator: entry.locator,
            last_modified: entry.last_modified,
            source_key: entry.source_key,
        })
    }

    /// Lazily stream the source entries whose leading key fields equal `prefix`, in key order
    ///
    /// An empty prefix streams the whole dataset. Each call is an independent
    /// sequence reflecting the state at the time each page is read.
    pub fn query_prefix<'a>(
        &'a self,
        ctx: &'a OpContext,
        dataset: &'a str,
        prefix: Vec<Value>,
        fetch: Fetch,
    ) -> BoxStream<'a, Result<StoredRecord>> {
        self.records(ctx, dataset, Target::Source, prefix, fetch)
            .boxed()
    }

    pub fn query_parsed_prefix<'a>(
        &'a self,
        ctx: &'a OpContext,
        dataset: &'a str,
        parser: Option<&'a str>,
        prefix: Vec<Value>,
        fetch: Fetch,
    ) -> BoxStream<'a, Result<StoredRecord>> {
        self.records(ctx, dataset, Target::Parsed(parser), prefix, fetch)
            .boxed()
    }

    fn records<'a>(
        &'a self,
        ctx: &'a OpContext,
        dataset: &'a str,
        target: Target<'a>,
        prefix: Vec<Value>,
        fetch: Fetch,
    ) -> impl Stream<Item = Result<StoredRecord>> + Send + 'a {
        async_stream::try_stream! {
            ctx.check()?;
            let schema = self.active_schema(dataset, target).await?;
            let prefix = derive_prefix(&prefix, &schema)?;
            let namespace = schema.namespace();
            let mut entries = self.registry.query_prefix(&namespace, prefix);
            while let Some(entry) = ctx.run(entries.try_next()).await? {
                yield self.materialize(ctx, &schema, entry, fetch).await?;
            }
        }
    }

    /// Migrate entries between schema versions; see [`crate::migration`]
    pub async fn migrate(
        &self,
        ctx: &OpContext,
        dataset: &str,
        plan: &MigrationPlan,
        transform: &dyn EntryTransform,
    ) -> Result<MigrationReport> {
        Migrator {
            catalog: &self.catalog,
            registry: &self.registry,
            blobs: &self.blobs,
            retry: &self.config.retry,
        }
        .run(ctx, dataset, plan, transform)
        .await
    }

    /// Copy the active source version of a dataset, payloads included, to `dest`
    ///
    /// `dest` may be any object store: a bucket, or `LocalFileSystem` to
    /// download a dataset to disk. See [`crate::export`] for the layout.
    pub async fn export(
        &self,
        ctx: &OpContext,
        dataset: &str,
        dest: &dyn ObjectStore,
        prefix: Option<&str>,
    ) -> Result<ExportReport> {
        Exporter {
            catalog: &self.catalog,
            registry: &self.registry,
            blobs: &self.blobs,
            retry: &self.config.retry,
            max_attempts: self.config.transfer.max_attempts,
        }
        .run(ctx, dataset, dest, prefix)
        .await
    }

    pub async fn migrate_parsed(
        &self,
        ctx: &OpContext,
        dataset: &str,
        parser: &str,
        from_version: u32,
        to_version: u32,
        transform: &dyn EntryTransform,
    ) -> Result<MigrationReport> {
        let plan = MigrationPlan::parsed(parser, from_version, to_version);
        self.migrate(ctx, dataset, &plan, transform).await
    }
}
