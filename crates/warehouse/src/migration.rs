// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Resumable migration of registry entries between schema versions
//!
//! A migration reads every entry of the old version's namespace in key order and
//! writes a transformed entry into the new version's namespace. Old entries are
//! never touched, so readers and writers of the old version keep working while a
//! migration runs. Progress is checkpointed after every entry; an interrupted run
//! resumes after the last checkpointed key. Once the walk is done a catch-up pass
//! re-migrates old entries that were written after their migration.
//!
//! A store that read the catalog before promotion can still land in the old
//! version after catch-up has passed its key, so promotion is followed by one
//! more catch-up pass. Migration writes never replace a new-version entry that
//! was written directly. A store that lands in the old version after the
//! promotion itself is not acknowledged (see `Warehouse::store`).

use crate::blob::BlobStore;
use crate::catalog::Catalog;
use crate::config::RetryConfig;
use crate::context::OpContext;
use crate::error::{BackendError, Result, WarehouseError};
use crate::fingerprint::Fingerprint;
use crate::index::{MIGRATION_NAMESPACE, ReadMode, WriteCondition};
use crate::key::{StorageKey, derive_key};
use crate::registry::{EntryWrite, MigrationOrigin, Registry, RegistryEntry, UpsertOutcome};
use crate::retry::retry_backend;
use crate::schema::{Layer, Record, Schema};
use diagnostics::*;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-entry rewrite from the old schema version to the new one
///
/// The record handed in is decoded with the old schema. When
/// [`EntryTransform::needs_payload`] is true it also carries the entry's payload;
/// a returned record with a different payload stores that payload as a new blob,
/// and a returned record without one keeps the entry's blob.
pub trait EntryTransform: Send + Sync {
    fn transform(
        &self,
        record: Record,
        entry: &RegistryEntry,
    ) -> std::result::Result<Record, String>;

    fn needs_payload(&self) -> bool {
        false
    }
}

impl<F> EntryTransform for F
where
    F: Fn(Record) -> std::result::Result<Record, String> + Send + Sync,
{
    fn transform(
        &self,
        record: Record,
        _entry: &RegistryEntry,
    ) -> std::result::Result<Record, String> {
        self(record)
    }
}

/// A record-level transform that also reads and may rewrite payloads
pub struct WithPayload<F>(pub F);

impl<F> EntryTransform for WithPayload<F>
where
    F: Fn(Record) -> std::result::Result<Record, String> + Send + Sync,
{
    fn transform(
        &self,
        record: Record,
        _entry: &RegistryEntry,
    ) -> std::result::Result<Record, String> {
        (self.0)(record)
    }

    fn needs_payload(&self) -> bool {
        true
    }
}

/// Which versions of which layer to migrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub layer: Layer,
    pub from_version: u32,
    pub to_version: u32,
    /// Stop after this many entries of the walk; the next run resumes there
    pub limit: Option<usize>,
}

impl MigrationPlan {
    pub fn source(from_version: u32, to_version: u32) -> Self {
        Self {
            layer: Layer::Source,
            from_version,
            to_version,
            limit: None,
        }
    }

    pub fn parsed(parser: impl Into<String>, from_version: u32, to_version: u32) -> Self {
        Self {
            layer: Layer::Parsed(parser.into()),
            from_version,
            to_version,
            limit: None,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug)]
pub struct MigrationReport {
    pub run_id: String,
    pub dataset: String,
    pub from_version: u32,
    pub to_version: u32,
    /// Entries read from the old version, including catch-up re-reads
    pub processed: usize,
    /// Entries written to the new version
    pub migrated: usize,
    /// Entries whose new-version entry already matched
    pub unchanged: usize,
    /// One `MigrationEntryFailed` per entry that could not be migrated
    pub failures: Vec<WarehouseError>,
    /// Key after which this run started, when it resumed an earlier one
    pub resumed_from: Option<StorageKey>,
    /// Every old entry has been visited
    pub complete: bool,
    /// The new version became the active one
    pub promoted: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    last_key: Option<StorageKey>,
    processed: u64,
    completed: bool,
}

pub(crate) struct Migrator<'a> {
    pub catalog: &'a Catalog,
    pub registry: &'a Registry,
    pub blobs: &'a BlobStore,
    pub retry: &'a RetryConfig,
}

struct Versions {
    from: Schema,
    to: Schema,
}

impl Migrator<'_> {
    pub(crate) async fn run(
        &self,
        ctx: &OpContext,
        dataset: &str,
        plan: &MigrationPlan,
        transform: &dyn EntryTransform,
    ) -> Result<MigrationReport> {
        ctx.check()?;
        if plan.from_version == plan.to_version {
            return Err(WarehouseError::InvalidArgument(format!(
                "cannot migrate {dataset} from v{} to itself",
                plan.from_version
            )));
        }
        let registration = self.catalog.registration(dataset).await?;
        let versions = Versions {
            from: registration.schema(&plan.layer, plan.from_version)?,
            to: registration.schema(&plan.layer, plan.to_version)?,
        };

        let checkpoint_key = StorageKey::for_name(&format!(
            "{}->v{}",
            versions.from.namespace(),
            plan.to_version
        ));
        let (mut checkpoint, mut revision) = self.load_checkpoint(&checkpoint_key).await?;

        let mut report = MigrationReport {
            run_id: uuid7::uuid7().to_string(),
            dataset: dataset.to_string(),
            from_version: plan.from_version,
            to_version: plan.to_version,
            processed: 0,
            migrated: 0,
            unchanged: 0,
            failures: Vec::new(),
            resumed_from: checkpoint.last_key.clone(),
            complete: false,
            promoted: false,
        };
        let from_ns = versions.from.namespace();
        let to_ns = versions.to.namespace();
        log_info!(
            "migration {run_id} of {from} to {to} starting",
            run_id: report.run_id.as_str(),
            from: from_ns.as_str(),
            to: to_ns.as_str()
        );

        let mut failed = BTreeSet::new();
        let mut walked = 0;
        let mut exhausted = true;
        let mut entries =
            self.registry
                .scan_from(&from_ns, StorageKey::root(), checkpoint.last_key.clone());
        while let Some(entry) = ctx.run(entries.try_next()).await? {
            if plan.limit.is_some_and(|limit| walked >= limit) {
                exhausted = false;
                break;
            }
            walked += 1;
            self.apply(ctx, &versions, transform, &entry, &mut report, &mut failed)
                .await?;
            checkpoint.last_key = Some(entry.key.clone());
            checkpoint.processed += 1;
            revision = self
                .save_checkpoint(&checkpoint_key, &checkpoint, revision)
                .await?;
        }
        drop(entries);

        if exhausted {
            self.catch_up(ctx, &versions, transform, &mut report, &mut failed)
                .await?;
            checkpoint.completed = true;
            self.save_checkpoint(&checkpoint_key, &checkpoint, revision)
                .await?;
            report.complete = true;
        }

        if report.complete && report.failures.is_empty() {
            self.catalog
                .promote(dataset, &plan.layer, plan.to_version)
                .await?;
            report.promoted = true;
            // stores that read the catalog before promotion may have landed since
            self.catch_up(ctx, &versions, transform, &mut report, &mut failed)
                .await?;
        }

        let failures = report.failures.len();
        log_info!(
            "migration {run_id} processed {processed} entries, migrated {migrated}, {failures} failed",
            run_id: report.run_id.as_str(),
            processed: report.processed,
            migrated: report.migrated,
            failures: failures
        );
        Ok(report)
    }

    /// Re-migrate old entries with no new-version entry recording their current revision
    async fn catch_up(
        &self,
        ctx: &OpContext,
        versions: &Versions,
        transform: &dyn EntryTransform,
        report: &mut MigrationReport,
        failed: &mut BTreeSet<StorageKey>,
    ) -> Result<()> {
        let origins = self.origins(ctx, versions).await?;
        let from_ns = versions.from.namespace();
        let mut entries = self.registry.query_prefix(&from_ns, StorageKey::root());
        while let Some(entry) = ctx.run(entries.try_next()).await? {
            if failed.contains(&entry.key) || origins.get(&entry.key) == Some(&entry.revision) {
                continue;
            }
            log_debug!("catching up entry {key}", key: entry.key.as_str());
            self.apply(ctx, versions, transform, &entry, report, failed)
                .await?;
        }
        Ok(())
    }

    /// Old-entry revision recorded by the new-version entries migrated from each old key
    async fn origins(
        &self,
        ctx: &OpContext,
        versions: &Versions,
    ) -> Result<BTreeMap<StorageKey, u64>> {
        let mut origins: BTreeMap<StorageKey, u64> = BTreeMap::new();
        let to_ns = versions.to.namespace();
        let mut targets = self.registry.query_prefix(&to_ns, StorageKey::root());
        while let Some(target) = ctx.run(targets.try_next()).await? {
            if let Some(origin) = target.migrated_from {
                origins
                    .entry(origin.key)
                    .and_modify(|r| *r = (*r).max(origin.revision))
                    .or_insert(origin.revision);
            }
        }
        Ok(origins)
    }

    /// Migrate one entry, recording a per-entry failure or returning a fatal one
    async fn apply(
        &self,
        ctx: &OpContext,
        versions: &Versions,
        transform: &dyn EntryTransform,
        entry: &RegistryEntry,
        report: &mut MigrationReport,
        failed: &mut BTreeSet<StorageKey>,
    ) -> Result<()> {
        report.processed += 1;
        match self.migrate_entry(ctx, versions, transform, entry).await {
            Ok(Some(UpsertOutcome::Unchanged)) => report.unchanged += 1,
            Ok(Some(_)) => report.migrated += 1,
            Ok(None) => {
                log_debug!(
                    "entry {key} was written directly to the new version, leaving it",
                    key: entry.key.as_str()
                );
                report.unchanged += 1;
            }
            Err(e) if e.aborts_migration() => return Err(e),
            Err(e) => {
                let failure = entry_failure(&entry.key, e);
                let reason = failure.to_string();
                log_error!("{reason}", reason: reason.as_str());
                failed.insert(entry.key.clone());
                report.failures.push(failure);
            }
        }
        Ok(())
    }

    async fn migrate_entry(
        &self,
        ctx: &OpContext,
        versions: &Versions,
        transform: &dyn EntryTransform,
        entry: &RegistryEntry,
    ) -> Result<Option<UpsertOutcome>> {
        ctx.check()?;
        let mut record = versions.from.decode_metadata(&entry.metadata)?;
        if transform.needs_payload() {
            if let (Some(locator), Some(fingerprint)) = (&entry.locator, &entry.fingerprint) {
                let payload = self
                    .blobs
                    .fetch_payload(ctx, locator, fingerprint)
                    .await?;
                record.set_payload(Some(payload));
            }
        }

        let mut migrated = transform
            .transform(record, entry)
            .map_err(|reason| WarehouseError::MigrationEntryFailed {
                key: entry.key.to_string(),
                reason,
            })?;
        let payload = migrated.take_payload();
        let migrated = versions.to.normalize(migrated)?;
        let key = derive_key(&migrated, &versions.to)?;

        let (locator, fingerprint) = match payload {
            Some(bytes) => {
                let fingerprint = Fingerprint::of(&bytes);
                if entry.fingerprint.as_ref() == Some(&fingerprint) {
                    (entry.locator.clone(), entry.fingerprint.clone())
                } else {
                    let (locator, _) = self
                        .blobs
                        .store_payload(ctx, &bytes, &fingerprint)
                        .await?;
                    (Some(locator), Some(fingerprint))
                }
            }
            None => (entry.locator.clone(), entry.fingerprint.clone()),
        };

        let write = EntryWrite {
            schema_version: versions.to.version(),
            metadata: versions.to.encode_metadata(&migrated)?,
            locator,
            fingerprint,
            source_key: entry.source_key.clone(),
            migrated_from: Some(MigrationOrigin {
                key: entry.key.clone(),
                revision: entry.revision,
            }),
        };
        let written = ctx
            .run(
                self.registry
                    .upsert_migrated(&versions.to.namespace(), &key, write),
            )
            .await?;
        Ok(written.map(|(outcome, _)| outcome))
    }

    async fn load_checkpoint(&self, key: &StorageKey) -> Result<(Checkpoint, Option<u64>)> {
        let backend = self.registry.backend();
        let document = retry_backend("checkpoint read", self.retry, || async move {
            backend
                .get(MIGRATION_NAMESPACE, key, ReadMode::Consistent)
                .await
        })
        .await?;
        match document {
            None => Ok((Checkpoint::default(), None)),
            Some(document) => {
                let checkpoint = serde_json::from_value(document.body).map_err(|source| {
                    BackendError::CorruptDocument {
                        key: key.to_string(),
                        source,
                    }
                })?;
                Ok((checkpoint, Some(document.revision)))
            }
        }
    }

    async fn save_checkpoint(
        &self,
        key: &StorageKey,
        checkpoint: &Checkpoint,
        revision: Option<u64>,
    ) -> Result<Option<u64>> {
        let body = serde_json::to_value(checkpoint).map_err(|source| {
            BackendError::CorruptDocument {
                key: key.to_string(),
                source,
            }
        })?;
        let body = &body;
        let condition = WriteCondition::expecting(revision);
        let backend = self.registry.backend();
        let written = retry_backend("checkpoint write", self.retry, || async move {
            backend
                .put(MIGRATION_NAMESPACE, key, body.clone(), condition)
                .await
        })
        .await?;
        Ok(Some(written))
    }
}

fn entry_failure(key: &StorageKey, err: WarehouseError) -> WarehouseError {
    match err {
        failure @ WarehouseError::MigrationEntryFailed { .. } => failure,
        other => WarehouseError::MigrationEntryFailed {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}
