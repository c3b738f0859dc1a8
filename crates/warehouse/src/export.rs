// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Copy a dataset's source entries and payloads to another object store
//!
//! The active source version is written under `{prefix}/{dataset}/`:
//! `registration.json` with every declared version, one
//! `entries/{key}.json` per entry, and `blobs/{fingerprint}` once per distinct
//! payload. Payloads are verified against their fingerprint before they leave.

use crate::blob::BlobStore;
use crate::catalog::Catalog;
use crate::config::RetryConfig;
use crate::context::OpContext;
use crate::error::{BackendError, Result, WarehouseError};
use crate::fingerprint::Fingerprint;
use crate::key::StorageKey;
use crate::registry::Registry;
use crate::retry::{Attempted, with_retry};
use crate::types::Native;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use diagnostics::*;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// What an export wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub dataset: String,
    pub schema_version: u32,
    pub entries: usize,
    /// Distinct payloads written
    pub payloads: usize,
    pub bytes: u64,
}

/// One exported entry, as written to `entries/{key}.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedEntry {
    pub key: StorageKey,
    pub schema_version: u32,
    pub metadata: BTreeMap<String, Native>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub last_modified: DateTime<Utc>,
}

pub(crate) struct Exporter<'a> {
    pub catalog: &'a Catalog,
    pub registry: &'a Registry,
    pub blobs: &'a BlobStore,
    pub retry: &'a RetryConfig,
    pub max_attempts: usize,
}

impl Exporter<'_> {
    pub(crate) async fn run(
        &self,
        ctx: &OpContext,
        dataset: &str,
        dest: &dyn ObjectStore,
        prefix: Option<&str>,
    ) -> Result<ExportReport> {
        ctx.check()?;
        let registration = self.catalog.registration(dataset).await?;
        let schema = registration.source_schema(registration.active_source_version)?;
        let root = match prefix {
            Some(prefix) => format!("{}/{dataset}", prefix.trim_end_matches('/')),
            None => dataset.to_string(),
        };
        self.write(
            ctx,
            dest,
            Path::from(format!("{root}/registration.json")),
            serde_json::to_vec_pretty(&registration)?.into(),
        )
        .await?;

        let mut report = ExportReport {
            dataset: dataset.to_string(),
            schema_version: schema.version(),
            entries: 0,
            payloads: 0,
            bytes: 0,
        };
        let mut exported: HashSet<Fingerprint> = HashSet::new();
        let namespace = schema.namespace();
        let mut entries = self.registry.query_prefix(&namespace, StorageKey::root());
        while let Some(entry) = ctx.run(entries.try_next()).await? {
            if let (Some(locator), Some(fingerprint)) = (&entry.locator, &entry.fingerprint) {
                if !exported.contains(fingerprint) {
                    let payload = self.blobs.fetch_payload(ctx, locator, fingerprint).await?;
                    report.bytes += payload.len() as u64;
                    self.write(ctx, dest, Path::from(format!("{root}/blobs/{fingerprint}")), payload)
                        .await?;
                    exported.insert(fingerprint.clone());
                    report.payloads += 1;
                }
            }

            let exported_entry = ExportedEntry {
                size: entry.locator.as_ref().map(|locator| locator.size),
                key: entry.key,
                schema_version: entry.schema_version,
                metadata: entry.metadata,
                fingerprint: entry.fingerprint,
                last_modified: entry.last_modified,
            };
            let path = Path::from(format!("{root}/entries/{}.json", exported_entry.key));
            self.write(ctx, dest, path, serde_json::to_vec_pretty(&exported_entry)?.into())
                .await?;
            report.entries += 1;
        }

        log_info!(
            "exported {entries} entries and {payloads} payloads of {dataset} to {root}",
            entries: report.entries,
            payloads: report.payloads,
            dataset: dataset,
            root: root.as_str()
        );
        Ok(report)
    }

    async fn write(
        &self,
        ctx: &OpContext,
        dest: &dyn ObjectStore,
        path: Path,
        body: Bytes,
    ) -> Result<()> {
        let payload = PutPayload::from(body);
        let (path_ref, payload_ref) = (&path, &payload);
        let Attempted { result, attempts } = ctx
            .run(async {
                Ok(with_retry("export write", self.retry, self.max_attempts, || async move {
                    dest.put(path_ref, payload_ref.clone())
                        .await
                        .map(|_| ())
                        .map_err(BackendError::from)
                })
                .await)
            })
            .await?;
        result.map_err(|source| WarehouseError::TransferFailed {
            locator: path.to_string(),
            chunk: None,
            attempts,
            source,
        })
    }
}
