// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::{Document, IndexBackend, ReadMode, WriteCondition, format_version};
use crate::config::BackendVersion;
use crate::error::BackendError;
use crate::key::StorageKey;
use async_trait::async_trait;
use diagnostics::*;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MANIFEST: &str = "_backend.json";

#[derive(Serialize, Deserialize)]
struct Manifest {
    version: String,
}

#[derive(Serialize, Deserialize)]
struct StoredDocument {
    revision: u64,
    body: serde_json::Value,
}

/// Index backend keeping one JSON object per document in an object store
///
/// Documents live at `{root}/{namespace}/{key}.json`. Conditional writes use the
/// store's create-if-absent and compare-on-etag modes, so the store must support
/// them (local filesystem, S3 with conditional writes, GCS, Azure, in-memory).
/// Object stores offer read-after-write consistency, so both read modes take the
/// same path.
#[derive(Debug)]
pub struct ObjectStoreIndex {
    store: Arc<dyn ObjectStore>,
    root: Path,
    version: BackendVersion,
}

impl ObjectStoreIndex {
    /// Open the index under `root`, initializing its manifest on first use
    pub async fn open(store: Arc<dyn ObjectStore>, root: &str) -> Result<Self, BackendError> {
        let root = Path::from(root);
        let manifest_path = root.child(MANIFEST);

        let version = match read_manifest(&store, &manifest_path).await? {
            Some(version) => version,
            None => {
                let manifest = Manifest {
                    version: format_version().to_string(),
                };
                let bytes = serde_json::to_vec(&manifest).map_err(|source| {
                    BackendError::CorruptDocument {
                        key: manifest_path.to_string(),
                        source,
                    }
                })?;
                match store
                    .put_opts(
                        &manifest_path,
                        PutPayload::from(bytes),
                        PutOptions::from(PutMode::Create),
                    )
                    .await
                {
                    Ok(_) => {
                        let path = manifest_path.to_string();
                        log_info!("initialized index manifest at {path}", path: path.as_str());
                        format_version()
                    }
                    Err(object_store::Error::AlreadyExists { .. }) => {
                        read_manifest(&store, &manifest_path).await?.ok_or_else(|| {
                            BackendError::Unavailable(format!(
                                "manifest {manifest_path} vanished during initialization"
                            ))
                        })?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        Ok(Self {
            store,
            root,
            version,
        })
    }

    fn namespace_path(&self, namespace: &str) -> Path {
        namespace
            .split('/')
            .fold(self.root.clone(), |path, part| path.child(part))
    }

    fn document_path(&self, namespace: &str, key: &StorageKey) -> Path {
        self.namespace_path(namespace)
            .child(format!("{key}.json"))
    }

    async fn read(
        &self,
        path: &Path,
        key: &StorageKey,
    ) -> Result<Option<(Document, UpdateVersion)>, BackendError> {
        let result = match self.store.get(path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let bytes = result.bytes().await?;
        let stored: StoredDocument =
            serde_json::from_slice(&bytes).map_err(|source| BackendError::CorruptDocument {
                key: path.to_string(),
                source,
            })?;
        Ok(Some((
            Document {
                key: key.clone(),
                revision: stored.revision,
                body: stored.body,
            },
            version,
        )))
    }
}

async fn read_manifest(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
) -> Result<Option<BackendVersion>, BackendError> {
    let bytes = match store.get(path).await {
        Ok(result) => result.bytes().await?,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let manifest: Manifest =
        serde_json::from_slice(&bytes).map_err(|source| BackendError::CorruptDocument {
            key: path.to_string(),
            source,
        })?;
    manifest
        .version
        .parse()
        .map(Some)
        .map_err(BackendError::Unavailable)
}

#[async_trait]
impl IndexBackend for ObjectStoreIndex {
    async fn backend_version(&self) -> Result<BackendVersion, BackendError> {
        Ok(self.version.clone())
    }

    async fn get(
        &self,
        namespace: &str,
        key: &StorageKey,
        _mode: ReadMode,
    ) -> Result<Option<Document>, BackendError> {
        let path = self.document_path(namespace, key);
        Ok(self.read(&path, key).await?.map(|(doc, _)| doc))
    }

    async fn put(
        &self,
        namespace: &str,
        key: &StorageKey,
        body: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<u64, BackendError> {
        let path = self.document_path(namespace, key);
        let conflict = || BackendError::Conflict(format!("{namespace}/{key}"));

        let (mode, revision) = match condition {
            WriteCondition::Absent => (PutMode::Create, 1),
            WriteCondition::Revision(expected) => {
                let (current, version) = self.read(&path, key).await?.ok_or_else(conflict)?;
                if current.revision != expected {
                    return Err(conflict());
                }
                (PutMode::Update(version), expected + 1)
            }
        };

        let bytes = serde_json::to_vec(&StoredDocument { revision, body }).map_err(|source| {
            BackendError::CorruptDocument {
                key: path.to_string(),
                source,
            }
        })?;
        match self
            .store
            .put_opts(&path, PutPayload::from(bytes), PutOptions::from(mode))
            .await
        {
            Ok(_) => Ok(revision),
            Err(
                object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. },
            ) => Err(conflict()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan(
        &self,
        namespace: &str,
        prefix: &StorageKey,
        start_after: Option<&StorageKey>,
        limit: usize,
        _mode: ReadMode,
    ) -> Result<Vec<Document>, BackendError> {
        let namespace_path = self.namespace_path(namespace);
        let metas: Vec<_> = self
            .store
            .list(Some(&namespace_path))
            .try_collect()
            .await?;

        let mut keys: Vec<StorageKey> = metas
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter_map(|name| name.strip_suffix(".json"))
            .filter_map(|hex| StorageKey::parse(hex).ok())
            .filter(|key| key.starts_with(prefix))
            .filter(|key| start_after.is_none_or(|after| key > after))
            .collect();
        keys.sort();
        keys.truncate(limit);

        let mut documents = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.document_path(namespace, &key);
            if let Some((doc, _)) = self.read(&path, &key).await? {
                documents.push(doc);
            }
        }
        Ok(documents)
    }
}
