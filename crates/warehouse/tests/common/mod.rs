// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartId, ObjectMeta, ObjectStore, PutMultipartOptions,
    PutOptions, PutPayload, PutResult, Result as ObjectStoreResult,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warehouse::index::{Document, WriteCondition};
use warehouse::{
    BackendError, BackendVersion, FieldType, IndexBackend, MemoryIndex, OpContext, ReadMode,
    Record, SourceDeclaration, StorageKey, Warehouse, WarehouseConfig,
};

/// Blob backend over `InMemory` that can fail, slow down or corrupt requests
#[derive(Debug)]
pub struct FlakyStore {
    inner: InMemory,
    /// Upcoming part uploads that fail with a transient error
    part_failures: AtomicUsize,
    /// Part index that fails every attempt
    broken_part: AtomicUsize,
    /// Upcoming ranged reads that fail with a transient error
    range_failures: AtomicUsize,
    /// Parts are written with zeroed content
    corrupt_parts: AtomicBool,
    part_delay_ms: AtomicU64,
    complete_delay_ms: AtomicU64,
    puts: AtomicUsize,
    parts: AtomicUsize,
    aborts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemory::new(),
            part_failures: AtomicUsize::new(0),
            broken_part: AtomicUsize::new(usize::MAX),
            range_failures: AtomicUsize::new(0),
            corrupt_parts: AtomicBool::new(false),
            part_delay_ms: AtomicU64::new(0),
            complete_delay_ms: AtomicU64::new(0),
            puts: AtomicUsize::new(0),
            parts: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_parts(&self, count: usize) {
        self.part_failures.store(count, Ordering::SeqCst);
    }

    pub fn break_part(&self, index: usize) {
        self.broken_part.store(index, Ordering::SeqCst);
    }

    pub fn fail_next_ranges(&self, count: usize) {
        self.range_failures.store(count, Ordering::SeqCst);
    }

    pub fn corrupt_parts(&self, enabled: bool) {
        self.corrupt_parts.store(enabled, Ordering::SeqCst);
    }

    pub fn delay_parts(&self, delay: Duration) {
        self.part_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn delay_completion(&self, delay: Duration) {
        self.complete_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn parts(&self) -> usize {
        self.parts.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Objects currently stored, staging objects included
    pub async fn object_count(&self) -> usize {
        use futures::TryStreamExt;
        let objects: Vec<ObjectMeta> = self.inner.list(None).try_collect().await.unwrap_or_default();
        objects.len()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn injected(what: &str) -> object_store::Error {
    object_store::Error::Generic {
        store: "flaky",
        source: format!("injected {what} failure").into(),
    }
}

impl fmt::Display for FlakyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlakyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> ObjectStoreResult<PutResult> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOptions,
    ) -> ObjectStoreResult<Box<dyn object_store::MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> ObjectStoreResult<GetResult> {
        if options.range.is_some() && Self::take(&self.range_failures) {
            return Err(injected("range"));
        }
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> ObjectStoreResult<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, ObjectStoreResult<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> ObjectStoreResult<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> ObjectStoreResult<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> ObjectStoreResult<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

#[async_trait]
impl MultipartStore for FlakyStore {
    async fn create_multipart(&self, path: &Path) -> ObjectStoreResult<MultipartId> {
        self.inner.create_multipart(path).await
    }

    async fn put_part(
        &self,
        path: &Path,
        id: &MultipartId,
        part_idx: usize,
        data: PutPayload,
    ) -> ObjectStoreResult<PartId> {
        let delay = self.part_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if part_idx == self.broken_part.load(Ordering::SeqCst) {
            return Err(injected("part"));
        }
        if Self::take(&self.part_failures) {
            return Err(injected("part"));
        }
        self.parts.fetch_add(1, Ordering::SeqCst);
        let data = if self.corrupt_parts.load(Ordering::SeqCst) {
            PutPayload::from(vec![0u8; data.content_length()])
        } else {
            data
        };
        self.inner.put_part(path, id, part_idx, data).await
    }

    async fn complete_multipart(
        &self,
        path: &Path,
        id: &MultipartId,
        parts: Vec<PartId>,
    ) -> ObjectStoreResult<PutResult> {
        let delay = self.complete_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.complete_multipart(path, id, parts).await
    }

    async fn abort_multipart(&self, path: &Path, id: &MultipartId) -> ObjectStoreResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_multipart(path, id).await
    }
}

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Index backend that runs a hook right before the next write to a namespace
pub struct HookedIndex {
    inner: Arc<MemoryIndex>,
    hook: Mutex<Option<(String, Hook)>>,
}

impl HookedIndex {
    pub fn new(inner: Arc<MemoryIndex>) -> Self {
        Self {
            inner,
            hook: Mutex::new(None),
        }
    }

    pub fn before_next_write<F>(&self, namespace: impl Into<String>, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        *self.hook.lock().unwrap() = Some((namespace.into(), Box::new(hook)));
    }

    fn take_hook(&self, namespace: &str) -> Option<Hook> {
        let mut slot = self.hook.lock().unwrap();
        match slot.take() {
            Some((target, hook)) if target == namespace => Some(hook),
            other => {
                *slot = other;
                None
            }
        }
    }
}

impl fmt::Debug for HookedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedIndex")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IndexBackend for HookedIndex {
    async fn backend_version(&self) -> Result<BackendVersion, BackendError> {
        self.inner.backend_version().await
    }

    async fn get(
        &self,
        namespace: &str,
        key: &StorageKey,
        mode: ReadMode,
    ) -> Result<Option<Document>, BackendError> {
        self.inner.get(namespace, key, mode).await
    }

    async fn put(
        &self,
        namespace: &str,
        key: &StorageKey,
        body: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<u64, BackendError> {
        if let Some(hook) = self.take_hook(namespace) {
            hook().await;
        }
        self.inner.put(namespace, key, body, condition).await
    }

    async fn scan(
        &self,
        namespace: &str,
        prefix: &StorageKey,
        start_after: Option<&StorageKey>,
        limit: usize,
        mode: ReadMode,
    ) -> Result<Vec<Document>, BackendError> {
        self.inner
            .scan(namespace, prefix, start_after, limit, mode)
            .await
    }
}

/// Small chunks and quick retries so multipart paths run on tiny payloads
pub fn test_config() -> WarehouseConfig {
    let mut config = WarehouseConfig::default();
    config.transfer.chunk_size = 1024;
    config.transfer.multipart_threshold = 4096;
    config.transfer.concurrency = 3;
    config.transfer.max_attempts = 3;
    config.retry.min_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

pub struct Harness {
    pub warehouse: Warehouse,
    pub index: Arc<MemoryIndex>,
    pub blobs: Arc<FlakyStore>,
    pub ctx: OpContext,
}

impl Harness {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_index(MemoryIndex::new()).await
    }

    pub async fn with_index(index: MemoryIndex) -> anyhow::Result<Self> {
        diagnostics::init();
        let index = Arc::new(index);
        let blobs = Arc::new(FlakyStore::new());
        let warehouse = Warehouse::connect(test_config(), index.clone(), blobs.clone()).await?;
        Ok(Self {
            warehouse,
            index,
            blobs,
            ctx: OpContext::new(),
        })
    }

    /// A `documents` harness whose index runs hooks installed on the returned handle
    pub async fn with_hooks() -> anyhow::Result<(Self, Arc<HookedIndex>)> {
        diagnostics::init();
        let index = Arc::new(MemoryIndex::new());
        let hooked = Arc::new(HookedIndex::new(index.clone()));
        let blobs = Arc::new(FlakyStore::new());
        let warehouse = Warehouse::connect(test_config(), hooked.clone(), blobs.clone()).await?;
        warehouse.register_source("documents", &documents()).await?;
        let harness = Self {
            warehouse,
            index,
            blobs,
            ctx: OpContext::new(),
        };
        Ok((harness, hooked))
    }

    /// Registers the `documents` dataset: keyed by url, filename required
    pub async fn with_documents() -> anyhow::Result<Self> {
        let harness = Self::new().await?;
        harness
            .warehouse
            .register_source("documents", &documents())
            .await?;
        Ok(harness)
    }
}

pub fn documents() -> SourceDeclaration {
    SourceDeclaration::new(["url"])
        .field("url", FieldType::Str)
        .field("filename", FieldType::Str)
        .required("filename")
}

pub fn document(url: &str, filename: &str, body: impl Into<bytes::Bytes>) -> Record {
    Record::new()
        .with("url", url)
        .with("filename", filename)
        .with_payload(body)
}

/// Deterministic, non-repeating-looking bytes
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + usize::from(seed) * 17) % 251) as u8 + 1)
        .collect()
}
