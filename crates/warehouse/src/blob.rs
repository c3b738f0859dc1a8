// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Content-addressed blob storage over an object store
//!
//! Blobs live at `{prefix}/blobs/{fp[0..2]}/{fp}` where `fp` is the SHA-256
//! fingerprint of the content, so identical payloads share one object. Payloads
//! above the multipart threshold move in fixed-size chunks: each chunk is retried
//! on its own, chunks run with bounded parallelism, and a chunk that exhausts its
//! attempts aborts the whole upload. A multipart upload completes at a private
//! staging path, is re-read and hashed there, and only a verified object is
//! copied onto the shared blob path. Failures only ever delete staging objects.

use crate::config::{RetryConfig, TransferConfig, WarehouseConfig};
use crate::context::OpContext;
use crate::error::{BackendError, Result, WarehouseError};
use crate::fingerprint::{Fingerprint, FingerprintHasher};
use crate::retry::{Attempted, retry_backend, with_retry};
use bytes::{Bytes, BytesMut};
use diagnostics::*;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{MultipartId, ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// An object store that also exposes explicit multipart uploads
///
/// Implemented by `InMemory`, `LocalFileSystem` and the cloud stores.
pub trait BlobBackend: ObjectStore + MultipartStore {}

impl<T: ObjectStore + MultipartStore> BlobBackend for T {}

/// Where a payload lives and how it was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub path: String,
    pub size: u64,
    pub parts: u32,
}

impl Locator {
    pub fn is_multipart(&self) -> bool {
        self.parts > 1
    }
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    backend: Arc<dyn BlobBackend>,
    prefix: Option<String>,
    transfer: TransferConfig,
    retry: RetryConfig,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn BlobBackend>, config: &WarehouseConfig) -> Self {
        Self {
            backend,
            prefix: config.blob_prefix.clone(),
            transfer: config.transfer.clone(),
            retry: config.retry.clone(),
        }
    }

    pub fn path_for(&self, fingerprint: &Fingerprint) -> Path {
        let fp = fingerprint.as_str();
        let shard = fp.get(..2).unwrap_or(fp);
        self.prefixed(&format!("blobs/{shard}/{fp}"))
    }

    /// A path no other upload uses
    fn staging_path(&self) -> Path {
        self.prefixed(&format!("staging/{}", uuid7::uuid7()))
    }

    fn prefixed(&self, rest: &str) -> Path {
        match &self.prefix {
            Some(prefix) => Path::from(format!("{prefix}/{rest}")),
            None => Path::from(rest),
        }
    }

    fn parts_for(&self, size: u64) -> u32 {
        if size <= self.transfer.multipart_threshold as u64 {
            return 1;
        }
        u32::try_from(size.div_ceil(self.transfer.chunk_size as u64)).unwrap_or(u32::MAX)
    }

    /// Locator of an existing blob with this fingerprint and size
    pub async fn contains(&self, fingerprint: &Fingerprint, size: u64) -> Result<Option<Locator>> {
        let path = self.path_for(fingerprint);
        let path_ref = &path;
        let head = retry_backend("blob head", &self.retry, || async move {
            self.backend.head(path_ref).await.map_err(BackendError::from)
        })
        .await;
        match head {
            Ok(meta) if meta.size == size => Ok(Some(Locator {
                path: path.to_string(),
                size,
                parts: self.parts_for(size),
            })),
            Ok(meta) => {
                let found = meta.size;
                let location = path.to_string();
                log_warn!(
                    "blob {location} has {found} bytes, expected {size}; rewriting",
                    location: location.as_str(),
                    found: found,
                    size: size
                );
                Ok(None)
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a payload with a single request
    pub async fn put(&self, ctx: &OpContext, payload: Bytes) -> Result<Locator> {
        let fingerprint = Fingerprint::of(&payload);
        self.put_single(ctx, &fingerprint, payload).await
    }

    async fn put_single(
        &self,
        ctx: &OpContext,
        fingerprint: &Fingerprint,
        payload: Bytes,
    ) -> Result<Locator> {
        let path = self.path_for(fingerprint);
        let size = payload.len() as u64;
        let body = PutPayload::from(payload);
        let (path_ref, body_ref) = (&path, &body);

        let Attempted { result, attempts } = ctx
            .run(async {
                Ok(with_retry(
                    "blob put",
                    &self.retry,
                    self.transfer.max_attempts,
                    || async move {
                        self.backend
                            .put(path_ref, body_ref.clone())
                            .await
                            .map(|_| ())
                            .map_err(BackendError::from)
                    },
                )
                .await)
            })
            .await?;
        result.map_err(|source| WarehouseError::TransferFailed {
            locator: path.to_string(),
            chunk: None,
            attempts,
            source,
        })?;

        let location = path.to_string();
        log_debug!("stored blob {location} ({size} bytes)", location: location.as_str(), size: size);
        Ok(Locator {
            path: location,
            size,
            parts: 1,
        })
    }

    /// Upload a payload in chunks, verifying it hashes to `expected`
    ///
    /// `chunks` may yield pieces of any size; they are regrouped into
    /// `chunk_size` parts. On failure or cancellation the upload is aborted and
    /// nothing is written at the blob path; an existing blob there is never
    /// touched.
    pub async fn put_multipart(
        &self,
        ctx: &OpContext,
        expected: &Fingerprint,
        size: u64,
        chunks: BoxStream<'_, Result<Bytes>>,
    ) -> Result<Locator> {
        ctx.check()?;
        let path = self.path_for(expected);
        let location = path.to_string();
        let staging = self.staging_path();
        let staging_ref = &staging;

        let Attempted { result, attempts } = ctx
            .run(async {
                Ok(with_retry(
                    "multipart create",
                    &self.retry,
                    self.transfer.max_attempts,
                    || async move {
                        self.backend
                            .create_multipart(staging_ref)
                            .await
                            .map_err(BackendError::from)
                    },
                )
                .await)
            })
            .await?;
        let upload_id = result.map_err(|source| WarehouseError::TransferFailed {
            locator: location.clone(),
            chunk: None,
            attempts,
            source,
        })?;
        let staged = staging.to_string();
        log_debug!(
            "started multipart upload {upload} of {location} at {staged} ({size} bytes)",
            upload: upload_id.as_str(),
            location: location.as_str(),
            staged: staged.as_str(),
            size: size
        );

        let uploaded = ctx
            .run(self.upload_parts(&staging, &upload_id, chunks))
            .await;
        let (parts, actual, written) = match uploaded {
            Ok(done) => done,
            Err(err) => {
                self.abort(&staging, &upload_id).await;
                return Err(err);
            }
        };
        if written != size {
            self.abort(&staging, &upload_id).await;
            return Err(WarehouseError::IntegrityError {
                locator: location,
                expected: format!("{size} bytes"),
                actual: format!("{written} bytes"),
            });
        }
        if actual != *expected {
            self.abort(&staging, &upload_id).await;
            return Err(WarehouseError::IntegrityError {
                locator: location,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let part_count = u32::try_from(parts.len()).unwrap_or(u32::MAX);
        let mut completed = false;
        let finished = ctx
            .run(async {
                self.complete(&staging, &upload_id, parts, &location).await?;
                completed = true;
                self.verify_object(&staging, expected, size).await?;
                self.publish(&staging, &path, size).await
            })
            .await;
        if let Err(err) = finished {
            if !completed {
                self.abort(&staging, &upload_id).await;
            }
            self.discard(&staging).await;
            return Err(err);
        }
        self.discard(&staging).await;

        log_info!(
            "completed multipart upload of {location} in {parts} parts",
            location: location.as_str(),
            parts: part_count
        );
        Ok(Locator {
            path: location,
            size,
            parts: part_count,
        })
    }

    async fn complete(
        &self,
        staging: &Path,
        upload_id: &MultipartId,
        parts: Vec<PartId>,
        location: &str,
    ) -> Result<()> {
        let parts = &parts;
        let Attempted { result, attempts } = with_retry(
            "multipart complete",
            &self.retry,
            self.transfer.max_attempts,
            || async move {
                self.backend
                    .complete_multipart(staging, upload_id, parts.clone())
                    .await
                    .map(|_| ())
                    .map_err(BackendError::from)
            },
        )
        .await;
        result.map_err(|source| WarehouseError::TransferFailed {
            locator: location.to_string(),
            chunk: None,
            attempts,
            source,
        })
    }

    /// Copy a verified staging object onto its blob path
    ///
    /// A blob already there with the right size was verified by whoever wrote
    /// it and is kept; one with the wrong size is replaced.
    async fn publish(&self, staging: &Path, path: &Path, size: u64) -> Result<()> {
        let copied = retry_backend("blob publish", &self.retry, || async move {
            match self.backend.copy_if_not_exists(staging, path).await {
                Err(object_store::Error::NotImplemented) => {
                    self.backend.copy(staging, path).await
                }
                other => other,
            }
            .map_err(BackendError::from)
        })
        .await;
        match copied {
            Ok(()) => Ok(()),
            Err(BackendError::ObjectStore(object_store::Error::AlreadyExists { .. })) => {
                let existing = retry_backend("blob head", &self.retry, || async move {
                    self.backend.head(path).await.map_err(BackendError::from)
                })
                .await?;
                let location = path.to_string();
                if existing.size == size {
                    log_debug!(
                        "blob {location} was published concurrently, keeping it",
                        location: location.as_str()
                    );
                    return Ok(());
                }
                log_warn!(
                    "replacing blob {location} of the wrong size",
                    location: location.as_str()
                );
                retry_backend("blob publish", &self.retry, || async move {
                    self.backend
                        .copy(staging, path)
                        .await
                        .map_err(BackendError::from)
                })
                .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_parts(
        &self,
        path: &Path,
        upload_id: &MultipartId,
        chunks: BoxStream<'_, Result<Bytes>>,
    ) -> Result<(Vec<PartId>, Fingerprint, u64)> {
        let mut hasher = FingerprintHasher::new();
        let mut written = 0u64;
        let parts = rechunk(chunks, self.transfer.chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                if let Ok(bytes) = &chunk {
                    hasher.update(bytes);
                    written += bytes.len() as u64;
                }
                self.upload_part(path, upload_id, index, chunk)
            })
            .buffered(self.transfer.concurrency)
            .try_collect::<Vec<PartId>>()
            .await?;
        Ok((parts, hasher.finalize(), written))
    }

    async fn upload_part(
        &self,
        path: &Path,
        upload_id: &MultipartId,
        index: usize,
        chunk: Result<Bytes>,
    ) -> Result<PartId> {
        let payload = PutPayload::from(chunk?);
        let size = payload.content_length();
        let payload = &payload;
        let Attempted { result, attempts } = with_retry(
            "chunk upload",
            &self.retry,
            self.transfer.max_attempts,
            || async move {
                self.backend
                    .put_part(path, upload_id, index, payload.clone())
                    .await
                    .map_err(BackendError::from)
            },
        )
        .await;

        let location = path.to_string();
        match result {
            Ok(part) => {
                log_debug!(
                    "uploaded chunk {index} of {location} ({size} bytes)",
                    index: index,
                    location: location.as_str(),
                    size: size
                );
                Ok(part)
            }
            Err(source) => {
                let error = source.to_string();
                log_error!(
                    "chunk {index} of {location} failed after {attempts} attempts: {error}",
                    index: index,
                    location: location.as_str(),
                    attempts: attempts,
                    error: error.as_str()
                );
                Err(WarehouseError::TransferFailed {
                    locator: location,
                    chunk: Some(index),
                    attempts,
                    source,
                })
            }
        }
    }

    async fn abort(&self, path: &Path, upload_id: &MultipartId) {
        let result = retry_backend("multipart abort", &self.retry, || async move {
            self.backend
                .abort_multipart(path, upload_id)
                .await
                .map_err(BackendError::from)
        })
        .await;
        let location = path.to_string();
        match result {
            Ok(()) => {
                log_warn!(
                    "aborted multipart upload {upload} of {location}",
                    upload: upload_id.as_str(),
                    location: location.as_str()
                );
            }
            Err(e) => {
                let error = e.to_string();
                log_error!(
                    "could not abort multipart upload {upload} of {location}: {error}",
                    upload: upload_id.as_str(),
                    location: location.as_str(),
                    error: error.as_str()
                );
            }
        }
    }

    /// Delete a staging object, if there is one
    async fn discard(&self, staging: &Path) {
        let result = retry_backend("staging delete", &self.retry, || async move {
            self.backend.delete(staging).await.map_err(BackendError::from)
        })
        .await;
        match result {
            Err(e) if !e.is_not_found() => {
                let location = staging.to_string();
                let error = e.to_string();
                log_error!(
                    "could not delete staging object {location}: {error}",
                    location: location.as_str(),
                    error: error.as_str()
                );
            }
            _ => {}
        }
    }

    /// Re-read a finalized object and check its size and hash
    async fn verify_object(&self, path: &Path, expected: &Fingerprint, size: u64) -> Result<()> {
        let meta = retry_backend("blob head", &self.retry, || async move {
            self.backend.head(path).await.map_err(BackendError::from)
        })
        .await?;
        if meta.size != size {
            return Err(WarehouseError::IntegrityError {
                locator: path.to_string(),
                expected: format!("{size} bytes"),
                actual: format!("{} bytes", meta.size),
            });
        }

        let mut hasher = FingerprintHasher::new();
        let mut ranges = self.range_stream(path.clone(), size);
        while let Some(chunk) = ranges.next().await {
            hasher.update(&chunk?);
        }
        let actual = hasher.finalize();
        if actual != *expected {
            let location = path.to_string();
            log_error!(
                "blob {location} hashes to {actual}, expected {expected}",
                location: location.as_str(),
                actual: actual.as_str(),
                expected: expected.as_str()
            );
            return Err(WarehouseError::IntegrityError {
                locator: location,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Read a whole blob with a single request
    pub async fn get(&self, ctx: &OpContext, locator: &Locator) -> Result<Bytes> {
        let path = Path::from(locator.path.as_str());
        let path_ref = &path;
        let Attempted { result, attempts } = ctx
            .run(async {
                Ok(with_retry(
                    "blob get",
                    &self.retry,
                    self.transfer.max_attempts,
                    || async move {
                        let found = self.backend.get(path_ref).await?;
                        found.bytes().await.map_err(BackendError::from)
                    },
                )
                .await)
            })
            .await?;
        result.map_err(|source| WarehouseError::TransferFailed {
            locator: locator.path.clone(),
            chunk: None,
            attempts,
            source,
        })
    }

    /// Stream a blob as ranged chunks fetched in parallel, yielded in order
    pub fn get_multipart(&self, locator: &Locator) -> BoxStream<'_, Result<Bytes>> {
        self.range_stream(Path::from(locator.path.as_str()), locator.size)
    }

    fn range_stream(&self, path: Path, size: u64) -> BoxStream<'_, Result<Bytes>> {
        let chunk = self.transfer.chunk_size as u64;
        let ranges: Vec<(usize, Range<u64>)> = (0..size)
            .step_by(self.transfer.chunk_size)
            .map(|start| start..(start + chunk).min(size))
            .enumerate()
            .collect();
        stream::iter(ranges)
            .map(move |(index, range)| {
                let path = path.clone();
                async move { self.fetch_range(&path, index, range).await }
            })
            .buffered(self.transfer.concurrency)
            .boxed()
    }

    async fn fetch_range(&self, path: &Path, index: usize, range: Range<u64>) -> Result<Bytes> {
        let range_ref = &range;
        let Attempted { result, attempts } = with_retry(
            "range download",
            &self.retry,
            self.transfer.max_attempts,
            || async move {
                self.backend
                    .get_range(path, range_ref.clone())
                    .await
                    .map_err(BackendError::from)
            },
        )
        .await;
        result.map_err(|source| {
            let location = path.to_string();
            log_error!(
                "range {index} of {location} failed after {attempts} attempts",
                index: index,
                location: location.as_str(),
                attempts: attempts
            );
            WarehouseError::TransferFailed {
                locator: location,
                chunk: Some(index),
                attempts,
                source,
            }
        })
    }

    /// Write a payload unless a blob with its fingerprint already exists
    ///
    /// Returns the locator and whether any bytes were transferred.
    pub async fn store_payload(
        &self,
        ctx: &OpContext,
        payload: &Bytes,
        fingerprint: &Fingerprint,
    ) -> Result<(Locator, bool)> {
        let size = payload.len() as u64;
        if let Some(existing) = self.contains(fingerprint, size).await? {
            log_debug!(
                "blob {fingerprint} already stored, skipping transfer",
                fingerprint: fingerprint.short()
            );
            return Ok((existing, false));
        }

        let locator = if payload.len() > self.transfer.multipart_threshold {
            let chunk = self.transfer.chunk_size;
            let pieces: Vec<Result<Bytes>> = (0..payload.len())
                .step_by(chunk)
                .map(|start| Ok(payload.slice(start..(start + chunk).min(payload.len()))))
                .collect();
            self.put_multipart(ctx, fingerprint, size, stream::iter(pieces).boxed())
                .await?
        } else {
            self.put_single(ctx, fingerprint, payload.clone()).await?
        };
        Ok((locator, true))
    }

    /// Read a payload, choosing ranged download for large blobs, and check its fingerprint
    pub async fn fetch_payload(
        &self,
        ctx: &OpContext,
        locator: &Locator,
        expected: &Fingerprint,
    ) -> Result<Bytes> {
        let bytes = if locator.size > self.transfer.multipart_threshold as u64 {
            let mut buffer = BytesMut::with_capacity(usize::try_from(locator.size).unwrap_or(0));
            ctx.run(async {
                let mut chunks = self.get_multipart(locator);
                while let Some(chunk) = chunks.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(())
            })
            .await?;
            buffer.freeze()
        } else {
            self.get(ctx, locator).await?
        };

        let actual = Fingerprint::of(&bytes);
        if actual != *expected {
            return Err(WarehouseError::IntegrityError {
                locator: locator.path.clone(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }
}

/// Regroup a stream of arbitrary pieces into `chunk_size` parts (the last may be shorter)
fn rechunk<'a>(
    source: BoxStream<'a, Result<Bytes>>,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes>> + Send + 'a {
    async_stream::try_stream! {
        let mut source = source;
        let mut pending = BytesMut::with_capacity(chunk_size);
        while let Some(piece) = source.next().await {
            let mut piece = piece?;
            while !piece.is_empty() {
                let take = (chunk_size - pending.len()).min(piece.len());
                pending.extend_from_slice(&piece.split_to(take));
                if pending.len() == chunk_size {
                    yield pending.split().freeze();
                }
            }
        }
        if !pending.is_empty() {
            yield pending.split().freeze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn small_config() -> WarehouseConfig {
        let mut config = WarehouseConfig::default();
        config.transfer.chunk_size = 1024;
        config.transfer.multipart_threshold = 4096;
        config.transfer.concurrency = 3;
        config.retry.min_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 7 % 253) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_path_layout() {
        let mut config = small_config();
        let store = BlobStore::new(Arc::new(InMemory::new()), &config);
        let fp = Fingerprint::of(b"hello");
        assert_eq!(
            store.path_for(&fp).to_string(),
            format!("blobs/{}/{}", &fp.as_str()[..2], fp)
        );

        config.blob_prefix = Some("archive/v2".into());
        let store = BlobStore::new(Arc::new(InMemory::new()), &config);
        assert!(store.path_for(&fp).to_string().starts_with("archive/v2/blobs/"));
    }

    #[tokio::test]
    async fn test_small_payload_round_trip_and_dedup() {
        let store = BlobStore::new(Arc::new(InMemory::new()), &small_config());
        let ctx = OpContext::new();
        let data = payload(100);
        let fp = Fingerprint::of(&data);

        let (locator, written) = store.store_payload(&ctx, &data, &fp).await.unwrap();
        assert!(written);
        assert_eq!(locator.parts, 1);
        assert_eq!(locator.size, 100);

        let (again, written) = store.store_payload(&ctx, &data, &fp).await.unwrap();
        assert!(!written);
        assert_eq!(again, locator);

        assert_eq!(store.fetch_payload(&ctx, &locator, &fp).await.unwrap(), data);
        assert_eq!(store.get(&ctx, &locator).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let backend = Arc::new(InMemory::new());
        let store = BlobStore::new(backend.clone(), &small_config());
        let ctx = OpContext::new();
        let data = payload(10_000);
        let fp = Fingerprint::of(&data);

        // irregular input pieces are regrouped into 1 KiB parts
        let pieces: Vec<Result<Bytes>> = [333usize, 2000, 1, 7666]
            .iter()
            .scan(0usize, |offset, len| {
                let piece = data.slice(*offset..*offset + len);
                *offset += len;
                Some(Ok(piece))
            })
            .collect();
        let locator = store
            .put_multipart(&ctx, &fp, data.len() as u64, stream::iter(pieces).boxed())
            .await
            .unwrap();
        assert_eq!(locator.parts, 10);
        assert!(locator.is_multipart());

        let chunks: Vec<Bytes> = store.get_multipart(&locator).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 10);
        assert!(chunks[..9].iter().all(|c| c.len() == 1024));
        assert_eq!(chunks.concat(), data.to_vec());

        assert_eq!(store.fetch_payload(&ctx, &locator, &fp).await.unwrap(), data);
        assert_eq!(
            store.contains(&fp, data.len() as u64).await.unwrap(),
            Some(locator)
        );
        let staged: Vec<_> = backend
            .list(Some(&Path::from("staging")))
            .try_collect()
            .await
            .unwrap();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn test_multipart_rejects_wrong_fingerprint() {
        let backend = Arc::new(InMemory::new());
        let store = BlobStore::new(backend.clone(), &small_config());
        let ctx = OpContext::new();
        let data = payload(5000);
        let claimed = Fingerprint::of(b"something else");

        let result = store
            .put_multipart(
                &ctx,
                &claimed,
                data.len() as u64,
                stream::iter(vec![Ok(data.clone())]).boxed(),
            )
            .await;
        assert!(matches!(result, Err(WarehouseError::IntegrityError { .. })));
        assert!(backend.head(&store.path_for(&claimed)).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_detects_mismatch() {
        let store = BlobStore::new(Arc::new(InMemory::new()), &small_config());
        let ctx = OpContext::new();
        let locator = store.put(&ctx, payload(64)).await.unwrap();
        let result = store
            .fetch_payload(&ctx, &locator, &Fingerprint::of(b"other"))
            .await;
        assert!(matches!(result, Err(WarehouseError::IntegrityError { .. })));
    }

    #[tokio::test]
    async fn test_empty_multipart_stream() {
        let store = BlobStore::new(Arc::new(InMemory::new()), &small_config());
        let chunks: Vec<Bytes> = store
            .get_multipart(&Locator {
                path: "blobs/00/empty".into(),
                size: 0,
                parts: 0,
            })
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }
}
