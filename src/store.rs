use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use blobstore_utils::{get_epoch_time_in_ms, PeriodicJobService};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use data_model::{
    BlobId, BlobMetrics, BlobStoreError, BlobStoreMetrics, DeletionIndexEntry, Headers,
    BLOB_NAME_HEADER, CREATED_BY_HEADER, DIRECT_PATH_BLOB_HEADER,
};
use futures::{stream::BoxStream, Stream, StreamExt};
use metrics::{blob_store_stats, Timer};
use strum::AsRefStr;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    attributes::{parse_properties, render_properties, BlobAttributes},
    config::{ApplicationDirectories, BlobStoreConfig},
    deletions::{DeletionIndex, FileDeletionIndex},
    file_ops::{is_atomic_move_unsupported, is_transient_error, ByteStream, FileOperations},
    location::{validate_direct_path_prefix, BlobIdLocationResolver, DIRECT_PATH_ROOT, TEMPORARY_ROOT},
    quota::{BlobStoreQuotaService, QuotaCheckResult},
};

pub const BLOB_CONTENT_SUFFIX: &str = ".bytes";
pub const BLOB_ATTRIBUTE_SUFFIX: &str = ".properties";
pub const METADATA_FILENAME: &str = "metadata.properties";
pub const DELETIONS_FILENAME: &str = "deletions.index";

const TYPE_KEY: &str = "type";
const TYPE_V1: &str = "file/1";
const REBUILD_DELETED_BLOB_INDEX_KEY: &str = "rebuildDeletedBlobIndex";
const MAX_COLLISION_RETRIES: usize = 8;
const COMPACTION_PAGE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum StoreState {
    New,
    Initialised,
    Started,
    Stopped,
    Failed,
    Deleted,
}

/// In-memory record shared by every handle to the same blob id. Carries the
/// per-blob lock that serializes same-id mutations and the cached
/// headers/metrics; `None` state means stale and forces a disk re-check on
/// the next `get`.
struct LiveBlob {
    id: BlobId,
    lock: tokio::sync::Mutex<()>,
    state: RwLock<Option<(Headers, BlobMetrics)>>,
}

impl LiveBlob {
    fn new(id: BlobId) -> Self {
        Self {
            id,
            lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(None),
        }
    }

    fn is_stale(&self) -> bool {
        self.state.read().unwrap().is_none()
    }

    fn refresh(&self, headers: Headers, metrics: BlobMetrics) {
        *self.state.write().unwrap() = Some((headers, metrics));
    }

    fn mark_stale(&self) {
        *self.state.write().unwrap() = None;
    }

    fn snapshot(&self) -> Option<(Headers, BlobMetrics)> {
        self.state.read().unwrap().clone()
    }
}

/// Handle to a stored blob. Holding one keeps the live-blob entry alive so
/// the compactor can see the id is still referenced.
pub struct Blob {
    live: Arc<LiveBlob>,
    headers: Headers,
    metrics: BlobMetrics,
    content_path: PathBuf,
    file_ops: Arc<dyn FileOperations>,
}

impl Blob {
    pub fn id(&self) -> &BlobId {
        &self.live.id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn metrics(&self) -> &BlobMetrics {
        &self.metrics
    }

    /// Opens a byte stream over the content file. Discovering the bytes
    /// gone marks the handle stale so subsequent `get`s re-check the disk.
    pub async fn open_stream(&self) -> Result<ByteStream, BlobStoreError> {
        if !self.file_ops.exists(&self.content_path).await {
            warn!(
                blob_id = %self.live.id,
                path = %self.content_path.display(),
                "cannot open stream, content file is gone"
            );
            self.live.mark_stale();
            return Err(BlobStoreError::NotFound(self.live.id.clone()));
        }
        self.file_ops
            .open_read(&self.content_path)
            .await
            .map_err(|err| BlobStoreError::io(self.live.id.clone(), err))
    }

    pub async fn read_to_bytes(&self) -> Result<Bytes, BlobStoreError> {
        let mut stream = self.open_stream().await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| BlobStoreError::io(self.live.id.clone(), err))?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.into())
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.live.id)
            .field("metrics", &self.metrics)
            .finish()
    }
}

enum IngestSource {
    Stream(ByteStream),
    HardLink {
        source: PathBuf,
        size: u64,
        sha1: String,
        sha256: Option<String>,
    },
    Copy {
        source: PathBuf,
        size: u64,
        sha1: String,
        sha256: Option<String>,
    },
}

/// A blob store backed by the local filesystem. Each blob is a pair of
/// content (`.bytes`) and attributes (`.properties`) files under the
/// content root; writes land in a temporary location and become visible
/// only through an atomic move of both files. Deletes are soft: they mark
/// the attributes and record a deletion-index entry, and `compact` reclaims
/// the bytes later.
pub struct FileBlobStore {
    name: String,
    config: BlobStoreConfig,
    blob_dir: PathBuf,
    content_dir: PathBuf,
    resolver: BlobIdLocationResolver,
    file_ops: Arc<dyn FileOperations>,
    metrics_store: Arc<crate::metrics_store::BlobStoreMetricsStore>,
    deletion_index: RwLock<Option<Arc<dyn DeletionIndex>>>,
    live_blobs: DashMap<BlobId, Weak<LiveBlob>>,
    state: RwLock<StoreState>,
    supports_atomic_move: AtomicBool,
    supports_hard_link: AtomicBool,
    compaction_lock: tokio::sync::Mutex<()>,
    jobs: Arc<PeriodicJobService>,
    stats: blob_store_stats::Metrics,
}

impl FileBlobStore {
    /// The job service's lifetime is tied to this store: `stop()` shuts it
    /// down.
    pub fn new(
        config: BlobStoreConfig,
        directories: &ApplicationDirectories,
        file_ops: Arc<dyn FileOperations>,
        jobs: Arc<PeriodicJobService>,
    ) -> Self {
        let blob_dir = directories.blob_store_dir(&config.name);
        let content_dir = blob_dir.join("content");
        let metrics_store = Arc::new(crate::metrics_store::BlobStoreMetricsStore::new(
            &blob_dir,
            &content_dir,
        ));
        Self {
            name: config.name.clone(),
            resolver: BlobIdLocationResolver::new(config.date_based_layout),
            config,
            blob_dir,
            content_dir,
            file_ops,
            metrics_store,
            deletion_index: RwLock::new(None),
            live_blobs: DashMap::new(),
            state: RwLock::new(StoreState::New),
            supports_atomic_move: AtomicBool::new(true),
            supports_hard_link: AtomicBool::new(true),
            compaction_lock: tokio::sync::Mutex::new(()),
            jobs,
            stats: blob_store_stats::Metrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StoreState {
        *self.state.read().unwrap()
    }

    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    /// Creates the on-disk layout.
    pub async fn init(&self) -> Result<(), BlobStoreError> {
        self.check_state(&[StoreState::New], "init")?;
        fs::create_dir_all(&self.content_dir).await?;
        *self.state.write().unwrap() = StoreState::Initialised;
        Ok(())
    }

    /// Verifies the store metadata, re-attaches to (or recovers) the
    /// deletion index, reloads metrics, and schedules the periodic jobs.
    pub async fn start(self: &Arc<Self>) -> Result<(), BlobStoreError> {
        self.check_state(&[StoreState::Initialised, StoreState::Stopped], "start")?;

        let mut metadata = self.load_metadata().await?;
        match metadata.get(TYPE_KEY).map(String::as_str) {
            Some(TYPE_V1) => {}
            Some(other) => {
                *self.state.write().unwrap() = StoreState::Failed;
                return Err(BlobStoreError::invalid(format!(
                    "unsupported blob store type/version: {} in {}",
                    other,
                    self.blob_dir.join(METADATA_FILENAME).display()
                )));
            }
            None => {
                metadata.insert(TYPE_KEY.to_string(), TYPE_V1.to_string());
                self.save_metadata(&metadata).await?;
            }
        }

        let index_path = self.blob_dir.join(DELETIONS_FILENAME);
        let index = match FileDeletionIndex::open(&index_path) {
            Ok(index) => index,
            Err(err) => {
                error!(
                    path = %index_path.display(),
                    "unable to load deletions index, scheduling rebuild: {err}"
                );
                match fs::remove_file(&index_path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                metadata.insert(REBUILD_DELETED_BLOB_INDEX_KEY.to_string(), "true".to_string());
                self.save_metadata(&metadata).await?;
                FileDeletionIndex::open(&index_path)?
            }
        };
        *self.deletion_index.write().unwrap() = Some(Arc::new(index));

        self.metrics_store.start().await?;
        self.spawn_jobs();
        *self.state.write().unwrap() = StoreState::Started;
        info!(store = %self.name, blob_dir = %self.blob_dir.display(), "started blob store");
        Ok(())
    }

    fn spawn_jobs(self: &Arc<Self>) {
        let metrics_store = self.metrics_store.clone();
        self.jobs.spawn_interval(
            "metrics-flush",
            Duration::from_secs(self.config.metrics_flush_interval_secs),
            move || {
                let metrics_store = metrics_store.clone();
                async move {
                    if let Err(err) = metrics_store.flush().await {
                        error!("failed to flush blob store metrics: {err}");
                    }
                }
            },
        );

        let store = self.clone();
        self.jobs.spawn_interval(
            "deletion-drain",
            Duration::from_secs(self.config.compaction_interval_secs),
            move || {
                let store = store.clone();
                async move {
                    if let Err(err) = store.compact(None).await {
                        error!(store = %store.name, "periodic compaction failed: {err}");
                    }
                }
            },
        );

        if self.config.quota.is_some() {
            let store = self.clone();
            self.jobs.spawn_interval(
                "quota-check",
                Duration::from_secs(self.config.quota_check_interval_secs),
                move || {
                    let store = store.clone();
                    async move {
                        if let Some(result) = store.check_quota() {
                            if result.violation {
                                warn!(store = %store.name, "{}", result.message);
                            }
                        }
                    }
                },
            );
        }
    }

    /// Flushes pending metrics and releases resources. Unprocessed
    /// soft-delete entries stay in the persisted index for the next
    /// start/compaction cycle.
    pub async fn stop(&self) -> Result<(), BlobStoreError> {
        self.check_state(&[StoreState::Started], "stop")?;
        self.jobs.shutdown().await;
        self.metrics_store.flush().await?;
        let index = self.deletion_index.write().unwrap().take();
        if let Some(index) = index {
            index.flush()?;
        }
        self.live_blobs.clear();
        *self.state.write().unwrap() = StoreState::Stopped;
        info!(store = %self.name, "stopped blob store");
        Ok(())
    }

    /// Stores a new blob from a byte stream. The content is written to a
    /// temporary location, hashed in the same pass, and moved atomically
    /// into place together with its attributes; partial writes are never
    /// visible. A direct-path create onto an existing blob atomically
    /// replaces it and accounts the old bytes as a deletion.
    pub async fn create<S>(&self, data: S, headers: Headers) -> Result<Blob, BlobStoreError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.check_started()?;
        validate_headers(&headers)?;
        let _timer = Timer::start(&self.stats.create_latency);
        let is_direct = headers
            .get(DIRECT_PATH_BLOB_HEADER)
            .is_some_and(|v| v == "true");

        let mut data: Option<ByteStream> = Some(Box::pin(data));
        for retries in 0..=MAX_COLLISION_RETRIES {
            let blob_id = self.resolver.new_blob_id(&headers)?;
            if !is_direct && self.file_ops.exists(&self.content_path(&blob_id)?).await {
                warn!(
                    blob_id = %blob_id,
                    retries,
                    "blob id collision, retrying with a new id"
                );
                continue;
            }
            let source = IngestSource::Stream(data.take().unwrap());
            return self.try_create(blob_id, headers, source).await;
        }
        Err(BlobStoreError::Io {
            blob_id: None,
            source: io::Error::other("cannot find a free blob id"),
        })
    }

    /// Ingests a pre-existing file (e.g. a completed multipart upload),
    /// preferring a hard link over a byte copy. The caller-supplied size
    /// and sha1 are trusted; the attributes file is still written, and its
    /// failure surfaces a storage error rather than a half-created blob.
    pub async fn create_from_file(
        &self,
        source: &Path,
        headers: Headers,
        size: u64,
        sha1: &str,
    ) -> Result<Blob, BlobStoreError> {
        self.check_started()?;
        validate_headers(&headers)?;
        if !self.file_ops.exists(source).await {
            return Err(BlobStoreError::invalid(format!(
                "source file does not exist: {}",
                source.display()
            )));
        }
        let actual_size = self.file_ops.file_size(source).await?;
        if actual_size != size {
            return Err(BlobStoreError::invalid(format!(
                "declared size {} does not match source file {} ({} bytes)",
                size,
                source.display(),
                actual_size
            )));
        }
        let _timer = Timer::start(&self.stats.create_latency);

        if self.supports_hard_link.load(Ordering::Acquire) {
            let blob_id = self.resolver.new_blob_id(&headers)?;
            let link = IngestSource::HardLink {
                source: source.to_path_buf(),
                size,
                sha1: sha1.to_string(),
                sha256: None,
            };
            match self.try_create(blob_id, headers.clone(), link).await {
                Ok(blob) => return Ok(blob),
                Err(err) => {
                    self.supports_hard_link.store(false, Ordering::Release);
                    warn!(
                        store = %self.name,
                        "disabling hard links for blob store, falling back to copy: {err}"
                    );
                }
            }
        }
        let blob_id = self.resolver.new_blob_id(&headers)?;
        let copy = IngestSource::Copy {
            source: source.to_path_buf(),
            size,
            sha1: sha1.to_string(),
            sha256: None,
        };
        self.try_create(blob_id, headers, copy).await
    }

    /// Creates a new blob with the same content as an existing one. Uses a
    /// hard link when the filesystem supports it and transparently falls
    /// back to a streamed copy through the source blob's stream.
    pub async fn copy(&self, blob_id: &BlobId, headers: Headers) -> Result<Blob, BlobStoreError> {
        self.check_started()?;
        validate_headers(&headers)?;
        let source = self
            .get(blob_id)
            .await?
            .ok_or_else(|| BlobStoreError::NotFound(blob_id.clone()))?;
        let source_path = self.content_path(blob_id)?;
        let source_metrics = source.metrics().clone();
        let _timer = Timer::start(&self.stats.create_latency);

        if self.supports_hard_link.load(Ordering::Acquire) {
            let new_id = self.resolver.new_blob_id(&headers)?;
            let link = IngestSource::HardLink {
                source: source_path.clone(),
                size: source_metrics.content_size,
                sha1: source_metrics.sha1.clone(),
                sha256: source_metrics.sha256.clone(),
            };
            match self.try_create(new_id, headers.clone(), link).await {
                Ok(blob) => return Ok(blob),
                Err(err) => {
                    self.supports_hard_link.store(false, Ordering::Release);
                    warn!(
                        store = %self.name,
                        blob_id = %blob_id,
                        "disabling copy by hard link for blob store: {err}"
                    );
                }
            }
        }
        debug!(store = %self.name, blob_id = %blob_id, "copying blob through a streamed read");
        let stream = source.open_stream().await?;
        let new_id = self.resolver.new_blob_id(&headers)?;
        self.try_create(new_id, headers, IngestSource::Stream(stream))
            .await
    }

    /// Returns a handle to the blob, or `None` when it does not exist or
    /// is soft-deleted. Never mutates anything on disk.
    pub async fn get(&self, blob_id: &BlobId) -> Result<Option<Blob>, BlobStoreError> {
        self.check_started()?;
        let live = self.live_blob(blob_id);
        if live.is_stale() {
            let _guard = live.lock.lock().await;
            if live.is_stale() {
                let attr_path = self.attribute_path(blob_id)?;
                match BlobAttributes::load(&attr_path).await {
                    None => {
                        debug!(blob_id = %blob_id, "attempt to access non-existent blob");
                        return Ok(None);
                    }
                    Some(attributes) if attributes.deleted => {
                        warn!(blob_id = %blob_id, "attempt to access soft-deleted blob");
                        return Ok(None);
                    }
                    Some(attributes) => {
                        if !self.file_ops.exists(&self.content_path(blob_id)?).await {
                            warn!(blob_id = %blob_id, "blob attributes without content file");
                            return Ok(None);
                        }
                        live.refresh(attributes.headers, attributes.metrics)
                    }
                }
            }
        }
        let Some((headers, metrics)) = live.snapshot() else {
            return Ok(None);
        };
        debug!(blob_id = %blob_id, "accessing blob");
        Ok(Some(Blob {
            content_path: self.content_path(blob_id)?,
            live,
            headers,
            metrics,
            file_ops: self.file_ops.clone(),
        }))
    }

    /// Soft delete: marks the attributes, records a deletion-index entry,
    /// and hides the blob from `get`. The bytes stay on disk until
    /// `compact` runs, so readers holding a handle keep reading. No metrics
    /// change here; counters move at hard-delete time.
    pub async fn delete(&self, blob_id: &BlobId, reason: &str) -> Result<bool, BlobStoreError> {
        self.check_started()?;
        let live = self.live_blob(blob_id);
        let _guard = live.lock.lock().await;
        let attr_path = self.attribute_path(blob_id)?;
        let Some(mut attributes) = BlobAttributes::load(&attr_path).await else {
            // two racing deletes, or an index entry for a manually-removed
            // blob
            warn!(
                blob_id = %blob_id,
                "attempt to mark-for-delete a blob without attributes, hard deleting instead"
            );
            let deleted = self.delete_hard_inner(blob_id).await?;
            drop(_guard);
            self.live_blobs.remove(blob_id);
            return Ok(deleted);
        };
        if attributes.deleted {
            debug!(blob_id = %blob_id, "attempt to delete already-deleted blob");
            return Ok(false);
        }
        debug!(blob_id = %blob_id, reason, "soft deleting blob");
        attributes.set_deleted(reason);
        attributes
            .store(&attr_path)
            .await
            .map_err(|err| BlobStoreError::io(blob_id.clone(), err))?;
        self.deletion_index()?
            .record(DeletionIndexEntry::new(&self.name, blob_id.clone()))
            .map_err(|err| BlobStoreError::io(blob_id.clone(), err))?;
        live.mark_stale();
        self.stats.blobs_soft_deleted.add(1, &[]);
        Ok(true)
    }

    /// Immediate physical delete of both files with an immediate metrics
    /// decrement. For irrecoverable cleanup only; client-initiated deletes
    /// go through [`delete`](Self::delete).
    pub async fn delete_hard(&self, blob_id: &BlobId) -> Result<bool, BlobStoreError> {
        self.check_started()?;
        let live = self.live_blob(blob_id);
        let result = {
            let _guard = live.lock.lock().await;
            self.delete_hard_inner(blob_id).await
        };
        self.live_blobs.remove(blob_id);
        result
    }

    async fn delete_hard_inner(&self, blob_id: &BlobId) -> Result<bool, BlobStoreError> {
        debug!(blob_id = %blob_id, "hard deleting blob");
        let attr_path = self.attribute_path(blob_id)?;
        let blob_path = self.content_path(blob_id)?;
        let content_size = BlobAttributes::load(&attr_path)
            .await
            .map(|attributes| attributes.metrics.content_size);

        let blob_deleted = self
            .file_ops
            .delete(&blob_path)
            .await
            .map_err(|err| BlobStoreError::io(blob_id.clone(), err))?;
        self.file_ops
            .delete(&attr_path)
            .await
            .map_err(|err| BlobStoreError::io(blob_id.clone(), err))?;

        if blob_deleted {
            if let Some(size) = content_size {
                self.metrics_store.record_deletion(size);
            }
            self.stats.blobs_hard_deleted.add(1, &[]);
        }
        Ok(blob_deleted)
    }

    /// Drains the deletion index in pages and hard-deletes each recorded
    /// blob. Never runs concurrently with itself; restartable and
    /// idempotent. Entries whose files are already gone are dropped, and
    /// ids with a freshly re-created live blob are requeued for the next
    /// pass. The `cancel` token is honored between entries.
    pub async fn compact(&self, cancel: Option<CancellationToken>) -> Result<(), BlobStoreError> {
        self.check_started()?;
        let _run = self.compaction_lock.lock().await;
        self.live_blobs.retain(|_, weak| weak.strong_count() > 0);
        self.maybe_rebuild_deletion_index().await?;

        let index = self.deletion_index()?;
        let pending = index.len();
        info!(store = %self.name, pending, "begin deleted blob processing");
        let mut processed = 0usize;
        let mut reclaimed = 0usize;
        let mut cancelled = false;
        'pages: while processed < pending {
            let page = index.drain(COMPACTION_PAGE_SIZE.min(pending - processed));
            if page.is_empty() {
                break;
            }
            let mut entries = page.into_iter();
            while let Some(entry) = entries.next() {
                if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
                    index.requeue(entry);
                    for rest in entries {
                        index.requeue(rest);
                    }
                    cancelled = true;
                    break 'pages;
                }
                processed += 1;
                if entry.store_name != self.name {
                    warn!(
                        store = %self.name,
                        entry = %entry,
                        "deletion index entry for a different store, keeping"
                    );
                    index.requeue(entry);
                    continue;
                }
                let live = self
                    .live_blobs
                    .get(&entry.blob_id)
                    .and_then(|weak| weak.upgrade());
                if live.is_some_and(|live| !live.is_stale()) {
                    // re-created since the soft delete
                    index.requeue(entry);
                    continue;
                }
                match self.compact_blob(&entry.blob_id).await {
                    Ok(deleted) => {
                        if deleted {
                            reclaimed += 1;
                        }
                        index
                            .remove(&entry)
                            .map_err(|err| BlobStoreError::io(entry.blob_id.clone(), err))?;
                    }
                    Err(err) => {
                        error!(
                            store = %self.name,
                            blob_id = %entry.blob_id,
                            "failed to reclaim deleted blob: {err}"
                        );
                        index.requeue(entry);
                    }
                }
            }
        }
        self.stats.compaction_runs.add(1, &[]);
        if cancelled {
            info!(store = %self.name, processed, reclaimed, "compaction cancelled");
        } else {
            info!(store = %self.name, processed, reclaimed, "completed deleted blob processing");
        }
        Ok(())
    }

    async fn compact_blob(&self, blob_id: &BlobId) -> Result<bool, BlobStoreError> {
        let attr_path = self.attribute_path(blob_id)?;
        let blob_path = self.content_path(blob_id)?;
        match BlobAttributes::load(&attr_path).await {
            Some(attributes) if !attributes.deleted => {
                // re-created at the same id since the soft delete
                debug!(blob_id = %blob_id, "skipping reclaim of a re-created blob");
                Ok(false)
            }
            Some(_) => self.delete_hard(blob_id).await,
            None => {
                if self.file_ops.exists(&blob_path).await {
                    // truncated attributes still mark the blob soft-deleted
                    self.delete_hard(blob_id).await
                } else {
                    debug!(blob_id = %blob_id, "deleted blob already reclaimed");
                    Ok(false)
                }
            }
        }
    }

    async fn maybe_rebuild_deletion_index(&self) -> Result<(), BlobStoreError> {
        let mut metadata = self.load_metadata().await?;
        if metadata
            .get(REBUILD_DELETED_BLOB_INDEX_KEY)
            .map(String::as_str)
            != Some("true")
        {
            debug!(store = %self.name, "deletion index rebuild not required");
            return Ok(());
        }
        let index = self.deletion_index()?;
        warn!(store = %self.name, "rebuilding deletion index from a storage scan");
        index.clear()?;
        let mut found = 0usize;
        let mut ids = self.attribute_file_ids(String::new());
        while let Some(blob_id) = ids.next().await {
            let attr_path = match self.attribute_path(&blob_id) {
                Ok(path) => path,
                Err(_) => continue,
            };
            if let Some(attributes) = BlobAttributes::load(&attr_path).await {
                if attributes.deleted {
                    index
                        .record(DeletionIndexEntry::new(&self.name, blob_id))
                        .map_err(BlobStoreError::from)?;
                    found += 1;
                }
            }
        }
        metadata.remove(REBUILD_DELETED_BLOB_INDEX_KEY);
        self.save_metadata(&metadata).await?;
        warn!(store = %self.name, found, "rebuilt deletion index");
        Ok(())
    }

    /// Existence probe on the attributes file, without opening a stream.
    pub async fn exists(&self, blob_id: &BlobId) -> Result<bool, BlobStoreError> {
        self.check_started()?;
        let attr_path = self.attribute_path(blob_id)?;
        if !self.file_ops.exists(&attr_path).await {
            debug!(blob_id = %blob_id, "blob not found during existence check");
            return Ok(false);
        }
        Ok(true)
    }

    /// Lazily enumerates every non-temporary blob id present at call time.
    pub fn blob_ids(&self) -> Result<BoxStream<'static, BlobId>, BlobStoreError> {
        self.check_started()?;
        Ok(self.attribute_file_ids(String::new()))
    }

    /// Lazily enumerates direct-path blob ids under `prefix`. The prefix is
    /// traversal-validated before any I/O.
    pub fn direct_path_blob_ids(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, BlobId>, BlobStoreError> {
        self.check_started()?;
        let normalized = validate_direct_path_prefix(prefix)?;
        let root = if normalized.is_empty() {
            DIRECT_PATH_ROOT.to_string()
        } else {
            format!("{}/{}", DIRECT_PATH_ROOT, normalized)
        };
        Ok(self.attribute_file_ids(root))
    }

    fn attribute_file_ids(&self, prefix: String) -> BoxStream<'static, BlobId> {
        let content_dir = self.content_dir.clone();
        Box::pin(async_stream::stream! {
            let root = if prefix.is_empty() {
                content_dir.clone()
            } else {
                content_dir.join(&prefix)
            };
            let tmp_root = content_dir.join(TEMPORARY_ROOT);
            if !fs::try_exists(&root).await.unwrap_or(false) {
                return;
            }
            let mut pending = vec![root];
            while let Some(dir) = pending.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(dir = %dir.display(), "failed to enumerate blob files: {err}");
                        continue;
                    }
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|file_type| file_type.is_dir())
                        .unwrap_or(false);
                    if is_dir {
                        if path != tmp_root {
                            pending.push(path);
                        }
                    } else if let Some(blob_id) = blob_id_from_attribute_path(&content_dir, &path) {
                        yield blob_id;
                    }
                }
            }
        })
    }

    /// Reaps temporary and in-flight files older than `older_than`.
    /// Orphans from failed uploads end up here and are never confused with
    /// valid blobs.
    pub async fn delete_temp_files(&self, older_than: Duration) -> Result<usize, BlobStoreError> {
        self.check_started()?;
        let tmp_dir = self.content_dir.join(TEMPORARY_ROOT);
        let mut entries = match fs::read_dir(&tmp_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(UNIX_EPOCH);
        let mut reaped = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if modified <= cutoff {
                self.file_ops.delete_quietly(&entry.path()).await;
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(store = %self.name, reaped, "reaped stale temporary files");
        }
        Ok(reaped)
    }

    /// Deletes the store's own bookkeeping files and directories. Refuses
    /// to touch anything while content remains, so files exported or
    /// referenced outside the store are never removed.
    pub async fn remove(&self) -> Result<(), BlobStoreError> {
        self.check_state(
            &[StoreState::New, StoreState::Stopped, StoreState::Failed],
            "remove",
        )?;
        if !self.file_ops.delete_empty_directory(&self.content_dir).await? {
            warn!(
                store = %self.name,
                content_dir = %self.content_dir.display(),
                "refusing to remove blob store with remaining content"
            );
            return Ok(());
        }
        self.metrics_store.remove().await?;
        self.file_ops
            .delete_quietly(&self.blob_dir.join(METADATA_FILENAME))
            .await;
        self.file_ops
            .delete_quietly(&self.blob_dir.join(DELETIONS_FILENAME))
            .await;
        *self.state.write().unwrap() = StoreState::Deleted;
        if !self.file_ops.delete_empty_directory(&self.blob_dir).await? {
            warn!(
                store = %self.name,
                blob_dir = %self.blob_dir.display(),
                "unable to delete non-empty blob store directory"
            );
        }
        Ok(())
    }

    pub fn get_metrics(&self) -> Result<BlobStoreMetrics, BlobStoreError> {
        self.check_started()?;
        Ok(self.metrics_store.get_metrics())
    }

    /// Test hook and shutdown path; the periodic job covers steady state.
    pub async fn flush_metrics(&self) -> Result<(), BlobStoreError> {
        self.metrics_store.flush().await?;
        Ok(())
    }

    pub fn is_storage_available(&self) -> bool {
        let (available, unlimited) = self.metrics_store.available_space();
        unlimited || available > 0
    }

    pub fn check_quota(&self) -> Option<QuotaCheckResult> {
        let quota = self.config.quota.as_ref()?;
        let metrics = self.metrics_store.get_metrics();
        Some(BlobStoreQuotaService::check(&self.name, &metrics, quota))
    }

    pub async fn get_blob_attributes(
        &self,
        blob_id: &BlobId,
    ) -> Result<Option<BlobAttributes>, BlobStoreError> {
        self.check_started()?;
        Ok(BlobAttributes::load(&self.attribute_path(blob_id)?).await)
    }

    /// Replaces the mutable attribute fields (headers, soft-delete marker)
    /// of an existing blob. Metrics are trust-on-write and never updated.
    pub async fn set_blob_attributes(
        &self,
        blob_id: &BlobId,
        attributes: &BlobAttributes,
    ) -> Result<(), BlobStoreError> {
        self.check_started()?;
        let live = self.live_blob(blob_id);
        let _guard = live.lock.lock().await;
        let attr_path = self.attribute_path(blob_id)?;
        let Some(mut current) = BlobAttributes::load(&attr_path).await else {
            if self.file_ops.exists(&attr_path).await {
                return Err(BlobStoreError::Corrupt {
                    blob_id: blob_id.clone(),
                    path: attr_path.display().to_string(),
                });
            }
            return Err(BlobStoreError::NotFound(blob_id.clone()));
        };
        current.headers = attributes.headers.clone();
        current.deleted = attributes.deleted;
        current.deleted_reason = attributes.deleted_reason.clone();
        current.deleted_date_time_ms = attributes.deleted_date_time_ms;
        current
            .store(&attr_path)
            .await
            .map_err(|err| BlobStoreError::io(blob_id.clone(), err))?;
        live.mark_stale();
        Ok(())
    }

    async fn try_create(
        &self,
        blob_id: BlobId,
        headers: Headers,
        source: IngestSource,
    ) -> Result<Blob, BlobStoreError> {
        let location = self.resolver.locate(&blob_id)?;
        let blob_path = self
            .content_dir
            .join(format!("{}{}", location, BLOB_CONTENT_SUFFIX));
        let attr_path = self
            .content_dir
            .join(format!("{}{}", location, BLOB_ATTRIBUTE_SUFFIX));
        let suffix = Uuid::new_v4();
        let temp_location = self.resolver.temporary_location(&blob_id);
        let temp_blob_path = self
            .content_dir
            .join(format!("{}.{}{}", temp_location, suffix, BLOB_CONTENT_SUFFIX));
        let temp_attr_path = self
            .content_dir
            .join(format!("{}.{}{}", temp_location, suffix, BLOB_ATTRIBUTE_SUFFIX));

        let live = self.live_blob(&blob_id);
        let _guard = live.lock.lock().await;

        let existing_size = if blob_id.is_direct_path() && self.file_ops.exists(&attr_path).await {
            BlobAttributes::load(&attr_path)
                .await
                .map(|attributes| attributes.metrics.content_size)
        } else {
            None
        };

        debug!(blob_id = %blob_id, path = %blob_path.display(), "writing blob");
        let result: io::Result<BlobMetrics> = async {
            let stream_metrics = self.ingest(source, &temp_blob_path).await?;
            let metrics = BlobMetrics {
                creation_time_ms: get_epoch_time_in_ms(),
                sha1: stream_metrics.sha1,
                sha256: stream_metrics.sha256,
                content_size: stream_metrics.size,
            };
            let attributes = BlobAttributes::new(headers.clone(), metrics.clone());
            attributes.store(&temp_attr_path).await?;

            // existing size implies a direct-path overwrite: the replace
            // must be atomic from a reader's perspective
            if let Some(existing) = existing_size {
                self.overwrite_blob_file(&temp_blob_path, &blob_path).await?;
                self.overwrite_blob_file(&temp_attr_path, &attr_path).await?;
                self.metrics_store.record_deletion(existing);
            } else {
                self.move_blob_file(&temp_blob_path, &blob_path).await?;
                self.move_blob_file(&temp_attr_path, &attr_path).await?;
            }
            self.metrics_store.record_addition(metrics.content_size);
            Ok(metrics)
        }
        .await;

        match result {
            Ok(metrics) => {
                live.refresh(headers.clone(), metrics.clone());
                self.stats.blobs_created.add(1, &[]);
                self.stats.bytes_ingested.add(metrics.content_size, &[]);
                Ok(Blob {
                    live: live.clone(),
                    headers,
                    metrics,
                    content_path: blob_path,
                    file_ops: self.file_ops.clone(),
                })
            }
            Err(err) => {
                self.file_ops.delete_quietly(&temp_attr_path).await;
                self.file_ops.delete_quietly(&temp_blob_path).await;
                self.file_ops.delete_quietly(&attr_path).await;
                self.file_ops.delete_quietly(&blob_path).await;
                Err(BlobStoreError::io(blob_id, err))
            }
        }
    }

    async fn ingest(&self, source: IngestSource, dest: &Path) -> io::Result<data_model::StreamMetrics> {
        match source {
            IngestSource::Stream(stream) => self.file_ops.write_stream(dest, stream).await,
            IngestSource::HardLink {
                source,
                size,
                sha1,
                sha256,
            } => {
                self.file_ops.hard_link(&source, dest).await?;
                Ok(data_model::StreamMetrics { size, sha1, sha256 })
            }
            IngestSource::Copy {
                source,
                size,
                sha1,
                sha256,
            } => {
                self.file_ops.copy(&source, dest).await?;
                Ok(data_model::StreamMetrics { size, sha1, sha256 })
            }
        }
    }

    /// Moves a freshly written file into its final location. Prefers the
    /// atomic rename; when the filesystem reports it unsupported the flag
    /// flips permanently and a copy + delete preserves engine-level
    /// atomicity. Transient locked-file failures get one retry through the
    /// same fallback.
    async fn move_blob_file(&self, source: &Path, dest: &Path) -> io::Result<()> {
        if self.supports_atomic_move.load(Ordering::Acquire) {
            match self.file_ops.move_atomic(source, dest).await {
                Ok(()) => return Ok(()),
                Err(err) if is_atomic_move_unsupported(&err) => {
                    self.supports_atomic_move.store(false, Ordering::Release);
                    warn!(
                        store = %self.name,
                        source = %source.display(),
                        dest = %dest.display(),
                        "disabling atomic moves for blob store: {err}"
                    );
                }
                Err(err) if is_transient_error(&err) => {
                    warn!(
                        source = %source.display(),
                        dest = %dest.display(),
                        "transient failure during atomic move, retrying as copy: {err}"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        self.file_ops.move_file(source, dest).await
    }

    /// Like [`move_blob_file`](Self::move_blob_file) but for destinations
    /// that may already exist.
    async fn overwrite_blob_file(&self, source: &Path, dest: &Path) -> io::Result<()> {
        if self.supports_atomic_move.load(Ordering::Acquire) {
            match self.file_ops.overwrite_atomic(source, dest).await {
                Ok(()) => return Ok(()),
                Err(err) if is_atomic_move_unsupported(&err) => {
                    self.supports_atomic_move.store(false, Ordering::Release);
                    warn!(
                        store = %self.name,
                        source = %source.display(),
                        dest = %dest.display(),
                        "disabling atomic moves for blob store: {err}"
                    );
                }
                Err(err) if is_transient_error(&err) => {
                    warn!(
                        source = %source.display(),
                        dest = %dest.display(),
                        "transient failure during atomic overwrite, retrying as copy: {err}"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        self.file_ops.overwrite(source, dest).await
    }

    fn live_blob(&self, blob_id: &BlobId) -> Arc<LiveBlob> {
        let mut entry = self
            .live_blobs
            .entry(blob_id.clone())
            .or_insert_with(Weak::new);
        if let Some(live) = entry.value().upgrade() {
            return live;
        }
        let live = Arc::new(LiveBlob::new(blob_id.clone()));
        *entry.value_mut() = Arc::downgrade(&live);
        live
    }

    fn deletion_index(&self) -> Result<Arc<dyn DeletionIndex>, BlobStoreError> {
        self.deletion_index
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                BlobStoreError::invalid(format!("blob store {} has no deletion index", self.name))
            })
    }

    fn content_path(&self, blob_id: &BlobId) -> Result<PathBuf, BlobStoreError> {
        let location = self.resolver.locate(blob_id)?;
        Ok(self
            .content_dir
            .join(format!("{}{}", location, BLOB_CONTENT_SUFFIX)))
    }

    fn attribute_path(&self, blob_id: &BlobId) -> Result<PathBuf, BlobStoreError> {
        let location = self.resolver.locate(blob_id)?;
        Ok(self
            .content_dir
            .join(format!("{}{}", location, BLOB_ATTRIBUTE_SUFFIX)))
    }

    async fn load_metadata(&self) -> Result<std::collections::HashMap<String, String>, BlobStoreError> {
        match fs::read_to_string(self.blob_dir.join(METADATA_FILENAME)).await {
            Ok(raw) => parse_properties(&raw).ok_or_else(|| {
                BlobStoreError::from(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "corrupt blob store metadata",
                ))
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(std::collections::HashMap::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save_metadata(
        &self,
        metadata: &std::collections::HashMap<String, String>,
    ) -> Result<(), BlobStoreError> {
        let mut pairs: Vec<(String, String)> = metadata
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        pairs.sort();
        fs::write(
            self.blob_dir.join(METADATA_FILENAME),
            render_properties("blob store metadata", &pairs),
        )
        .await?;
        Ok(())
    }

    fn check_started(&self) -> Result<(), BlobStoreError> {
        self.check_state(&[StoreState::Started], "use")
    }

    fn check_state(&self, allowed: &[StoreState], operation: &str) -> Result<(), BlobStoreError> {
        let state = *self.state.read().unwrap();
        if !allowed.contains(&state) {
            return Err(BlobStoreError::invalid(format!(
                "cannot {} blob store {} in state {}",
                operation,
                self.name,
                state.as_ref()
            )));
        }
        Ok(())
    }
}

fn validate_headers(headers: &Headers) -> Result<(), BlobStoreError> {
    for required in [BLOB_NAME_HEADER, CREATED_BY_HEADER] {
        if !headers.contains_key(required) {
            return Err(BlobStoreError::invalid(format!(
                "missing header: {}",
                required
            )));
        }
    }
    for (key, value) in headers {
        if key.contains(['=', '\n', '\r']) || value.contains(['\n', '\r']) {
            return Err(BlobStoreError::invalid(format!(
                "malformed header: {:?}",
                key
            )));
        }
    }
    Ok(())
}

fn blob_id_from_attribute_path(content_dir: &Path, path: &Path) -> Option<BlobId> {
    let relative = path.strip_prefix(content_dir).ok()?;
    let relative = relative
        .to_str()?
        .replace(std::path::MAIN_SEPARATOR, "/");
    let relative = relative.strip_suffix(BLOB_ATTRIBUTE_SUFFIX)?;
    if let Some(name) = relative.strip_prefix("directpath/") {
        return Some(BlobId::direct(name));
    }
    if relative.starts_with("tmp/") {
        return None;
    }
    let id = relative.rsplit('/').next().unwrap_or(relative);
    Some(BlobId::new(id))
}
