use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex,
    },
};

use data_model::BlobStoreMetrics;
use sysinfo::Disks;
use tokio::fs;
use tracing::debug;

use crate::attributes::{parse_properties, render_properties};

pub const METRICS_FILENAME: &str = "metrics.properties";

const BLOB_COUNT_KEY: &str = "blobCount";
const TOTAL_SIZE_KEY: &str = "totalSize";

/// Aggregate blob count/size counters for one store. Additions and
/// deletions accumulate in atomics and are reconciled into a persisted
/// properties record by the periodic [`flush`](Self::flush); readers get
/// flushed state plus the unflushed deltas, so staleness is bounded by the
/// flush interval rather than strict.
pub struct BlobStoreMetricsStore {
    path: PathBuf,
    content_dir: PathBuf,
    persisted: Mutex<Persisted>,
    count_delta: AtomicI64,
    size_delta: AtomicI64,
    flush_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Persisted {
    blob_count: i64,
    total_size: i64,
}

impl BlobStoreMetricsStore {
    pub fn new(blob_dir: &Path, content_dir: &Path) -> Self {
        Self {
            path: blob_dir.join(METRICS_FILENAME),
            content_dir: content_dir.to_path_buf(),
            persisted: Mutex::new(Persisted::default()),
            count_delta: AtomicI64::new(0),
            size_delta: AtomicI64::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reloads the persisted record, surviving restarts without a store
    /// scan.
    pub async fn start(&self) -> io::Result<()> {
        let loaded = match fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let properties = parse_properties(&raw).unwrap_or_default();
                let parse = |key: &str| {
                    properties
                        .get(key)
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0)
                };
                Persisted {
                    blob_count: parse(BLOB_COUNT_KEY),
                    total_size: parse(TOTAL_SIZE_KEY),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Persisted::default(),
            Err(err) => return Err(err),
        };
        *self.persisted.lock().unwrap() = loaded;
        Ok(())
    }

    pub fn record_addition(&self, size: u64) {
        self.count_delta.fetch_add(1, Ordering::SeqCst);
        self.size_delta.fetch_add(size as i64, Ordering::SeqCst);
    }

    pub fn record_deletion(&self, size: u64) {
        self.count_delta.fetch_sub(1, Ordering::SeqCst);
        self.size_delta.fetch_sub(size as i64, Ordering::SeqCst);
    }

    /// Reconciles the in-memory deltas into the persisted record. The file
    /// is replaced through a temp file and atomic rename so readers never
    /// see a partial record.
    pub async fn flush(&self) -> io::Result<()> {
        let _guard = self.flush_lock.lock().await;
        let count = self.count_delta.swap(0, Ordering::SeqCst);
        let size = self.size_delta.swap(0, Ordering::SeqCst);
        let snapshot = {
            let mut persisted = self.persisted.lock().unwrap();
            persisted.blob_count = (persisted.blob_count + count).max(0);
            persisted.total_size = (persisted.total_size + size).max(0);
            *persisted
        };
        if count == 0 && size == 0 && fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(());
        }
        let pairs = vec![
            (BLOB_COUNT_KEY.to_string(), snapshot.blob_count.to_string()),
            (TOTAL_SIZE_KEY.to_string(), snapshot.total_size.to_string()),
        ];
        let temp_path = self.path.with_extension("properties.tmp");
        fs::write(&temp_path, render_properties("blob store metrics", &pairs)).await?;
        fs::rename(&temp_path, &self.path).await?;
        debug!(
            blob_count = snapshot.blob_count,
            total_size = snapshot.total_size,
            "flushed blob store metrics"
        );
        Ok(())
    }

    /// Flushed counters plus recent unflushed deltas, and a live probe of
    /// the free space on the disk holding the content root.
    pub fn get_metrics(&self) -> BlobStoreMetrics {
        let persisted = *self.persisted.lock().unwrap();
        let blob_count =
            (persisted.blob_count + self.count_delta.load(Ordering::SeqCst)).max(0) as u64;
        let total_size =
            (persisted.total_size + self.size_delta.load(Ordering::SeqCst)).max(0) as u64;
        let (available_space, unlimited) = self.available_space();
        BlobStoreMetrics {
            blob_count,
            total_size,
            available_space,
            unlimited,
        }
    }

    /// Free space on the disk whose mount point is the longest prefix of
    /// the content root.
    pub fn available_space(&self) -> (u64, bool) {
        let disks = Disks::new_with_refreshed_list();
        let best = disks
            .iter()
            .filter(|disk| self.content_dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());
        match best {
            Some(disk) => (disk.available_space(), false),
            None => (u64::MAX, true),
        }
    }

    /// Deletes the persisted record as part of store removal.
    pub async fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
