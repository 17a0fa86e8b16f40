use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use data_model::{BlobId, DeletionIndexEntry};
use tracing::{debug, warn};

const COMPACT_TOMBSTONE_THRESHOLD: usize = 64;

/// Persisted record of soft-deleted blobs awaiting compaction. The engine
/// treats it as at-least-once durable: an entry may be observed twice
/// across a crash, but is never silently lost.
pub trait DeletionIndex: Send + Sync {
    fn record(&self, entry: DeletionIndexEntry) -> io::Result<()>;

    /// Takes up to `limit` entries off the front of the queue. Draining is
    /// in-memory only; durability of the removal comes from [`Self::remove`]
    /// after the blob is physically gone.
    fn drain(&self, limit: usize) -> Vec<DeletionIndexEntry>;

    /// Durably forgets an entry once its blob has been hard-deleted.
    fn remove(&self, entry: &DeletionIndexEntry) -> io::Result<()>;

    /// Puts a drained entry back at the end of the queue, e.g. when its
    /// blob is still referenced by a live handle.
    fn requeue(&self, entry: DeletionIndexEntry);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) -> io::Result<()>;

    fn flush(&self) -> io::Result<()>;
}

/// File-backed [`DeletionIndex`]: an append-only op-log of `+store|blob` /
/// `-store|blob` lines replayed into memory at open. The log rewrites
/// itself once tombstones outnumber live entries.
#[derive(Debug)]
pub struct FileDeletionIndex {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<DeletionIndexEntry>,
    in_flight: Vec<DeletionIndexEntry>,
    log: File,
    tombstones: usize,
}

impl FileDeletionIndex {
    /// Opens (or creates) the index at `path`, replaying the op-log. An
    /// unparsable log surfaces `InvalidData` so the caller can recreate the
    /// index and schedule a rebuild.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut queue = VecDeque::new();
        let mut tombstones = 0usize;
        match fs::read_to_string(&path) {
            Ok(raw) => {
                for line in raw.lines() {
                    if line.is_empty() {
                        continue;
                    }
                    let corrupt = || {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("corrupt deletion index line: {:?}", line),
                        )
                    };
                    if let Some(rest) = line.strip_prefix('+') {
                        queue.push_back(parse_entry(rest).ok_or_else(corrupt)?);
                    } else if let Some(rest) = line.strip_prefix('-') {
                        let entry = parse_entry(rest).ok_or_else(corrupt)?;
                        tombstones += 1;
                        if let Some(pos) = queue.iter().position(|e| *e == entry) {
                            queue.remove(pos);
                        }
                    } else {
                        return Err(corrupt());
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let log = OpenOptions::new().create(true).append(true).open(&path)?;
        let index = Self {
            path,
            inner: Mutex::new(Inner {
                queue,
                in_flight: Vec::new(),
                log,
                tombstones,
            }),
        };
        if tombstones > 0 {
            let mut inner = index.inner.lock().unwrap();
            index.rewrite(&mut inner)?;
        }
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the log to contain only the live entries.
    fn rewrite(&self, inner: &mut Inner) -> io::Result<()> {
        let temp_path = self.path.with_extension("index.tmp");
        let mut temp = File::create(&temp_path)?;
        for entry in inner.in_flight.iter().chain(inner.queue.iter()) {
            writeln!(temp, "+{}", entry)?;
        }
        temp.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        inner.log = OpenOptions::new().append(true).open(&self.path)?;
        inner.tombstones = 0;
        debug!(
            path = %self.path.display(),
            live = inner.queue.len() + inner.in_flight.len(),
            "compacted deletion index log"
        );
        Ok(())
    }
}

impl DeletionIndex for FileDeletionIndex {
    fn record(&self, entry: DeletionIndexEntry) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        writeln!(inner.log, "+{}", entry)?;
        inner.log.sync_data()?;
        inner.queue.push_back(entry);
        Ok(())
    }

    fn drain(&self, limit: usize) -> Vec<DeletionIndexEntry> {
        let mut inner = self.inner.lock().unwrap();
        let take = limit.min(inner.queue.len());
        let mut page = Vec::with_capacity(take);
        for _ in 0..take {
            let entry = inner.queue.pop_front().unwrap();
            inner.in_flight.push(entry.clone());
            page.push(entry);
        }
        page
    }

    fn remove(&self, entry: &DeletionIndexEntry) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        writeln!(inner.log, "-{}", entry)?;
        inner.tombstones += 1;
        if let Some(pos) = inner.in_flight.iter().position(|e| e == entry) {
            inner.in_flight.remove(pos);
        } else if let Some(pos) = inner.queue.iter().position(|e| e == entry) {
            inner.queue.remove(pos);
        }
        let live = inner.queue.len() + inner.in_flight.len();
        if inner.tombstones >= COMPACT_TOMBSTONE_THRESHOLD && inner.tombstones > live {
            self.rewrite(&mut inner)?;
        }
        Ok(())
    }

    fn requeue(&self, entry: DeletionIndexEntry) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.in_flight.iter().position(|e| *e == entry) {
            inner.in_flight.remove(pos);
        }
        inner.queue.push_back(entry);
    }

    fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.queue.len()
    }

    fn clear(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.in_flight.clear();
        inner.tombstones = 0;
        inner.log.set_len(0)?;
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.log.sync_all()
    }
}

fn parse_entry(line: &str) -> Option<DeletionIndexEntry> {
    let (store_name, blob_id) = line.split_once('|')?;
    if store_name.is_empty() || blob_id.is_empty() {
        warn!("deletion index entry with empty field: {:?}", line);
        return None;
    }
    Some(DeletionIndexEntry::new(store_name, BlobId::new(blob_id)))
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_deletion_entry;

    use super::*;

    fn index_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("deletions.index")
    }

    #[test]
    fn test_record_drain_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileDeletionIndex::open(index_path(&dir)).unwrap();
        assert!(index.is_empty());

        index.record(mock_deletion_entry("a")).unwrap();
        index.record(mock_deletion_entry("b")).unwrap();
        index.record(mock_deletion_entry("c")).unwrap();
        assert_eq!(index.len(), 3);

        let page = index.drain(2);
        assert_eq!(page.len(), 2);
        assert_eq!(index.len(), 1);

        for entry in &page {
            index.remove(entry).unwrap();
        }
        let rest = index.drain(10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0], mock_deletion_entry("c"));
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = FileDeletionIndex::open(index_path(&dir)).unwrap();
            index.record(mock_deletion_entry("a")).unwrap();
            index.record(mock_deletion_entry("b")).unwrap();
            let page = index.drain(1);
            index.remove(&page[0]).unwrap();
        }
        let index = FileDeletionIndex::open(index_path(&dir)).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.drain(10), vec![mock_deletion_entry("b")]);
    }

    #[test]
    fn test_drained_but_unremoved_entries_replay() {
        // drain is in-memory only: a crash before remove() replays the entry
        let dir = tempfile::tempdir().unwrap();
        {
            let index = FileDeletionIndex::open(index_path(&dir)).unwrap();
            index.record(mock_deletion_entry("a")).unwrap();
            let drained = index.drain(1);
            assert_eq!(drained.len(), 1);
            assert!(index.is_empty());
        }
        let index = FileDeletionIndex::open(index_path(&dir)).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_requeue_moves_entry_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileDeletionIndex::open(index_path(&dir)).unwrap();
        index.record(mock_deletion_entry("a")).unwrap();
        index.record(mock_deletion_entry("b")).unwrap();

        let page = index.drain(1);
        index.requeue(page[0].clone());
        assert_eq!(
            index.drain(10),
            vec![mock_deletion_entry("b"), mock_deletion_entry("a")]
        );
    }

    #[test]
    fn test_log_self_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = index_path(&dir);
        let index = FileDeletionIndex::open(&path).unwrap();
        for i in 0..(COMPACT_TOMBSTONE_THRESHOLD + 8) {
            let entry = mock_deletion_entry(&format!("blob-{i}"));
            index.record(entry.clone()).unwrap();
            index.drain(1);
            index.remove(&entry).unwrap();
        }
        index.record(mock_deletion_entry("survivor")).unwrap();

        // the rewrite dropped the bulk of the op-log
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.lines().count() < 30, "log should have been compacted: {raw}");
        assert!(raw.contains("survivor"));
    }

    #[test]
    fn test_corrupt_log_surfaces_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = index_path(&dir);
        fs::write(&path, "+store|a\ngarbage without separator\n").unwrap();
        let err = FileDeletionIndex::open(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_clear_truncates_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = index_path(&dir);
        let index = FileDeletionIndex::open(&path).unwrap();
        index.record(mock_deletion_entry("a")).unwrap();
        index.clear().unwrap();
        assert!(index.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }
}
