pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
    io,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use thiserror::Error;
use uuid::Uuid;

/// Required header naming the logical blob, e.g. `org/foo/foo-1.0.jar`.
pub const BLOB_NAME_HEADER: &str = "BlobStore.blob-name";

/// Required header recording the principal that created the blob.
pub const CREATED_BY_HEADER: &str = "BlobStore.created-by";

/// Optional header; `"true"` stores the blob at the caller-chosen logical
/// path named by [`BLOB_NAME_HEADER`] instead of a generated location.
pub const DIRECT_PATH_BLOB_HEADER: &str = "BlobStore.direct-path";

/// Optional header marking an in-flight upload that is reaped separately.
pub const TEMPORARY_BLOB_HEADER: &str = "BlobStore.temporary-blob";

/// Optional header carrying the declared content type.
pub const CONTENT_TYPE_HEADER: &str = "BlobStore.content-type";

/// Reserved id prefix for direct-path blobs.
pub const DIRECT_PATH_PREFIX: &str = "path$";

/// Reserved id prefix for temporary blobs.
pub const TEMPORARY_PREFIX: &str = "tmp$";

const DATE_PREFIX_FORMAT: &str = "%Y%m%d.%H%M";

pub type Headers = HashMap<String, String>;

/// Opaque, unique identifier for a stored blob. Content-addressed ids are
/// generated; direct-path ids carry a caller-supplied logical path behind
/// the `path$` prefix; temporary ids use the `tmp$` prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a content-addressed id. With `date_based` set the current UTC
    /// date and time are baked into the id (`yyyyMMdd.HHmm.<uuid>`) so the
    /// location resolver stays a pure function of the id.
    pub fn generate(date_based: bool) -> Self {
        if date_based {
            Self(format!(
                "{}.{}",
                Utc::now().format(DATE_PREFIX_FORMAT),
                Uuid::new_v4()
            ))
        } else {
            Self(Uuid::new_v4().to_string())
        }
    }

    pub fn direct(name: &str) -> Self {
        Self(format!("{}{}", DIRECT_PATH_PREFIX, name))
    }

    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMPORARY_PREFIX, Uuid::new_v4()))
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    pub fn is_direct_path(&self) -> bool {
        self.0.starts_with(DIRECT_PATH_PREFIX)
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_PREFIX)
    }

    /// The logical path of a direct-path id, without the reserved prefix.
    pub fn direct_path_name(&self) -> Option<&str> {
        self.0.strip_prefix(DIRECT_PATH_PREFIX)
    }
}

impl Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Immutable per-blob metrics, computed once while the content is streamed
/// to disk and persisted into the attributes file. Never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMetrics {
    pub creation_time_ms: u64,
    pub sha1: String,
    pub sha256: Option<String>,
    pub content_size: u64,
}

/// Digests and byte count gathered while ingesting a content stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetrics {
    pub size: u64,
    pub sha1: String,
    pub sha256: Option<String>,
}

/// Aggregate counters for a whole blob store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlobStoreMetrics {
    pub blob_count: u64,
    pub total_size: u64,
    pub available_space: u64,
    /// Set when no disk could be matched to the content root, in which case
    /// `available_space` is meaningless.
    pub unlimited: bool,
}

/// A soft-deleted blob awaiting physical reclamation by compaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeletionIndexEntry {
    pub store_name: String,
    pub blob_id: BlobId,
}

impl DeletionIndexEntry {
    pub fn new(store_name: impl Into<String>, blob_id: BlobId) -> Self {
        Self {
            store_name: store_name.into(),
            blob_id,
        }
    }
}

impl Display for DeletionIndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.store_name, self.blob_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Corrupt,
    Io,
}

/// The single storage error surfaced by the engine. `kind()` is the
/// discriminant callers branch on; the blob id is carried where known.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob {0} not found")]
    NotFound(BlobId),

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("corrupt blob {blob_id} at {path}")]
    Corrupt { blob_id: BlobId, path: String },

    #[error("storage failure{}: {source}", display_blob_id(.blob_id))]
    Io {
        blob_id: Option<BlobId>,
        #[source]
        source: io::Error,
    },
}

fn display_blob_id(blob_id: &Option<BlobId>) -> String {
    match blob_id {
        Some(id) => format!(" for blob {}", id),
        None => String::new(),
    }
}

impl BlobStoreError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn io(blob_id: BlobId, source: io::Error) -> Self {
        Self::Io {
            blob_id: Some(blob_id),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn blob_id(&self) -> Option<&BlobId> {
        match self {
            Self::NotFound(id) => Some(id),
            Self::Corrupt { blob_id, .. } => Some(blob_id),
            Self::Io { blob_id, .. } => blob_id.as_ref(),
            Self::InvalidArgument { .. } => None,
        }
    }
}

impl From<io::Error> for BlobStoreError {
    fn from(source: io::Error) -> Self {
        Self::Io {
            blob_id: None,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_blob_ids_are_unique() {
        let a = BlobId::generate(false);
        let b = BlobId::generate(false);
        assert_ne!(a, b);
        assert!(!a.is_direct_path());
        assert!(!a.is_temporary());
    }

    #[test]
    fn test_date_based_id_carries_date_prefix() {
        let id = BlobId::generate(true);
        let (date, rest) = id.get().split_once('.').unwrap();
        assert_eq!(date.len(), 8);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
        let (time, _uuid) = rest.split_once('.').unwrap();
        assert_eq!(time.len(), 4);
        assert!(time.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_direct_path_id_round_trips_name() {
        let id = BlobId::direct("foo/bar/baz.txt");
        assert!(id.is_direct_path());
        assert_eq!(id.direct_path_name(), Some("foo/bar/baz.txt"));
        assert_eq!(id.get(), "path$foo/bar/baz.txt");
    }

    #[test]
    fn test_temporary_id_prefix() {
        let id = BlobId::temporary();
        assert!(id.is_temporary());
        assert!(!id.is_direct_path());
    }

    #[test]
    fn test_error_kinds() {
        let err = BlobStoreError::NotFound(BlobId::new("x"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.blob_id().unwrap().get(), "x");

        let err = BlobStoreError::invalid("nope");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.blob_id().is_none());

        let err: BlobStoreError = io::Error::other("disk on fire").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
