use std::hash::{DefaultHasher, Hash, Hasher};

use data_model::{
    BlobId, BlobStoreError, Headers, BLOB_NAME_HEADER, DIRECT_PATH_BLOB_HEADER,
    TEMPORARY_BLOB_HEADER,
};

/// Subdirectory of the content root holding direct-path blobs.
pub const DIRECT_PATH_ROOT: &str = "directpath";

/// Subdirectory of the content root holding temporary and in-flight files.
pub const TEMPORARY_ROOT: &str = "tmp";

const VOLUMES: u64 = 43;
const CHAPTERS: u64 = 47;

/// Pure mapping from [`BlobId`] to a path relative to the content root.
/// Deterministic and collision-free for valid ids; performs no I/O.
///
/// Generated ids land in hashed `vol-NN/chap-NN` buckets unless they carry
/// a date prefix, which maps to `yyyy/MM/dd/HH/mm` for time locality.
/// Direct-path ids map 1:1 to their logical path under `directpath/` after
/// traversal validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobIdLocationResolver {
    date_based: bool,
}

impl BlobIdLocationResolver {
    pub fn new(date_based: bool) -> Self {
        Self { date_based }
    }

    /// Mints or derives the id for a new blob from its headers.
    pub fn new_blob_id(&self, headers: &Headers) -> Result<BlobId, BlobStoreError> {
        if headers
            .get(DIRECT_PATH_BLOB_HEADER)
            .is_some_and(|v| v == "true")
        {
            let name = headers.get(BLOB_NAME_HEADER).ok_or_else(|| {
                BlobStoreError::invalid(format!("missing header: {}", BLOB_NAME_HEADER))
            })?;
            let normalized = validate_direct_path(name)?;
            return Ok(BlobId::direct(&normalized));
        }
        if headers.contains_key(TEMPORARY_BLOB_HEADER) {
            return Ok(BlobId::temporary());
        }
        Ok(BlobId::generate(self.date_based))
    }

    pub fn locate(&self, blob_id: &BlobId) -> Result<String, BlobStoreError> {
        if let Some(name) = blob_id.direct_path_name() {
            let normalized = validate_direct_path(name)?;
            return Ok(format!("{}/{}", DIRECT_PATH_ROOT, normalized));
        }
        if blob_id.is_temporary() {
            return Ok(self.temporary_location(blob_id));
        }
        if let Some(path) = date_path(blob_id.get()) {
            return Ok(path);
        }
        Ok(volume_chapter_path(blob_id.get()))
    }

    /// Places any id under the temporary root, for in-flight writes.
    pub fn temporary_location(&self, blob_id: &BlobId) -> String {
        format!("{}/{}", TEMPORARY_ROOT, sanitize(blob_id.get()))
    }
}

/// `yyyy/MM/dd/HH/mm/<id>` for ids minted with a `yyyyMMdd.HHmm.` prefix.
fn date_path(id: &str) -> Option<String> {
    let bytes = id.as_bytes();
    if bytes.len() < 14 || bytes[8] != b'.' || bytes[13] != b'.' {
        return None;
    }
    if !bytes[..8].iter().all(u8::is_ascii_digit) || !bytes[9..13].iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(format!(
        "{}/{}/{}/{}/{}/{}",
        &id[0..4],
        &id[4..6],
        &id[6..8],
        &id[9..11],
        &id[11..13],
        id
    ))
}

fn volume_chapter_path(id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    let hash = hasher.finish();
    let volume = hash % VOLUMES + 1;
    let chapter = (hash / VOLUMES) % CHAPTERS + 1;
    format!("vol-{:02}/chap-{:02}/{}", volume, chapter, id)
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Validates a caller-supplied logical path and returns it normalized.
/// Absolute paths, empty paths, and `..` segments that would escape the
/// content root are rejected before any I/O happens.
pub fn validate_direct_path(name: &str) -> Result<String, BlobStoreError> {
    let normalized = normalize(name)?;
    if normalized.is_empty() {
        return Err(BlobStoreError::invalid(format!(
            "invalid direct path: {:?}",
            name
        )));
    }
    Ok(normalized)
}

/// Same rules as [`validate_direct_path`] but an empty prefix is allowed,
/// meaning "everything under the direct-path root".
pub fn validate_direct_path_prefix(prefix: &str) -> Result<String, BlobStoreError> {
    normalize(prefix)
}

fn normalize(path: &str) -> Result<String, BlobStoreError> {
    if path.starts_with('/') {
        return Err(BlobStoreError::invalid(format!(
            "absolute paths are not allowed: {:?}",
            path
        )));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(BlobStoreError::invalid(format!(
                        "path escapes the content root: {:?}",
                        path
                    )));
                }
            }
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_direct_path_headers, mock_headers, mock_temporary_headers},
        ErrorKind,
    };

    use super::*;

    #[test]
    fn test_locate_is_deterministic() {
        let resolver = BlobIdLocationResolver::new(false);
        let id = BlobId::new("b8f14f4c-1a39-4f8a-9a2a-8d0e76985f2a");
        let a = resolver.locate(&id).unwrap();
        let b = resolver.locate(&id).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("vol-"), "{}", a);
        assert!(a.ends_with(id.get()), "{}", a);
    }

    #[test]
    fn test_volume_chapter_buckets_are_in_range() {
        let resolver = BlobIdLocationResolver::new(false);
        for _ in 0..100 {
            let location = resolver.locate(&BlobId::generate(false)).unwrap();
            let mut parts = location.split('/');
            let vol: u64 = parts.next().unwrap().strip_prefix("vol-").unwrap().parse().unwrap();
            let chap: u64 = parts
                .next()
                .unwrap()
                .strip_prefix("chap-")
                .unwrap()
                .parse()
                .unwrap();
            assert!((1..=VOLUMES).contains(&vol));
            assert!((1..=CHAPTERS).contains(&chap));
        }
    }

    #[test]
    fn test_date_prefixed_ids_resolve_to_date_paths() {
        let resolver = BlobIdLocationResolver::new(true);
        let id = BlobId::new("20260804.1415.b8f14f4c-1a39-4f8a-9a2a-8d0e76985f2a");
        assert_eq!(
            resolver.locate(&id).unwrap(),
            "2026/08/04/14/15/20260804.1415.b8f14f4c-1a39-4f8a-9a2a-8d0e76985f2a"
        );

        let minted = BlobId::generate(true);
        let location = resolver.locate(&minted).unwrap();
        assert_eq!(location.matches('/').count(), 5, "{}", location);
    }

    #[test]
    fn test_direct_path_ids_map_under_direct_root() {
        let resolver = BlobIdLocationResolver::default();
        let id = BlobId::direct("org/foo/index.json");
        assert_eq!(
            resolver.locate(&id).unwrap(),
            "directpath/org/foo/index.json"
        );
    }

    #[test]
    fn test_traversal_escapes_are_rejected() {
        let resolver = BlobIdLocationResolver::default();
        for bad in ["../x", "a/../../x", "/etc/passwd", "..", ""] {
            let err = resolver.locate(&BlobId::direct(bad)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{:?}", bad);
        }
        // `..` segments that stay inside the root are fine
        assert_eq!(
            resolver.locate(&BlobId::direct("a/b/../c")).unwrap(),
            "directpath/a/c"
        );
    }

    #[test]
    fn test_prefix_validation_allows_empty() {
        assert_eq!(validate_direct_path_prefix("").unwrap(), "");
        assert_eq!(validate_direct_path_prefix("org/foo").unwrap(), "org/foo");
        assert!(validate_direct_path_prefix("../x").is_err());
    }

    #[test]
    fn test_new_blob_id_from_headers() {
        let resolver = BlobIdLocationResolver::new(false);
        let direct = resolver
            .new_blob_id(&mock_direct_path_headers("org/foo/index.json"))
            .unwrap();
        assert!(direct.is_direct_path());
        assert_eq!(direct.direct_path_name(), Some("org/foo/index.json"));

        let temp = resolver
            .new_blob_id(&mock_temporary_headers("upload.part"))
            .unwrap();
        assert!(temp.is_temporary());

        let generated = resolver.new_blob_id(&mock_headers("a.bin")).unwrap();
        assert!(!generated.is_direct_path());
        assert!(!generated.is_temporary());
    }

    #[test]
    fn test_temporary_ids_land_under_tmp() {
        let resolver = BlobIdLocationResolver::default();
        let id = BlobId::temporary();
        let location = resolver.locate(&id).unwrap();
        assert!(location.starts_with("tmp/"), "{}", location);
        assert!(!location.contains('$'), "{}", location);
    }
}
