use std::{collections::HashMap, io, path::Path};

use blobstore_utils::get_epoch_time_in_ms;
use data_model::{BlobMetrics, Headers};
use tokio::fs;
use tracing::warn;

const HEADER_PREFIX: &str = "@";
const CREATION_TIME_KEY: &str = "creationTime";
const SIZE_KEY: &str = "size";
const SHA1_KEY: &str = "sha1";
const SHA256_KEY: &str = "sha256";
const DELETED_KEY: &str = "deleted";
const DELETED_REASON_KEY: &str = "deletedReason";
const DELETED_DATETIME_KEY: &str = "deletedDateTime";

/// The key/value sidecar persisted next to every content file. Holds the
/// caller headers (prefixed with `@`), the trust-on-write metrics, and the
/// soft-delete marker fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAttributes {
    pub headers: Headers,
    pub metrics: BlobMetrics,
    pub deleted: bool,
    pub deleted_reason: Option<String>,
    pub deleted_date_time_ms: Option<u64>,
}

impl BlobAttributes {
    pub fn new(headers: Headers, metrics: BlobMetrics) -> Self {
        Self {
            headers,
            metrics,
            deleted: false,
            deleted_reason: None,
            deleted_date_time_ms: None,
        }
    }

    /// Loads attributes from `path`. A missing, empty, unreadable, or
    /// truncated file yields `None`: that is the documented soft-delete
    /// marker, so read paths treat the blob as absent rather than failing.
    pub async fn load(path: &Path) -> Option<BlobAttributes> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), "unreadable blob attributes: {err}");
                return None;
            }
        };
        if raw.trim().is_empty() {
            return None;
        }
        let properties = match parse_properties(&raw) {
            Some(properties) => properties,
            None => {
                warn!(path = %path.display(), "corrupt blob attributes");
                return None;
            }
        };
        Self::from_properties(properties)
    }

    fn from_properties(mut properties: HashMap<String, String>) -> Option<BlobAttributes> {
        let creation_time_ms = properties.remove(CREATION_TIME_KEY)?.parse().ok()?;
        let content_size = properties.remove(SIZE_KEY)?.parse().ok()?;
        let sha1 = properties.remove(SHA1_KEY)?;
        let sha256 = properties.remove(SHA256_KEY);
        let deleted = properties
            .remove(DELETED_KEY)
            .is_some_and(|v| v == "true");
        let deleted_reason = properties.remove(DELETED_REASON_KEY);
        let deleted_date_time_ms = properties
            .remove(DELETED_DATETIME_KEY)
            .and_then(|v| v.parse().ok());
        let headers = properties
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(HEADER_PREFIX)
                    .map(|header| (header.to_string(), value))
            })
            .collect();
        Some(BlobAttributes {
            headers,
            metrics: BlobMetrics {
                creation_time_ms,
                sha1,
                sha256,
                content_size,
            },
            deleted,
            deleted_reason,
            deleted_date_time_ms,
        })
    }

    pub async fn store(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, self.render()).await
    }

    pub fn set_deleted(&mut self, reason: &str) {
        self.deleted = true;
        self.deleted_reason = Some(reason.to_string());
        self.deleted_date_time_ms = Some(get_epoch_time_in_ms());
    }

    fn render(&self) -> String {
        let mut pairs: Vec<(String, String)> = vec![
            (
                CREATION_TIME_KEY.to_string(),
                self.metrics.creation_time_ms.to_string(),
            ),
            (SIZE_KEY.to_string(), self.metrics.content_size.to_string()),
            (SHA1_KEY.to_string(), self.metrics.sha1.clone()),
        ];
        if let Some(sha256) = &self.metrics.sha256 {
            pairs.push((SHA256_KEY.to_string(), sha256.clone()));
        }
        if self.deleted {
            pairs.push((DELETED_KEY.to_string(), "true".to_string()));
            if let Some(reason) = &self.deleted_reason {
                pairs.push((DELETED_REASON_KEY.to_string(), reason.clone()));
            }
            if let Some(at) = self.deleted_date_time_ms {
                pairs.push((DELETED_DATETIME_KEY.to_string(), at.to_string()));
            }
        }
        let mut headers: Vec<_> = self.headers.iter().collect();
        headers.sort_by_key(|(key, _)| key.as_str());
        for (key, value) in headers {
            pairs.push((format!("{}{}", HEADER_PREFIX, key), value.clone()));
        }
        render_properties("blob attributes", &pairs)
    }
}

/// Parses a flat `key=value` properties document. Returns `None` when any
/// non-comment line is malformed, which callers treat as corruption.
pub(crate) fn parse_properties(raw: &str) -> Option<HashMap<String, String>> {
    let mut properties = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=')?;
        properties.insert(key.trim().to_string(), value.to_string());
    }
    Some(properties)
}

pub(crate) fn render_properties(comment: &str, pairs: &[(String, String)]) -> String {
    let mut out = format!("#{}\n", comment);
    for (key, value) in pairs {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}
