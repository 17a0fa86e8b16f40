use data_model::BlobStoreMetrics;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// Violated when the store's total content size exceeds the limit.
    SpaceUsed,
    /// Violated when the disk holding the content root has less than the
    /// limit remaining.
    SpaceRemaining,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaConfig {
    pub kind: QuotaKind,
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCheckResult {
    pub violation: bool,
    pub message: String,
}

/// Evaluates a store's aggregate metrics against its configured quota.
/// Advisory only: violations are reported to the caller (and logged by the
/// periodic job), never enforced by blocking writes.
pub struct BlobStoreQuotaService;

impl BlobStoreQuotaService {
    pub fn check(
        store_name: &str,
        metrics: &BlobStoreMetrics,
        config: &QuotaConfig,
    ) -> QuotaCheckResult {
        match config.kind {
            QuotaKind::SpaceUsed => {
                let violation = metrics.total_size > config.limit_bytes;
                QuotaCheckResult {
                    violation,
                    message: format!(
                        "blob store {} is using {} bytes of its {} byte space-used quota",
                        store_name, metrics.total_size, config.limit_bytes
                    ),
                }
            }
            QuotaKind::SpaceRemaining => {
                let violation = !metrics.unlimited && metrics.available_space < config.limit_bytes;
                QuotaCheckResult {
                    violation,
                    message: format!(
                        "blob store {} has {} bytes remaining, quota requires at least {}",
                        store_name, metrics.available_space, config.limit_bytes
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(total_size: u64, available_space: u64) -> BlobStoreMetrics {
        BlobStoreMetrics {
            blob_count: 1,
            total_size,
            available_space,
            unlimited: false,
        }
    }

    #[test]
    fn test_space_used_quota() {
        let config = QuotaConfig {
            kind: QuotaKind::SpaceUsed,
            limit_bytes: 1000,
        };
        assert!(!BlobStoreQuotaService::check("s", &metrics(1000, 0), &config).violation);
        assert!(BlobStoreQuotaService::check("s", &metrics(1001, 0), &config).violation);
    }

    #[test]
    fn test_space_remaining_quota() {
        let config = QuotaConfig {
            kind: QuotaKind::SpaceRemaining,
            limit_bytes: 4096,
        };
        assert!(!BlobStoreQuotaService::check("s", &metrics(0, 8192), &config).violation);
        assert!(BlobStoreQuotaService::check("s", &metrics(0, 100), &config).violation);
    }

    #[test]
    fn test_unlimited_disk_never_violates_space_remaining() {
        let config = QuotaConfig {
            kind: QuotaKind::SpaceRemaining,
            limit_bytes: u64::MAX,
        };
        let mut m = metrics(0, 0);
        m.unlimited = true;
        assert!(!BlobStoreQuotaService::check("s", &m, &config).violation);
    }
}
