use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::quota::QuotaConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    pub name: String,
    pub data_dir: String,
    /// Lay generated blobs out by creation date instead of hashed
    /// volume/chapter buckets.
    pub date_based_layout: bool,
    pub metrics_flush_interval_secs: u64,
    pub compaction_interval_secs: u64,
    pub quota_check_interval_secs: u64,
    pub quota: Option<QuotaConfig>,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        let data_dir = env::current_dir().unwrap().join("blobstore_storage");
        BlobStoreConfig {
            name: "default".to_string(),
            data_dir: data_dir.to_str().unwrap().to_string(),
            date_based_layout: false,
            metrics_flush_interval_secs: 2,
            compaction_interval_secs: 3600,
            quota_check_interval_secs: 300,
            quota: None,
        }
    }
}

impl BlobStoreConfig {
    pub fn from_path(path: &str) -> Result<BlobStoreConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: BlobStoreConfig = Figment::new()
            .merge(Serialized::defaults(BlobStoreConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(anyhow::anyhow!("blob store name cannot be empty"));
        }
        if self.name.contains(['|', '/']) {
            return Err(anyhow::anyhow!(
                "invalid blob store name: {}",
                self.name
            ));
        }
        if self.data_dir.is_empty() {
            return Err(anyhow::anyhow!("data_dir cannot be empty"));
        }
        if self.metrics_flush_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "metrics_flush_interval_secs must be greater than zero"
            ));
        }
        if self.compaction_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "compaction_interval_secs must be greater than zero"
            ));
        }
        if let Some(quota) = &self.quota {
            if quota.limit_bytes == 0 {
                return Err(anyhow::anyhow!("quota limit_bytes must be greater than zero"));
            }
        }
        Ok(())
    }
}

/// Resolves the on-disk directories of a logical store from the configured
/// data directory.
#[derive(Debug, Clone)]
pub struct ApplicationDirectories {
    data_dir: PathBuf,
}

impl ApplicationDirectories {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn from_config(config: &BlobStoreConfig) -> Self {
        Self::new(&config.data_dir)
    }

    pub fn work_directory(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// The bookkeeping root of a named blob store: `<data_dir>/blobs/<name>`.
    pub fn blob_store_dir(&self, store_name: &str) -> PathBuf {
        self.work_directory("blobs").join(store_name)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaKind;

    #[test]
    fn test_defaults_validate() {
        BlobStoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_path_merges_over_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("blobstore.yaml");
        std::fs::write(
            &config_path,
            "name: artifacts\ndata_dir: /var/lib/blobstore\ndate_based_layout: true\nquota:\n  kind: space_used\n  limit_bytes: 1048576\n",
        )
        .unwrap();

        let config = BlobStoreConfig::from_path(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.name, "artifacts");
        assert_eq!(config.data_dir, "/var/lib/blobstore");
        assert!(config.date_based_layout);
        assert_eq!(config.metrics_flush_interval_secs, 2);
        let quota = config.quota.unwrap();
        assert_eq!(quota.kind, QuotaKind::SpaceUsed);
        assert_eq!(quota.limit_bytes, 1_048_576);
    }

    #[test]
    fn test_serialized_config_round_trips() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("blobstore.yaml");
        let config = BlobStoreConfig {
            name: "ci".to_string(),
            date_based_layout: true,
            compaction_interval_secs: 60,
            ..Default::default()
        };
        std::fs::write(&config_path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = BlobStoreConfig::from_path(config_path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.name, config.name);
        assert_eq!(loaded.date_based_layout, config.date_based_layout);
        assert_eq!(loaded.compaction_interval_secs, 60);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut config = BlobStoreConfig {
            name: "a|b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.name = "".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blob_store_dir_layout() {
        let dirs = ApplicationDirectories::new("/srv/data");
        assert_eq!(
            dirs.blob_store_dir("artifacts"),
            PathBuf::from("/srv/data/blobs/artifacts")
        );
    }
}
