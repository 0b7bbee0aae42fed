use std::path::PathBuf;
use std::time::Duration;

use keel_types::error::{KeelError, Result};
use serde::{Deserialize, Serialize};

use super::defaults::*;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeelConfig {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl KeelConfig {
    /// Config for `url` with every other field at its default.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            repository: RepositoryConfig { url: url.into() },
            catalog: CatalogConfig::default(),
            backup: BackupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.repository.url.trim().is_empty() {
            return Err(KeelError::Config("repository.url must not be empty".into()));
        }
        self.backup.validate()?;
        self.logging.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository URL: bare path, `file://` or `memory://`.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Where the local metadata catalog is persisted.
    #[serde(default = "default_catalog_path")]
    pub path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Skip building a synthetic filelist after an interrupted run.
    #[serde(default)]
    pub disable_synthetic_filelist: bool,
    /// Fixed block size used to split file content.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Target size of one Blocks volume before it is sealed and uploaded.
    #[serde(default = "default_volume_size")]
    pub volume_size: u64,
    /// Maximum number of volume uploads in flight.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Whether paths differing only in case are distinct.
    #[serde(default = "default_case_sensitive_paths")]
    pub case_sensitive_paths: bool,
    /// Threads reading and hashing files during a directory backup;
    /// 0 picks one per available core.
    #[serde(default)]
    pub scan_workers: usize,
    /// Hashed entries allowed to queue ahead of the packing thread.
    #[serde(default = "default_scan_readahead")]
    pub scan_readahead: usize,
    /// Local files embedded in every filelist volume.
    #[serde(default)]
    pub control_files: Vec<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            disable_synthetic_filelist: false,
            block_size: default_block_size(),
            volume_size: default_volume_size(),
            upload_concurrency: default_upload_concurrency(),
            case_sensitive_paths: default_case_sensitive_paths(),
            scan_workers: 0,
            scan_readahead: default_scan_readahead(),
            control_files: Vec::new(),
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(KeelError::Config("backup.block_size must be > 0".into()));
        }
        if self.volume_size < u64::from(self.block_size) {
            return Err(KeelError::Config(format!(
                "backup.volume_size ({}) must be >= backup.block_size ({})",
                self.volume_size, self.block_size
            )));
        }
        if self.upload_concurrency == 0 {
            return Err(KeelError::Config(
                "backup.upload_concurrency must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn effective_scan_workers(&self) -> usize {
        if self.scan_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            self.scan_workers
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log buffer capacity while nobody is watching.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Log buffer capacity while a subscription is live.
    #[serde(default = "default_active_buffer_capacity")]
    pub active_buffer_capacity: usize,
    /// How long a subscription stays live after its last renewal.
    #[serde(default = "default_subscription_timeout")]
    pub subscription_timeout: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            buffer_capacity: default_buffer_capacity(),
            active_buffer_capacity: default_active_buffer_capacity(),
            subscription_timeout: default_subscription_timeout(),
        }
    }
}

impl LoggingConfig {
    pub fn subscription_timeout_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.subscription_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(KeelError::Config(
                "logging.buffer_capacity must be > 0".into(),
            ));
        }
        if self.active_buffer_capacity < self.buffer_capacity {
            return Err(KeelError::Config(format!(
                "logging.active_buffer_capacity ({}) must be >= logging.buffer_capacity ({})",
                self.active_buffer_capacity, self.buffer_capacity
            )));
        }
        self.subscription_timeout_duration().map(|_| ())
    }
}
