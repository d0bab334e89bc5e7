//! Module for application configuration settings.
//!
//! User configurations may be specified in a TOML configuration file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn default_worker_count() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    64
}

fn default_requests_between_sweeps() -> u32 {
    1000
}

fn default_dupreq_retention_secs() -> u64 {
    60
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    /// Number of worker threads.
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Capacity of each worker's pending request queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How many requests a worker processes between maintenance sweeps of
    /// its pending queue and duplicate-request cache.
    #[serde(default = "default_requests_between_sweeps")]
    pub requests_between_sweeps: u32,

    /// How long a stored duplicate-request reply is retained, in seconds.
    #[serde(default = "default_dupreq_retention_secs")]
    pub dupreq_retention_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            requests_between_sweeps: default_requests_between_sweeps(),
            dupreq_retention_secs: default_dupreq_retention_secs(),
        }
    }
}

fn default_pool_entries() -> usize {
    4096
}

fn default_pool_parent_links() -> usize {
    8192
}

fn default_pool_dir_blocks() -> usize {
    1024
}

/// Sizing of the preallocated cache resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolConfig {
    /// Maximum number of live cache entries.
    #[serde(default = "default_pool_entries")]
    pub entries: usize,

    /// Maximum number of parent back-link records across all entries.
    #[serde(default = "default_pool_parent_links")]
    pub parent_links: usize,

    /// Maximum number of directory slot blocks.
    #[serde(default = "default_pool_dir_blocks")]
    pub dir_blocks: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            entries: default_pool_entries(),
            parent_links: default_pool_parent_links(),
            dir_blocks: default_pool_dir_blocks(),
        }
    }
}

fn default_gc_max_concurrent() -> usize {
    2
}

fn default_gc_unused_age_secs() -> u64 {
    3600
}

/// Garbage collection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GcConfig {
    /// Upper bound on workers running a full-cache sweep at the same time.
    #[serde(default = "default_gc_max_concurrent")]
    pub max_concurrent: usize,

    /// Entries untouched for longer than this many seconds are reclaimed.
    #[serde(default = "default_gc_unused_age_secs")]
    pub unused_age_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_gc_max_concurrent(),
            unused_age_secs: default_gc_unused_age_secs(),
        }
    }
}

fn default_fd_retention_secs() -> u64 {
    30
}

/// Open file-descriptor retention for regular-file entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FdCacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Descriptors idle for longer than this many seconds are closed during
    /// entry revalidation.
    #[serde(default = "default_fd_retention_secs")]
    pub retention_secs: u64,
}

impl Default for FdCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_secs: default_fd_retention_secs(),
        }
    }
}

/// Access mode of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessType {
    ReadWrite,
    ReadOnly,
    /// Metadata operations only, and read-only at that.
    MetadataOnlyRo,
}

/// One exported filesystem tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportConfig {
    pub id: u16,
    pub name: String,
    pub access: AccessType,

    /// Client machine names allowed to use this export. `None` admits all.
    #[serde(default)]
    pub allowed_clients: Option<Vec<String>>,
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub gc: GcConfig,

    #[serde(default)]
    pub fd_cache: FdCacheConfig,

    #[serde(default)]
    pub exports: Vec<ExportConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers.count == 0 {
            errors.push("Worker count must be at least 1.".to_string());
        }

        if self.workers.queue_capacity == 0 {
            errors.push("Worker queue capacity must be at least 1.".to_string());
        }

        if self.gc.max_concurrent == 0 {
            errors.push("gc.max-concurrent must be at least 1.".to_string());
        } else if self.gc.max_concurrent > self.workers.count && self.workers.count > 0 {
            errors.push(format!(
                "gc.max-concurrent ({}) exceeds the worker count ({}).",
                self.gc.max_concurrent, self.workers.count
            ));
        }

        if self.pool.entries == 0 || self.pool.parent_links == 0 || self.pool.dir_blocks == 0 {
            errors.push("Pool class sizes must all be at least 1.".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for export in &self.exports {
            if !seen.insert(export.id) {
                errors.push(format!("Duplicate export id {}.", export.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Loads config from a single TOML file and validates it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config
            .validate()
            .map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    pub fn dupreq_retention(&self) -> Duration {
        Duration::from_secs(self.workers.dupreq_retention_secs)
    }

    pub fn gc_unused_age(&self) -> Duration {
        Duration::from_secs(self.gc.unused_age_secs)
    }

    pub fn fd_retention(&self) -> Duration {
        Duration::from_secs(self.fd_cache.retention_secs)
    }
}
