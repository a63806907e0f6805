//! Mount configuration.
//!
//! Typed configuration structs that map to the YAML configuration file,
//! with loading, validation and defaults. Everything here is tunable per
//! bucket; the defaults are what a single-node mount of a remote bucket
//! wants.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level mount configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub cache: CacheConfig,
    pub flush: FlushConfig,
    pub read_ahead: ReadAheadConfig,
    pub listing: ListingConfig,
    pub gates: GateConfig,
    pub rename: RenameConfig,
    /// Present only for multi-node mounts.
    pub cluster: Option<ClusterConfig>,
}

/// Buffer-pool memory budget and spill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global memory budget for cached buffers, in MiB.
    pub memory_limit_mb: u64,
    /// Percentage of the budget at which new writes start blocking.
    pub high_watermark_percent: u8,
    /// Percentage to which the flusher drains before writes unblock.
    pub low_watermark_percent: u8,
    /// Directory for spilled dirty buffers. `None` disables spilling.
    pub spill_dir: Option<PathBuf>,
}

/// Flusher and multipart-upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Files at or above this size (MiB) upload via multipart.
    pub multipart_threshold_mb: u64,
    /// Target multipart part size (MiB). Clamped to backend capabilities.
    pub part_size_mb: u64,
    /// Number of flusher worker tasks.
    pub workers: usize,
    /// Maximum part uploads in flight per file.
    pub part_concurrency: usize,
    pub retry: RetryConfig,
}

/// Exponential backoff policy for transient backend errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Prefetcher window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadAheadConfig {
    /// Window after the first sequential hit, in KiB.
    pub initial_window_kb: u64,
    /// Ceiling the window doubles up to, in MiB.
    pub max_window_mb: u64,
    /// Size of each prefetch GET, in KiB.
    pub chunk_kb: u64,
}

/// Directory listing cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Seconds a completed listing stays fresh.
    pub ttl_secs: u64,
    /// Keys requested per listing page.
    pub page_size: usize,
}

/// Global request-parallelism gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Permits for small actions (head, list, delete, small put, copy).
    pub small_ops: usize,
    /// Permits for bulk actions (ranged gets, multipart parts).
    pub bulk_ops: usize,
}

/// Rename behaviour knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameConfig {
    /// Delete an existing destination object before copying over it.
    /// Needed only for backends whose copy is not idempotent.
    pub overwrite_predelete: bool,
}

/// Multi-node mount membership. Static per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Index of this node in `members`.
    pub node_id: u32,
    /// Listen/dial addresses of every member, in ownership order.
    pub members: Vec<String>,
}

impl MountConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MountConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Rejects configurations that cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.memory_limit_mb == 0 {
            anyhow::bail!("cache.memory_limit_mb must be positive");
        }
        if self.cache.high_watermark_percent > 100
            || self.cache.low_watermark_percent >= self.cache.high_watermark_percent
        {
            anyhow::bail!("cache watermarks must satisfy low < high <= 100");
        }
        if self.flush.part_size_mb == 0 || self.flush.workers == 0 {
            anyhow::bail!("flush.part_size_mb and flush.workers must be positive");
        }
        if self.flush.multipart_threshold_mb < self.flush.part_size_mb {
            anyhow::bail!("multipart threshold must be at least one part size");
        }
        if self.listing.page_size == 0 {
            anyhow::bail!("listing.page_size must be positive");
        }
        if let Some(cluster) = &self.cluster {
            if cluster.members.is_empty() {
                anyhow::bail!("cluster.members must not be empty");
            }
            if cluster.node_id as usize >= cluster.members.len() {
                anyhow::bail!("cluster.node_id out of range");
            }
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 512,
            high_watermark_percent: 90,
            low_watermark_percent: 60,
            spill_dir: None,
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            multipart_threshold_mb: 16,
            part_size_mb: 8,
            workers: 4,
            part_concurrency: 8,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            initial_window_kb: 256,
            max_window_mb: 8,
            chunk_kb: 512,
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            page_size: 1000,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            small_ops: 32,
            bulk_ops: 16,
        }
    }
}

impl Default for RenameConfig {
    fn default() -> Self {
        Self {
            overwrite_predelete: false,
        }
    }
}
