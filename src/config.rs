//! Configuration for the caching core
//!
//! Each component carries its own config struct with documented fields and
//! conservative defaults. Configs are plain serde types so a host can load
//! them from whatever source it already uses.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheOpResult};

/// Cascade engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// How long a coalesced waiter blocks on another caller's factory run
    /// before giving up (milliseconds)
    pub coalescing_timeout_ms: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            coalescing_timeout_ms: 30_000,
        }
    }
}

/// Rotating bloom filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomConfig {
    /// Expected number of distinct keys per slot window
    pub estimated_items: u64,
    /// Target false positive rate, in (0, 1)
    pub false_positive_rate: f64,
    /// Number of independent slots; a key survives at least
    /// `slot_count - 1` rotations
    pub slot_count: u16,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            estimated_items: 1_000_000,
            false_positive_rate: 0.001,
            slot_count: 4,
        }
    }
}

impl BloomConfig {
    /// Reject out-of-range parameters before any bitmap is allocated.
    pub fn validate(&self) -> CacheOpResult<()> {
        if self.estimated_items == 0 {
            return Err(CacheError::InvalidConfig(
                "bloom estimated_items must be positive".into(),
            ));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(CacheError::InvalidConfig(format!(
                "bloom false_positive_rate must be in (0, 1), got {}",
                self.false_positive_rate
            )));
        }
        if self.slot_count < 1 {
            return Err(CacheError::InvalidConfig(
                "bloom slot_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Upload queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadQueueConfig {
    /// Byte budget for buffered pending stores
    pub max_bytes: u64,
    /// How long shutdown waits for in-flight stores (milliseconds)
    pub shutdown_grace_ms: u64,
}

impl Default for UploadQueueConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024, // 256 MB
            shutdown_grace_ms: 2_000,
        }
    }
}

/// Non-overlapping runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Hard timeout on the underlying task, independent of callers
    /// (milliseconds)
    pub task_timeout_ms: u64,
    /// A result younger than this is returned without re-running the task
    /// (milliseconds); zero disables reuse
    pub reuse_result_within_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: 60_000,
            reuse_result_within_ms: 0,
        }
    }
}

/// In-memory tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCacheConfig {
    /// Maximum number of resident entries
    pub max_entries: usize,
    /// Total byte budget across resident entries
    pub max_bytes: u64,
    /// Entries larger than this are never admitted
    pub max_entry_bytes: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 512 * 1024 * 1024,     // 512 MB
            max_entry_bytes: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Disk cache engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCacheConfig {
    /// Root directory for artifact files
    pub root: PathBuf,
    /// Directory for metadata shard logs; defaults to `{root}/meta`
    pub meta_root: Option<PathBuf>,
    /// Total byte budget for cached files
    pub max_cache_bytes: u64,
    /// Number of independent metadata shards
    pub shards: u32,
    /// First-level directory fan-out; rounded up to a power of 16
    pub subfolders: u32,
    /// Default file extension for cached artifacts
    pub file_extension: String,
    /// Eviction grace period: entries younger than this are never victims
    /// (seconds)
    pub min_age_to_delete_secs: u64,
    /// A failed file delete is not retried before this has elapsed (seconds)
    pub retry_deletion_after_secs: u64,
    /// Each eviction batch frees at least this many bytes
    pub min_cleanup_bytes: u64,
    /// Background cleanup evicts down to this level; defaults to 90% of
    /// `max_cache_bytes` when absent
    pub soft_watermark_bytes: Option<u64>,
    /// Slots in the in-memory access counter; rounded up to a power of two
    pub access_counter_slots: u32,
    /// Entries larger than this are not replicated to disk
    pub max_entry_bytes: Option<u64>,
    /// Cadence of the background cleanup and self-test pass (seconds)
    pub cleanup_interval_secs: u64,
    /// Per-key write lock acquisition budget (milliseconds)
    pub lock_timeout_ms: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".cache/blobs"),
            meta_root: None,
            max_cache_bytes: 8 * 1024 * 1024 * 1024, // 8 GB
            shards: 8,
            subfolders: 4096,
            file_extension: "blob".into(),
            min_age_to_delete_secs: 60,
            retry_deletion_after_secs: 300,
            min_cleanup_bytes: 4 * 1024 * 1024, // 4 MB per batch
            soft_watermark_bytes: None,
            access_counter_slots: 1 << 16,
            max_entry_bytes: None,
            cleanup_interval_secs: 60,
            lock_timeout_ms: 10_000,
        }
    }
}

impl DiskCacheConfig {
    /// Effective metadata directory.
    pub fn meta_dir(&self) -> PathBuf {
        self.meta_root
            .clone()
            .unwrap_or_else(|| self.root.join("meta"))
    }

    /// Effective soft watermark for background cleanup.
    pub fn soft_watermark(&self) -> u64 {
        self.soft_watermark_bytes
            .unwrap_or(self.max_cache_bytes / 10 * 9)
    }

    /// Reject configurations the engine cannot mount.
    pub fn validate(&self) -> CacheOpResult<()> {
        if self.shards == 0 {
            return Err(CacheError::InvalidConfig(
                "disk cache needs at least one shard".into(),
            ));
        }
        if self.max_cache_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "disk cache byte budget must be positive".into(),
            ));
        }
        if self.subfolders == 0 {
            return Err(CacheError::InvalidConfig(
                "disk cache subfolder fan-out must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_config_rejects_bad_rates() {
        let mut config = BloomConfig::default();
        config.false_positive_rate = 0.0;
        assert!(config.validate().is_err());
        config.false_positive_rate = 1.0;
        assert!(config.validate().is_err());
        config.false_positive_rate = 0.01;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bloom_config_rejects_zero_items() {
        let mut config = BloomConfig::default();
        config.estimated_items = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disk_config_defaults_are_mountable() {
        let config = DiskCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.meta_dir(), PathBuf::from(".cache/blobs/meta"));
        assert!(config.soft_watermark() < config.max_cache_bytes);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = DiskCacheConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: DiskCacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shards, config.shards);
        assert_eq!(back.max_cache_bytes, config.max_cache_bytes);
    }
}
