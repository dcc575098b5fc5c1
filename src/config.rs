//! Configuration for the memory engine
//!
//! Sensible defaults, environment overrides, and a frozen on-disk copy. The
//! first successful init writes the resolved configuration to
//! `storage_path/config.json`; later opens of the same store load and use the
//! frozen file so operational knobs cannot drift under live data. Unknown
//! keys are rejected.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::errors::{MemoryError, Result};

/// Name of the frozen config file under the storage root.
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MindCacheConfig {
    /// Root directory for all persisted state.
    pub storage_path: PathBuf,

    /// Start the background decay scheduler on open.
    pub auto_decay_enabled: bool,

    /// Period of the background decay sweep, in hours.
    pub decay_interval_hours: u64,

    /// TTL applied to memories saved without an explicit expiry, in hours.
    pub default_memory_ttl_hours: u64,

    /// Compress record bodies above the threshold.
    pub enable_compression: bool,

    /// Per-user memory cap, enforced by eviction rather than write rejection.
    pub max_memories_per_user: usize,

    /// Importance cutoff for the low-importance decay sweep.
    pub importance_threshold: f32,

    /// Size at which the active segment seals and a new one opens.
    pub segment_roll_bytes: u64,

    /// Live-record fraction below which a sealed segment is compacted.
    pub compaction_threshold: f64,

    /// Bodies at or above this size are compressed (when enabled).
    pub compression_threshold_bytes: usize,

    /// A decay sweep that evicts at least this many records triggers
    /// compaction regardless of live fractions.
    pub compaction_min_evictions: u64,

    /// Period of the periodic index snapshot, in seconds.
    pub index_snapshot_interval_secs: u64,

    /// Flush period for batched access-metadata updates, in seconds.
    pub access_flush_interval_secs: u64,
}

impl Default for MindCacheConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./mindcache_data"),
            auto_decay_enabled: true,
            decay_interval_hours: 24,
            default_memory_ttl_hours: 720,
            enable_compression: true,
            max_memories_per_user: 10_000,
            importance_threshold: 0.3,
            segment_roll_bytes: 64 * 1024 * 1024,
            compaction_threshold: 0.5,
            compression_threshold_bytes: 1024,
            compaction_min_evictions: 1000,
            index_snapshot_interval_secs: 60,
            access_flush_interval_secs: 10,
        }
    }
}

impl MindCacheConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("MINDCACHE_STORAGE_PATH") {
            config.storage_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("MINDCACHE_AUTO_DECAY") {
            config.auto_decay_enabled = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("MINDCACHE_DECAY_INTERVAL_HOURS") {
            if let Ok(n) = val.parse() {
                config.decay_interval_hours = n;
            }
        }

        if let Ok(val) = env::var("MINDCACHE_DEFAULT_TTL_HOURS") {
            if let Ok(n) = val.parse() {
                config.default_memory_ttl_hours = n;
            }
        }

        if let Ok(val) = env::var("MINDCACHE_COMPRESSION") {
            config.enable_compression = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("MINDCACHE_MAX_MEMORIES_PER_USER") {
            if let Ok(n) = val.parse() {
                config.max_memories_per_user = n;
            }
        }

        if let Ok(val) = env::var("MINDCACHE_IMPORTANCE_THRESHOLD") {
            if let Ok(n) = val.parse::<f32>() {
                config.importance_threshold = n.clamp(0.0, 1.0);
            }
        }

        if let Ok(val) = env::var("MINDCACHE_SEGMENT_ROLL_BYTES") {
            if let Ok(n) = val.parse() {
                config.segment_roll_bytes = n;
            }
        }

        if let Ok(val) = env::var("MINDCACHE_COMPACTION_THRESHOLD") {
            if let Ok(n) = val.parse::<f64>() {
                config.compaction_threshold = n.clamp(0.0, 1.0);
            }
        }

        config
    }

    /// Validate ranges. Called once at engine open.
    pub fn validate(&self) -> Result<()> {
        if self.decay_interval_hours == 0 {
            return Err(MemoryError::invalid(
                "decay_interval_hours",
                "must be at least 1",
            ));
        }
        if self.default_memory_ttl_hours == 0 {
            return Err(MemoryError::invalid(
                "default_memory_ttl_hours",
                "must be at least 1",
            ));
        }
        if self.max_memories_per_user == 0 {
            return Err(MemoryError::invalid(
                "max_memories_per_user",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.importance_threshold) {
            return Err(MemoryError::invalid(
                "importance_threshold",
                "must be within [0.0, 1.0]",
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            return Err(MemoryError::invalid(
                "compaction_threshold",
                "must be within [0.0, 1.0]",
            ));
        }
        if self.segment_roll_bytes < 4096 {
            return Err(MemoryError::invalid(
                "segment_roll_bytes",
                "must be at least 4096",
            ));
        }
        Ok(())
    }

    /// Resolve the effective configuration for a storage root.
    ///
    /// The first init freezes the resolved config to `config.json`; later
    /// opens load the frozen file (rejecting unknown keys) and keep using it,
    /// with `storage_path` pinned to the directory actually opened.
    pub fn freeze(self, root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(CONFIG_FILE);

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let mut frozen: MindCacheConfig = serde_json::from_str(&raw).map_err(|e| {
                MemoryError::invalid(CONFIG_FILE, format!("frozen config rejected: {e}"))
            })?;
            frozen.storage_path = root.to_path_buf();
            frozen.validate()?;
            info!(path = %path.display(), "loaded frozen configuration");
            return Ok(frozen);
        }

        self.validate()?;
        let mut resolved = self;
        resolved.storage_path = root.to_path_buf();
        let raw = serde_json::to_string_pretty(&resolved)
            .map_err(|e| MemoryError::Internal(e.into()))?;
        std::fs::write(&path, raw)?;
        info!(path = %path.display(), "froze configuration at first init");
        Ok(resolved)
    }

    /// Log the effective configuration.
    pub fn log(&self) {
        info!("configuration:");
        info!("   storage: {}", self.storage_path.display());
        info!(
            "   decay: auto={} every {}h, default ttl {}h",
            self.auto_decay_enabled, self.decay_interval_hours, self.default_memory_ttl_hours
        );
        info!(
            "   caps: {} memories/user, importance threshold {:.2}",
            self.max_memories_per_user, self.importance_threshold
        );
        info!(
            "   segments: roll at {} bytes, compact below {:.2} live",
            self.segment_roll_bytes, self.compaction_threshold
        );
        info!(
            "   compression: {} (>= {} bytes)",
            self.enable_compression, self.compression_threshold_bytes
        );
    }
}
