//! Snapshot engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on concurrently buffered bytes inside the I/O scheduler.
pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 1024 * 1024 * 1024; // 1GiB

/// Default maximum size of a single tensor chunk.
pub const DEFAULT_MAX_CHUNK_SIZE_BYTES: u64 = 512 * 1024 * 1024; // 512MiB

/// Write requests below this size are eligible for batching.
pub const DEFAULT_BATCH_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024; // 4MiB

/// Snapshot engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Cap on concurrently buffered bytes inside the I/O scheduler
    pub memory_budget_bytes: u64,

    /// Maximum byte size of a single tensor chunk
    pub max_chunk_size_bytes: u64,

    /// Coalesce many small I/O requests into fewer larger ones
    pub enable_batching: bool,

    /// Write requests below this size are eligible for batching
    pub batch_threshold_bytes: u64,

    /// Timeout for the store-based commit barrier
    #[serde(with = "duration_ms")]
    pub barrier_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            max_chunk_size_bytes: DEFAULT_MAX_CHUNK_SIZE_BYTES,
            enable_batching: false,
            batch_threshold_bytes: DEFAULT_BATCH_THRESHOLD_BYTES,
            barrier_timeout: Duration::from_secs(1800),
        }
    }
}

impl SnapshotConfig {
    /// Build a config from defaults with environment overrides applied.
    ///
    /// Recognized variables:
    /// - `SNAPSHOT_MEMORY_BUDGET_BYTES`
    /// - `SNAPSHOT_MAX_CHUNK_SIZE_BYTES`
    /// - `SNAPSHOT_ENABLE_BATCHING` (set to any value to enable)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(bytes) = env_u64("SNAPSHOT_MEMORY_BUDGET_BYTES") {
            config.memory_budget_bytes = bytes;
        }
        if let Some(bytes) = env_u64("SNAPSHOT_MAX_CHUNK_SIZE_BYTES") {
            config.max_chunk_size_bytes = bytes;
        }
        if std::env::var_os("SNAPSHOT_ENABLE_BATCHING").is_some() {
            config.enable_batching = true;
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Duration serialization helper (milliseconds)
mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
