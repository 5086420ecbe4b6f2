//! Store configuration with durability and housekeeping tuning options.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{path::PathBuf, time::Duration};

use crate::error::{Result, StoreError};

/// Configuration for the persistent message store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root data directory; segment files live under `<dir>/snapshot/`.
    pub dir: PathBuf,

    /// Soft capacity across all index shards (each shard holds `maxcap / 16`).
    pub max_capacity: usize,

    /// Cadence of the background segment evictor.
    #[serde(with = "duration_millis")]
    pub check_period: Duration,

    /// Byte threshold at which the active segment is rolled.
    pub max_segment_size: u64,

    /// Maximum chunks accumulated per flush batch.
    pub batch_size: usize,

    /// Maximum number of opened segments kept cached.
    pub segcache_size: usize,

    /// Maximum time a non-empty flush batch may wait before it is forced out.
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            max_capacity: 100_000,
            check_period: Duration::from_secs(60),
            max_segment_size: 64 * 1024 * 1024, // 64MB
            batch_size: 100,
            segcache_size: 10,
            flush_interval: Duration::from_millis(500),
        }
    }
}

impl StoreConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns [`StoreError::Configuration`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_capacity == 0 {
            return Err(StoreError::Configuration(
                "max_capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_segment_size == 0 {
            return Err(StoreError::Configuration(
                "max_segment_size must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(StoreError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.segcache_size == 0 {
            return Err(StoreError::Configuration(
                "segcache_size must be greater than 0".to_string(),
            ));
        }
        if self.check_period.is_zero() {
            return Err(StoreError::Configuration(
                "check_period must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(StoreError::Configuration(
                "flush_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serialize/deserialize Duration as milliseconds
mod duration_millis {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = <u64 as Deserialize>::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
