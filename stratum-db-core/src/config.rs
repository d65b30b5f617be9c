//! Store and connection configuration.

use crate::error::{Error, Result};
use crate::isolation::IsolationLevel;
use serde::{Deserialize, Serialize};

/// Initial wait before the first abandoned-resource sweep, in milliseconds
pub const INITIAL_LEAK_COLLECTION_INTERVAL_MS: u64 = 10_000;

/// Ceiling for the doubling sweep interval, in milliseconds
pub const MAX_LEAK_COLLECTION_INTERVAL_MS: u64 = 90 * 60 * 1000;

/// Configuration recognized by the transactional core.
///
/// `supported_isolation_levels` left empty defers to the backing store's
/// declared set; a non-empty value restricts it further.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Isolation used when `begin()` names no level
    pub default_isolation_level: IsolationLevel,
    /// Subset used to clamp user requests (empty: defer to the store)
    pub supported_isolation_levels: Vec<IsolationLevel>,
    /// Buffered-statement threshold before an update auto-flushes
    pub auto_flush_block_size: usize,
    /// Record the creation site of each iteration for leak diagnosis
    pub track_resource_sites: bool,
    /// Initial wait before sweeping abandoned resources; doubles up to a
    /// ceiling
    pub leak_collection_interval_ms: u64,
    /// Per-operation execution budget in milliseconds (0: unlimited)
    pub max_execution_time_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            default_isolation_level: IsolationLevel::ReadCommitted,
            supported_isolation_levels: Vec::new(),
            auto_flush_block_size: 1000,
            track_resource_sites: false,
            leak_collection_interval_ms: INITIAL_LEAK_COLLECTION_INTERVAL_MS,
            max_execution_time_ms: 0,
        }
    }
}

impl StoreConfig {
    /// Validate field constraints
    pub fn validate(&self) -> Result<()> {
        if self.auto_flush_block_size == 0 {
            return Err(Error::store("auto_flush_block_size must be positive"));
        }
        if self.leak_collection_interval_ms == 0 {
            return Err(Error::store("leak_collection_interval_ms must be positive"));
        }
        Ok(())
    }
}
