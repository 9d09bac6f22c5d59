//! Ledger configuration.

use serde::{Deserialize, Serialize};

/// Default byte budget of the program cache.
pub const DEFAULT_PROGRAM_CACHE_MAX_COST: u64 = 64 * 1024 * 1024;

/// Default upper bound on logs coalesced into one write.
pub const DEFAULT_LOG_BATCH_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerConfig {
    /// Accept transactions dated before the last committed one.
    pub allow_past_timestamps: bool,
    /// Byte budget of the compiled program cache.
    pub program_cache_max_cost: u64,
    /// Maximum number of logs the write-back task persists in one storage call.
    pub log_batch_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            allow_past_timestamps: false,
            program_cache_max_cost: DEFAULT_PROGRAM_CACHE_MAX_COST,
            log_batch_size: DEFAULT_LOG_BATCH_SIZE,
        }
    }
}

impl LedgerConfig {
    pub fn with_past_timestamps(mut self, allow: bool) -> Self {
        self.allow_past_timestamps = allow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: LedgerConfig = serde_json::from_str(r#"{"allowPastTimestamps": true}"#).unwrap();
        assert!(config.allow_past_timestamps);
        assert_eq!(config.program_cache_max_cost, DEFAULT_PROGRAM_CACHE_MAX_COST);
        assert_eq!(config.log_batch_size, DEFAULT_LOG_BATCH_SIZE);
    }
}
