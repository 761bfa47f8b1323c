use pledged_store::StoreOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Core server configuration. Unknown-but-wrong values fail validation as
/// user input errors; out-of-range values with safe interpretations (the
/// hash index budget) are clamped instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Filesystem path for the log device; empty means a temp-backed store
    /// unlinked on teardown.
    pub path: String,
    /// Pre-size the log device.
    pub preallocate: bool,
    /// Unlink backing files on teardown.
    pub delete_on_dispose: bool,
    /// Entries in the in-memory hash index, clamped to `[256, 2^40]`.
    pub hash_index_size: i64,
    /// Idle queue lifetime in milliseconds.
    pub expiry_ticks: u64,
    /// Granularity of the shared expiry timer.
    pub expiry_bucket_count: u32,
    /// Number of priority classes; must be positive.
    pub count_priorities: u32,
    /// Service id stamped into every minted promise id.
    pub service_id: u32,
    /// Parallel worker executions.
    pub worker_count: usize,
    /// Capacity of the dispatcher→worker channel.
    pub dispatch_buffer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            preallocate: false,
            delete_on_dispose: false,
            hash_index_size: 1 << 20,
            expiry_ticks: 60_000,
            expiry_bucket_count: 20,
            count_priorities: 3,
            service_id: 1,
            worker_count: 4,
            dispatch_buffer: 64,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count_priorities == 0 {
            return Err(ConfigError::Invalid(
                "count_priorities must be positive".into(),
            ));
        }
        if self.expiry_ticks == 0 {
            return Err(ConfigError::Invalid("expiry_ticks must be positive".into()));
        }
        if self.expiry_bucket_count == 0 {
            return Err(ConfigError::Invalid(
                "expiry_bucket_count must be positive".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be positive".into()));
        }
        if self.dispatch_buffer == 0 {
            return Err(ConfigError::Invalid(
                "dispatch_buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            path: self.path.clone(),
            preallocate: self.preallocate,
            delete_on_dispose: self.delete_on_dispose,
            hash_index_size: self.hash_index_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_priorities_is_invalid() {
        let config = CoreConfig {
            count_priorities: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn serde_roundtrip_with_partial_input() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"count_priorities": 2, "path": "/tmp/pledged"}"#).unwrap();
        assert_eq!(config.count_priorities, 2);
        assert_eq!(config.path, "/tmp/pledged");
        assert_eq!(config.worker_count, CoreConfig::default().worker_count);
    }

    #[test]
    fn store_options_carry_the_kv_fields() {
        let config = CoreConfig {
            path: "x".into(),
            hash_index_size: 1,
            delete_on_dispose: true,
            ..Default::default()
        };
        let options = config.store_options();
        assert_eq!(options.path, "x");
        assert!(options.delete_on_dispose);
        assert_eq!(options.clamped_hash_index_size(), 256);
    }
}
