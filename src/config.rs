//! Configuration types for cellstore.
//!
//! The [`Config`] struct controls instance-wide behavior:
//! - hot-index truncation dimension for two-phase vector search
//! - default saga retry policy
//! - default lock duration/timeout
//! - default migration policy
//!
//! # Example
//! ```rust
//! use cellstore::{Config, HotDimension};
//!
//! // Use defaults (D128 hot dimension)
//! let config = Config::default();
//!
//! // Customize for production
//! let config = Config {
//!     hot_dimension: HotDimension::D256,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::error::ValidationError;
use crate::migration::MigrationPolicy;
use crate::saga::{LockOptions, RetryPolicy};
use crate::vector::HotDimension;

/// Instance configuration.
///
/// All fields have sensible defaults. Use struct update syntax to
/// override specific settings.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// MRL truncation dimension for the hot vector index.
    ///
    /// Fixed per instance; changing it requires rebuilding the index.
    pub hot_dimension: HotDimension,

    /// Default retry policy for saga steps without an override.
    pub saga_retry: RetryPolicy,

    /// Default lock acquisition options.
    pub lock_defaults: LockOptions,

    /// Default storage-tier migration policy.
    pub migration: MigrationPolicy,
}

impl Config {
    /// Creates a Config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration.
    ///
    /// Called automatically by `Instance::open()`. You can also call
    /// this explicitly to check configuration ahead of time.
    ///
    /// # Errors
    /// Returns `ValidationError` if:
    /// - `saga_retry.max_attempts` is 0
    /// - `saga_retry.jitter` is outside `[0, 1]`
    /// - the migration policy fails its own validation
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.saga_retry.max_attempts == 0 {
            return Err(ValidationError::invalid_field(
                "saga_retry.max_attempts",
                "must be at least 1",
            )
            .into());
        }
        if !(0.0..=1.0).contains(&self.saga_retry.jitter) {
            return Err(ValidationError::invalid_field(
                "saga_retry.jitter",
                "must be between 0 and 1",
            )
            .into());
        }
        self.migration.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.hot_dimension, HotDimension::D128);
        assert_eq!(config.lock_defaults.duration_ms, 30_000);
        assert_eq!(config.lock_defaults.timeout_ms, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = Config {
            saga_retry: RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_jitter_out_of_range_rejected() {
        let config = Config {
            saga_retry: RetryPolicy {
                jitter: 1.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_migration_policy_rejected() {
        let mut config = Config::default();
        config.migration.hot_to_warm.max_hot_size_percent = 500.0;
        assert!(config.validate().is_err());
    }
}
