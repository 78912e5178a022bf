//! Configuration types for the migration engine.

use std::time::Duration;

use crate::error::{Error, Result};

/// What to do when the placement table closes while streams are still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DltClosePolicy {
    /// Refuse the close with `NotReady`; the migration keeps running.
    #[default]
    Reject,
    /// Abort the outstanding work, acknowledge the pending caller with
    /// `Aborted`, and return to idle.
    ForceComplete,
}

/// Migration engine configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Whether migration is enabled. When disabled, `start_migration`
    /// acknowledges immediately without doing any work.
    pub enabled: bool,

    /// Placement table width: the table has `2^token_bit_width` tokens.
    pub token_bit_width: u32,

    /// Tokens per group: each group spans `2^group_bit_width` tokens.
    pub group_bit_width: u32,

    /// Maximum alternate-source attempts per token before its group is aborted.
    pub max_retries_per_token: u32,

    /// Maximum filter entries per filter-set message.
    pub filter_set_batch_size: usize,

    /// Maximum objects per delta-set message.
    pub delta_set_batch_size: usize,

    /// Silence from a source after which its executor fails with `Timeout`.
    pub source_timeout: Duration,

    /// Silence across the whole migration after which it is aborted.
    pub inactivity_timeout: Duration,

    /// How often the watchdog checks the two timeouts above.
    pub watchdog_interval: Duration,

    /// Relay attempts for a forwarded write before it is dropped.
    pub forward_retry_limit: u32,

    /// Delay between forwarded-write relay attempts.
    pub forward_retry_backoff: Duration,

    /// Placement close behavior while work is outstanding.
    pub dlt_close_policy: DltClosePolicy,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_bit_width: 12,  // 4096 tokens
            group_bit_width: 4,   // 16 tokens per group
            max_retries_per_token: 3,
            filter_set_batch_size: 1024,
            delta_set_batch_size: 1024,
            source_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(120),
            watchdog_interval: Duration::from_secs(1),
            forward_retry_limit: 5,
            forward_retry_backoff: Duration::from_millis(50),
            dlt_close_policy: DltClosePolicy::Reject,
        }
    }
}

impl MigrationConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration with migration turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the placement table width.
    pub fn with_token_bit_width(mut self, bits: u32) -> Self {
        self.token_bit_width = bits;
        self
    }

    /// Set the group width.
    pub fn with_group_bit_width(mut self, bits: u32) -> Self {
        self.group_bit_width = bits;
        self
    }

    /// Set the per-token retry limit.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries_per_token = retries;
        self
    }

    /// Set both filter-set and delta-set batch sizes.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.filter_set_batch_size = size;
        self.delta_set_batch_size = size;
        self
    }

    /// Set the per-source timeout.
    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    /// Set the global inactivity timeout.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Set the watchdog tick.
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Set the placement close policy.
    pub fn with_dlt_close_policy(mut self, policy: DltClosePolicy) -> Self {
        self.dlt_close_policy = policy;
        self
    }

    /// Number of tokens in the placement table.
    pub fn token_count(&self) -> usize {
        1usize << self.token_bit_width
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.token_bit_width == 0 || self.token_bit_width > 24 {
            return Err(Error::InvalidArgument(format!(
                "token_bit_width must be in 1..=24, got {}",
                self.token_bit_width
            )));
        }
        if self.group_bit_width > self.token_bit_width {
            return Err(Error::InvalidArgument(format!(
                "group_bit_width {} exceeds token_bit_width {}",
                self.group_bit_width, self.token_bit_width
            )));
        }
        if self.filter_set_batch_size == 0 || self.delta_set_batch_size == 0 {
            return Err(Error::InvalidArgument("batch sizes must be non-zero".to_string()));
        }
        if self.watchdog_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "watchdog_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MigrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.token_count(), 4096);
        assert_eq!(config.dlt_close_policy, DltClosePolicy::Reject);
    }

    #[test]
    fn test_builder() {
        let config = MigrationConfig::new()
            .with_token_bit_width(6)
            .with_group_bit_width(3)
            .with_batch_size(2)
            .with_dlt_close_policy(DltClosePolicy::ForceComplete);
        assert_eq!(config.token_count(), 64);
        assert_eq!(config.delta_set_batch_size, 2);
        assert_eq!(config.dlt_close_policy, DltClosePolicy::ForceComplete);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_widths() {
        let config = MigrationConfig::new()
            .with_token_bit_width(4)
            .with_group_bit_width(5);
        assert!(config.validate().is_err());
        assert!(!MigrationConfig::disabled().enabled);
    }
}
