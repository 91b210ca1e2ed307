//! Sharing engine configuration and builder.

use metafuse_share_core::{Result, ShareError};
use metafuse_share_storage::LockRetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Default location of the share database.
pub const DEFAULT_DB_PATH: &str = "metafuse_shares.db";

/// Configuration for the share service and its background tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct SharingConfig {
    /// Path of the SQLite share database
    pub db_path: PathBuf,
    /// Dataset lock acquisition attempts (default: 10)
    pub lock_max_retries: u32,
    /// Wait after the first failed lock attempt (default: 60 seconds)
    pub lock_retry_interval: Duration,
    /// Upper bound for the backoff between lock attempts (default: 2 minutes)
    pub lock_retry_max_interval: Duration,
    /// Interval between verifier sweeps (default: 24 hours)
    pub verifier_interval: Duration,
    /// Interval between reapplier sweeps (default: 24 hours)
    pub reapplier_interval: Duration,
    /// Run a reapplier sweep right after each verifier sweep (default: true)
    pub reapply_after_verify: bool,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            lock_max_retries: 10,
            lock_retry_interval: Duration::from_secs(60),
            lock_retry_max_interval: Duration::from_secs(120),
            verifier_interval: Duration::from_secs(24 * 60 * 60),
            reapplier_interval: Duration::from_secs(24 * 60 * 60),
            reapply_after_verify: true,
        }
    }
}

impl SharingConfig {
    pub fn builder(db_path: impl Into<PathBuf>) -> SharingConfigBuilder {
        SharingConfigBuilder::new(db_path)
    }

    /// Load configuration from `METAFUSE_SHARES_*` environment variables,
    /// falling back to defaults for unset or unparsable values.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            db_path: std::env::var("METAFUSE_SHARES_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            lock_max_retries: env_parse("METAFUSE_SHARES_LOCK_RETRIES")
                .unwrap_or(defaults.lock_max_retries),
            lock_retry_interval: env_parse("METAFUSE_SHARES_LOCK_RETRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_retry_interval),
            lock_retry_max_interval: defaults.lock_retry_max_interval,
            verifier_interval: env_parse("METAFUSE_SHARES_VERIFY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.verifier_interval),
            reapplier_interval: env_parse("METAFUSE_SHARES_REAPPLY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reapplier_interval),
            reapply_after_verify: defaults.reapply_after_verify,
        };

        // A long initial interval from the environment raises the cap with it
        let config = Self {
            lock_retry_max_interval: config
                .lock_retry_max_interval
                .max(config.lock_retry_interval),
            ..config
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ShareError::ValidationError(
                "db_path cannot be empty".to_string(),
            ));
        }

        if self.lock_max_retries == 0 {
            return Err(ShareError::ValidationError(
                "lock_max_retries must be > 0".to_string(),
            ));
        }

        for (name, value) in [
            ("lock_retry_interval", self.lock_retry_interval),
            ("verifier_interval", self.verifier_interval),
            ("reapplier_interval", self.reapplier_interval),
        ] {
            if value.is_zero() {
                return Err(ShareError::ValidationError(format!(
                    "{} must be > 0",
                    name
                )));
            }
        }

        if self.lock_retry_interval > self.lock_retry_max_interval {
            return Err(ShareError::ValidationError(format!(
                "lock_retry_interval ({:?}) must be <= lock_retry_max_interval ({:?})",
                self.lock_retry_interval, self.lock_retry_max_interval
            )));
        }

        Ok(())
    }

    /// Retry policy handed to the dataset lock coordinator.
    pub fn lock_retry_policy(&self) -> LockRetryPolicy {
        LockRetryPolicy {
            max_attempts: self.lock_max_retries,
            initial_interval: self.lock_retry_interval,
            max_interval: self.lock_retry_max_interval,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Builder for [`SharingConfig`].
#[derive(Debug)]
pub struct SharingConfigBuilder {
    config: SharingConfig,
}

impl SharingConfigBuilder {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            config: SharingConfig {
                db_path: db_path.into(),
                ..Default::default()
            },
        }
    }

    pub fn lock_max_retries(mut self, retries: u32) -> Self {
        self.config.lock_max_retries = retries;
        self
    }

    /// Set the initial and maximum wait between lock attempts.
    pub fn lock_retry_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.config.lock_retry_interval = initial;
        self.config.lock_retry_max_interval = max;
        self
    }

    pub fn verifier_interval(mut self, interval: Duration) -> Self {
        self.config.verifier_interval = interval;
        self
    }

    pub fn reapplier_interval(mut self, interval: Duration) -> Self {
        self.config.reapplier_interval = interval;
        self
    }

    pub fn reapply_after_verify(mut self, enabled: bool) -> Self {
        self.config.reapply_after_verify = enabled;
        self
    }

    /// Build the configuration, validating all settings.
    pub fn build(self) -> Result<SharingConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SharingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lock_max_retries, 10);
        assert_eq!(config.lock_retry_interval, Duration::from_secs(60));
        assert!(config.reapply_after_verify);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(SharingConfig::builder("shares.db")
            .lock_max_retries(0)
            .build()
            .is_err());

        assert!(SharingConfig::builder("shares.db")
            .lock_retry_interval(Duration::from_secs(10), Duration::from_secs(1))
            .build()
            .is_err());

        assert!(SharingConfig::builder("shares.db")
            .verifier_interval(Duration::ZERO)
            .build()
            .is_err());

        assert!(SharingConfig::builder("").build().is_err());
    }

    #[test]
    fn test_lock_retry_policy_mirrors_config() {
        let config = SharingConfig::builder("shares.db")
            .lock_max_retries(3)
            .lock_retry_interval(Duration::from_millis(10), Duration::from_millis(40))
            .build()
            .unwrap();

        let policy = config.lock_retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_millis(10));
        assert_eq!(policy.max_interval, Duration::from_millis(40));
    }
}
