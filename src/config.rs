//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Default storage key for the persisted snapshot.
pub const DEFAULT_STORAGE_KEY: &str = "booking-flow-state";

/// Timing and storage settings for a booking session.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Inactivity window before a session is reported abandoned.
    pub idle_timeout: Duration,
    /// Elapsed-time tick interval.
    pub tick_interval: Duration,
    /// Delay before form-data changes are flushed to storage.
    pub autosave_debounce: Duration,
    /// Snapshots older than this are discarded on load.
    pub snapshot_ttl: Duration,
    /// Upper bound on a single submission call.
    pub submission_timeout: Duration,
    /// Key the snapshot is written under.
    pub storage_key: String,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300), // 5 minutes
            tick_interval: Duration::from_secs(1),
            autosave_debounce: Duration::from_secs(1),
            snapshot_ttl: Duration::from_secs(86_400), // 24 hours
            submission_timeout: Duration::from_secs(30),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl FlowSettings {
    /// Build settings from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let idle_timeout = env_u64("BOOKING_IDLE_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_timeout);

        let tick_interval = env_u64("BOOKING_TICK_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick_interval);

        let autosave_debounce = env_u64("BOOKING_AUTOSAVE_DEBOUNCE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.autosave_debounce);

        let snapshot_ttl = env_u64("BOOKING_SNAPSHOT_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.snapshot_ttl);

        let submission_timeout = env_u64("BOOKING_SUBMIT_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.submission_timeout);

        let storage_key = std::env::var("BOOKING_STORAGE_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.storage_key);

        Self {
            idle_timeout,
            tick_interval,
            autosave_debounce,
            snapshot_ttl,
            submission_timeout,
            storage_key,
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("idle_timeout", self.idle_timeout),
            ("tick_interval", self.tick_interval),
            ("snapshot_ttl", self.snapshot_ttl),
            ("submission_timeout", self.submission_timeout),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.storage_key.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "storage_key".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = FlowSettings::default();
        assert_eq!(settings.idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.tick_interval, Duration::from_secs(1));
        assert_eq!(settings.snapshot_ttl, Duration::from_secs(24 * 60 * 60));
        assert_eq!(settings.storage_key, DEFAULT_STORAGE_KEY);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_durations() {
        let settings = FlowSettings {
            tick_interval: Duration::ZERO,
            ..Default::default()
        };
        match settings.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "tick_interval"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn validate_rejects_empty_key() {
        let settings = FlowSettings {
            storage_key: String::new(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
