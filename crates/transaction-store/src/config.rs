//! Storage configuration loaded from environment variables.

use std::time::Duration;

/// Shortest sweep interval; a zero period would stall the sweep loop.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Settings shared by the storage adapters.
///
/// Reads from environment variables:
/// - `TRANSACTION_SWEEP_INTERVAL_MS` — how often expired transactions are swept (default: `1000`)
/// - `TRANSACTION_RETENTION_SECS` — how long finished transactions are kept (default: forever)
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sweep_interval: Duration,
    pub retention: Option<Duration>,
}

impl StorageConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sweep_interval: std::env::var("TRANSACTION_SWEEP_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval)
                .max(MIN_SWEEP_INTERVAL),
            retention: std::env::var("TRANSACTION_RETENTION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
        }
    }

    /// Sets the sweep interval, never shorter than [`MIN_SWEEP_INTERVAL`].
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(MIN_SWEEP_INTERVAL);
        self
    }

    /// Sets the retention window for finished transactions.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(1000),
            retention: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = StorageConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert!(config.retention.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let config = StorageConfig::default()
            .with_sweep_interval(Duration::from_millis(50))
            .with_retention(Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_millis(50));
        assert_eq!(config.retention, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let config = StorageConfig::default().with_sweep_interval(Duration::ZERO);
        assert_eq!(config.sweep_interval, MIN_SWEEP_INTERVAL);
    }
}
