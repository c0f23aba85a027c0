//! Orchestrator configuration loaded from environment variables.

use std::time::Duration;

use uuid::Uuid;

/// Settings of a [`WorkflowOrchestrator`](crate::WorkflowOrchestrator).
///
/// Reads from environment variables:
/// - `ORCHESTRATOR_INSTANCE_ID` — tag put on published notifications (default: random UUID)
/// - `ORCHESTRATOR_CHANNEL_PREFIX` — prefix of the per-workflow channels (default: `orchestrator`)
/// - `ORCHESTRATOR_DRAIN_POLL_MS` — how often shutdown checks for in-flight steps (default: `100`)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub instance_id: String,
    pub channel_prefix: String,
    pub drain_poll_interval: Duration,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            instance_id: std::env::var("ORCHESTRATOR_INSTANCE_ID")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.instance_id),
            channel_prefix: std::env::var("ORCHESTRATOR_CHANNEL_PREFIX")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.channel_prefix),
            drain_poll_interval: std::env::var("ORCHESTRATOR_DRAIN_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_poll_interval),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Name of the pub/sub channel carrying a workflow's notifications.
    pub fn channel_for(&self, workflow_id: &str) -> String {
        format!("{}:{}", self.channel_prefix, workflow_id)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            channel_prefix: "orchestrator".to_string(),
            drain_poll_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.channel_prefix, "orchestrator");
        assert_eq!(config.drain_poll_interval, Duration::from_millis(100));
        assert!(Uuid::parse_str(&config.instance_id).is_ok());
    }

    #[test]
    fn test_instances_get_distinct_ids() {
        let a = OrchestratorConfig::default();
        let b = OrchestratorConfig::default();
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[test]
    fn test_channel_name() {
        let config = OrchestratorConfig::default().with_channel_prefix("orders");
        assert_eq!(config.channel_for("checkout"), "orders:checkout");
    }
}
