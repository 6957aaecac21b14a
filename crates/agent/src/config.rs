//! Agent configuration

use agent_lib::collector::CollectionConfig;
use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node id stamped on records whose engine metadata has none
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// API server port for liveness/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Container engine REST endpoint
    #[serde(default = "default_engine_url")]
    pub engine_url: String,

    /// Message bus publish endpoint
    #[serde(default = "default_bus_url")]
    pub bus_url: String,

    #[serde(default = "default_bus_cluster_id")]
    pub bus_cluster_id: String,

    /// Defaults to `telemetry-agent-<node_id>`
    #[serde(default)]
    pub bus_client_id: Option<String>,

    #[serde(default = "default_bus_timeout")]
    pub bus_timeout_secs: u64,

    /// Poll loop tick interval in seconds
    #[serde(default = "default_poll_period")]
    pub poll_period_secs: u64,

    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Minimum gap between two checkpoint writes of one container, in seconds
    #[serde(default = "default_checkpoint_period")]
    pub checkpoint_period_secs: u64,

    /// Delay between a terminal event and the record removal, in seconds
    #[serde(default = "default_removal_debounce")]
    pub removal_debounce_secs: u64,

    /// Shipping report cadence in poll ticks
    #[serde(default = "default_report_every_ticks")]
    pub report_every_ticks: u64,
}

fn default_node_id() -> String {
    std::env::var("NODE_ID").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    3000
}

fn default_engine_url() -> String {
    "http://127.0.0.1:2375".to_string()
}

fn default_bus_url() -> String {
    "http://127.0.0.1:4222".to_string()
}

fn default_bus_cluster_id() -> String {
    "telemetry-cluster".to_string()
}

fn default_bus_timeout() -> u64 {
    10
}

fn default_poll_period() -> u64 {
    1
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/var/lib/telemetry-agent/checkpoints")
}

fn default_checkpoint_period() -> u64 {
    10
}

fn default_removal_debounce() -> u64 {
    5
}

fn default_report_every_ticks() -> u64 {
    60
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_env(config::Environment::with_prefix("AGENT"))
    }

    fn from_env(env: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn bus_client_id(&self) -> String {
        self.bus_client_id
            .clone()
            .unwrap_or_else(|| format!("telemetry-agent-{}", self.node_id))
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_secs(self.bus_timeout_secs)
    }

    /// Settings handed to the collection library
    pub fn collection_config(&self) -> CollectionConfig {
        CollectionConfig {
            poll_interval: Duration::from_secs(self.poll_period_secs.max(1)),
            checkpoint_dir: self.checkpoint_dir.clone(),
            checkpoint_period: Duration::from_secs(self.checkpoint_period_secs),
            removal_debounce: Duration::from_secs(self.removal_debounce_secs),
            report_every_ticks: self.report_every_ticks,
            node_id: self.node_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> AgentConfig {
        let source: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_env(config::Environment::with_prefix("AGENT").source(Some(source)))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_vars(&[("AGENT_NODE_ID", "node-1")]);

        assert_eq!(config.api_port, 3000);
        assert_eq!(config.engine_url, "http://127.0.0.1:2375");
        assert_eq!(config.bus_cluster_id, "telemetry-cluster");
        assert_eq!(config.bus_client_id(), "telemetry-agent-node-1");
        assert_eq!(config.bus_timeout(), Duration::from_secs(10));

        let collection = config.collection_config();
        assert_eq!(collection.poll_interval, Duration::from_secs(1));
        assert_eq!(collection.checkpoint_period, Duration::from_secs(10));
        assert_eq!(collection.removal_debounce, Duration::from_secs(5));
        assert_eq!(collection.report_every_ticks, 60);
        assert_eq!(collection.node_id, "node-1");
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("AGENT_NODE_ID", "node-2"),
            ("AGENT_API_PORT", "9100"),
            ("AGENT_BUS_CLIENT_ID", "custom"),
            ("AGENT_CHECKPOINT_DIR", "/tmp/checkpoints"),
            ("AGENT_CHECKPOINT_PERIOD_SECS", "30"),
        ]);

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.bus_client_id(), "custom");

        let collection = config.collection_config();
        assert_eq!(collection.checkpoint_dir, PathBuf::from("/tmp/checkpoints"));
        assert_eq!(collection.checkpoint_period, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        let source: config::Map<String, String> =
            [("AGENT_API_PORT".to_string(), "not-a-port".to_string())].into();
        let result =
            AgentConfig::from_env(config::Environment::with_prefix("AGENT").source(Some(source)));
        assert!(result.is_err());
    }
}
