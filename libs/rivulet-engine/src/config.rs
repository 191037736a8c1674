use std::collections::HashMap;

use serde::Deserialize;

use rivulet_api::source::OffsetReset;

use crate::error::EngineError;

/// Root configuration — parsed from TOML. Process-wide; frozen once the
/// app connects.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Application / consumer-group name.
    pub app_name: String,

    /// Broker address, host:port. `mem://local` selects the in-memory
    /// source.
    pub broker_address: String,

    /// Value serializer. Only `raw` is interpreted by the runtime;
    /// anything else names an external codec plugin.
    #[serde(default)]
    pub default_serializer: Serializer,

    /// Arbitrary named options consumed by `configure()` hooks.
    #[serde(default)]
    pub options: HashMap<String, toml::Value>,

    /// Source connection and polling behavior.
    #[serde(default)]
    pub source: SourceConfig,

    /// Defaults applied to agents that do not override them.
    #[serde(default)]
    pub agent_defaults: AgentDefaults,

    /// Shutdown grace period in milliseconds. In-flight handlers are
    /// cancelled after this deadline; cancelled work never commits.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Agent definitions (used by the server binary; library users
    /// register agents programmatically instead).
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    /// Records published into the in-memory source at startup
    /// (`mem://` runs only; lets a config demonstrate end-to-end flow).
    #[serde(default)]
    pub seed: Vec<SeedRecord>,
}

/// Value serializer selection. The runtime only ever interprets `Raw`;
/// any other string names a codec resolved by an external plugin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum Serializer {
    #[default]
    Raw,
    Codec(String),
}

impl From<String> for Serializer {
    fn from(s: String) -> Self {
        if s == "raw" {
            Serializer::Raw
        } else {
            Serializer::Codec(s)
        }
    }
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Connection attempts before startup fails.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Initial backoff between connection attempts, doubled per attempt.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Max records per poll.
    #[serde(default = "default_poll_max_records")]
    pub poll_max_records: usize,

    /// Resume policy when the cursor predates retained history.
    #[serde(default = "default_offset_reset")]
    pub offset_reset: OffsetResetConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetResetConfig {
    Earliest,
    Fail,
}

impl From<OffsetResetConfig> for OffsetReset {
    fn from(c: OffsetResetConfig) -> Self {
        match c {
            OffsetResetConfig::Earliest => OffsetReset::Earliest,
            OffsetResetConfig::Fail => OffsetReset::Fail,
        }
    }
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_poll_max_records() -> usize {
    256
}

fn default_offset_reset() -> OffsetResetConfig {
    OffsetResetConfig::Earliest
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            poll_max_records: default_poll_max_records(),
            offset_reset: default_offset_reset(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefaults {
    /// Handler retries after the first failure (total invocations =
    /// retries + 1), after which the agent is marked Failed.
    #[serde(default = "default_restart_retries")]
    pub restart_retries: u32,

    /// Backoff between handler retries.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Per-(agent, partition) queue depth; a full queue suspends polling
    /// for that partition.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_restart_retries() -> u32 {
    2
}

fn default_restart_backoff_ms() -> u64 {
    50
}

fn default_queue_depth() -> usize {
    64
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            restart_retries: default_restart_retries(),
            restart_backoff_ms: default_restart_backoff_ms(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// One agent wired from configuration (server binary).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Topics the agent subscribes to; more than one merges the streams.
    pub topics: Vec<String>,
    #[serde(default)]
    pub kind: AgentKind,
    /// Target topic for `forward` agents.
    #[serde(default)]
    pub forward_to: Option<String>,
    /// Reject records whose value exceeds this many bytes.
    #[serde(default)]
    pub max_message_length: Option<usize>,
    #[serde(default)]
    pub restart_retries: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Log every record (tagged with its source topic).
    #[default]
    Print,
    /// Re-publish every record to `forward_to`.
    Forward,
}

/// One record published at startup (`mem://` source only).
#[derive(Debug, Clone, Deserialize)]
pub struct SeedRecord {
    pub topic: String,
    pub value: String,
    #[serde(default)]
    pub key: Option<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let cfg: AppConfig =
            toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.app_name.is_empty() {
            return Err(EngineError::Config("app_name must not be empty".into()));
        }
        if self.broker_address.is_empty() {
            return Err(EngineError::Config(
                "broker_address must not be empty".into(),
            ));
        }
        for agent in &self.agents {
            if agent.topics.is_empty() {
                return Err(EngineError::Config(format!(
                    "agent '{}' subscribes to no topics",
                    agent.name
                )));
            }
            if agent.kind == AgentKind::Forward && agent.forward_to.is_none() {
                return Err(EngineError::Config(format!(
                    "agent '{}' is a forward agent but has no forward_to",
                    agent.name
                )));
            }
        }
        Ok(())
    }

    /// Typed accessor for a numeric entry in `options`.
    pub fn option_i64(&self, name: &str) -> Option<i64> {
        self.options.get(name).and_then(|v| v.as_integer())
    }

    /// Typed accessor for a string entry in `options`.
    pub fn option_str(&self, name: &str) -> Option<&str> {
        self.options.get(name).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let cfg = AppConfig::parse(
            r#"
            app_name = "example-app"
            broker_address = "mem://local"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.app_name, "example-app");
        assert_eq!(cfg.default_serializer, Serializer::Raw);
        assert_eq!(cfg.source.connect_attempts, 5);
        assert_eq!(cfg.agent_defaults.restart_retries, 2);
        assert!(cfg.agents.is_empty());
    }

    #[test]
    fn parse_full() {
        let cfg = AppConfig::parse(
            r#"
            app_name = "example-app"
            broker_address = "broker:9092"
            default_serializer = "raw"
            stop_grace_ms = 1000

            [options]
            message_max_length = 15

            [source]
            connect_attempts = 3
            offset_reset = "fail"

            [[agents]]
            name = "printer"
            topics = ["topic1", "topic2"]
            max_message_length = 15

            [[agents]]
            name = "relay"
            topics = ["topic1"]
            kind = "forward"
            forward_to = "topic3"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.option_i64("message_max_length"), Some(15));
        assert_eq!(cfg.source.offset_reset, OffsetResetConfig::Fail);
        assert_eq!(cfg.agents.len(), 2);
        assert_eq!(cfg.agents[0].topics.len(), 2);
        assert_eq!(cfg.agents[1].kind, AgentKind::Forward);
    }

    #[test]
    fn forward_without_target_rejected() {
        let err = AppConfig::parse(
            r#"
            app_name = "a"
            broker_address = "b"

            [[agents]]
            name = "bad"
            topics = ["t"]
            kind = "forward"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn empty_topics_rejected() {
        let err = AppConfig::parse(
            r#"
            app_name = "a"
            broker_address = "b"

            [[agents]]
            name = "bad"
            topics = []
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
