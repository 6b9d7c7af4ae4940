use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

fn default_client() -> String {
    "in-memory".to_string()
}

fn default_deserializer() -> String {
    "utf8".to_string()
}

fn default_persistence_adapter() -> String {
    "filesystem".to_string()
}

fn default_persistence_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_persistence_prefix() -> String {
    "sideline".to_string()
}

fn default_retry_policy() -> String {
    "exponential-backoff".to_string()
}

fn default_max_attempts() -> u32 {
    25
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_delay_multiplier() -> f64 {
    2.0
}

fn default_buffer_variant() -> String {
    "round-robin".to_string()
}

fn default_buffer_max_size() -> usize {
    10_000
}

fn default_buffer_throttled_size() -> usize {
    200
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

/// Top-level configuration for the sideline source.
#[derive(Debug, Clone, Deserialize)]
pub struct SidelineConfig {
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Cadence of the per-source flush tick (offset persistence and bounded
    /// source completion checks).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Stream the host emits tuples on; `None` selects the runtime default.
    #[serde(default)]
    pub output_stream_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// host:port pairs handed to the broker client.
    #[serde(default)]
    pub hosts: Vec<String>,
    pub topic: String,
    /// Registry key selecting the broker client implementation.
    #[serde(default = "default_client")]
    pub client: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Prefix for the firehose source id; the task index is appended.
    pub id_prefix: String,
    /// Registry key selecting the deserializer.
    #[serde(default = "default_deserializer")]
    pub deserializer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Registry key selecting the adapter variant.
    #[serde(default = "default_persistence_adapter")]
    pub adapter: String,
    /// Base path in the coordination store.
    #[serde(default = "default_persistence_root")]
    pub root: PathBuf,
    #[serde(default = "default_persistence_prefix")]
    pub prefix: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            adapter: default_persistence_adapter(),
            root: default_persistence_root(),
            prefix: default_persistence_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Registry key selecting the retry policy.
    #[serde(default = "default_retry_policy")]
    pub policy: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_delay_multiplier")]
    pub delay_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: default_retry_policy(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            delay_multiplier: default_delay_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Registry key selecting the buffer variant.
    #[serde(default = "default_buffer_variant")]
    pub variant: String,
    #[serde(default = "default_buffer_max_size")]
    pub max_size: usize,
    #[serde(default = "default_buffer_throttled_size")]
    pub throttled_size: usize,
    /// Source ids matching this pattern get the throttled capacity.
    #[serde(default)]
    pub throttled_regex: Option<String>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            variant: default_buffer_variant(),
            max_size: default_buffer_max_size(),
            throttled_size: default_buffer_throttled_size(),
            throttled_regex: None,
        }
    }
}

impl SidelineConfig {
    /// Configuration checks performed once at open time; failures are fatal
    /// and leave no partial state behind.
    pub fn validate(&self) -> Result<()> {
        if self.broker.topic.is_empty() {
            bail!("broker.topic must not be empty");
        }
        if self.consumer.id_prefix.is_empty() {
            bail!("consumer.id_prefix must not be empty");
        }
        if self.buffer.max_size == 0 {
            bail!("buffer.max_size must be positive");
        }
        if self.buffer.throttled_size == 0 {
            bail!("buffer.throttled_size must be positive");
        }
        if let Some(pattern) = &self.buffer.throttled_regex {
            if let Err(err) = regex::Regex::new(pattern) {
                bail!("buffer.throttled_regex is not a valid pattern: {err}");
            }
        }
        if self.flush_interval_ms == 0 {
            bail!("flush_interval_ms must be positive");
        }
        if self.retry.delay_multiplier < 1.0 {
            bail!(
                "retry.delay_multiplier must be at least 1.0 (got {})",
                self.retry.delay_multiplier
            );
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Host-provided placement of this instance among its parallel peers.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    pub task_index: usize,
    pub total_tasks: usize,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            task_index: 0,
            total_tasks: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SidelineConfig {
        SidelineConfig {
            broker: BrokerConfig {
                hosts: vec!["localhost:9092".into()],
                topic: "events".into(),
                client: default_client(),
            },
            consumer: ConsumerConfig {
                id_prefix: "firehose".into(),
                deserializer: default_deserializer(),
            },
            persistence: PersistenceConfig::default(),
            retry: RetryConfig::default(),
            buffer: BufferConfig::default(),
            flush_interval_ms: default_flush_interval_ms(),
            output_stream_id: None,
        }
    }

    #[test]
    fn defaults_validate() {
        test_config().validate().unwrap();
    }

    #[test]
    fn empty_consumer_prefix_is_rejected() {
        let mut config = test_config();
        config.consumer.id_prefix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_buffer_size_is_rejected() {
        let mut config = test_config();
        config.buffer.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_throttle_pattern_is_rejected() {
        let mut config = test_config();
        config.buffer.throttled_regex = Some("(".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_deserializes_from_nested_keys() {
        let config: SidelineConfig = serde_json::from_value(serde_json::json!({
            "broker": {"hosts": ["k1:9092"], "topic": "events"},
            "consumer": {"id_prefix": "spout"},
            "buffer": {"variant": "throttled", "throttled_regex": "^spout-0_"}
        }))
        .unwrap();
        assert_eq!(config.broker.topic, "events");
        assert_eq!(config.buffer.variant, "throttled");
        assert_eq!(config.retry.max_attempts, default_max_attempts());
        config.validate().unwrap();
    }
}
