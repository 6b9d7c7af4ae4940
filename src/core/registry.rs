//! Explicit plugin registry: a stable string key in the configuration
//! selects a constructor registered here. No reflective loading; hosts
//! register their own implementations next to the shipped ones.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::core::config::SidelineConfig;
use crate::core::time::Clock;
use crate::log::client::{InMemoryLogBroker, LogClient};
use crate::log::deserializer::{Deserializer, JsonDeserializer, Utf8Deserializer};
use crate::messaging::buffer::{FifoBuffer, MessageBuffer, RoundRobinBuffer, ThrottledBuffer};
use crate::messaging::retry::{ExponentialBackoff, NeverRetry, RetryPolicy};
use crate::messaging::SourceId;
use crate::ops::metrics::{MetricsRecorder, NoopMetrics, TracingMetrics};
use crate::storage::fs::FsPersistenceAdapter;
use crate::storage::memory::InMemoryPersistenceAdapter;
use crate::storage::PersistenceAdapter;

pub type DeserializerCtor =
    Box<dyn Fn(&SidelineConfig) -> Result<Arc<dyn Deserializer>> + Send + Sync>;
pub type RetryCtor<C> =
    Box<dyn Fn(&SidelineConfig, &C) -> Result<Box<dyn RetryPolicy>> + Send + Sync>;
pub type BufferCtor = Box<dyn Fn(&SidelineConfig) -> Result<Arc<dyn MessageBuffer>> + Send + Sync>;
pub type PersistenceCtor =
    Box<dyn Fn(&SidelineConfig) -> Result<Arc<dyn PersistenceAdapter>> + Send + Sync>;
pub type ClientCtor =
    Box<dyn Fn(&SidelineConfig, &SourceId) -> Result<Box<dyn LogClient>> + Send + Sync>;
pub type MetricsCtor = Box<dyn Fn(&SidelineConfig) -> Result<Arc<dyn MetricsRecorder>> + Send + Sync>;

pub struct ComponentRegistry<C: Clock> {
    deserializers: HashMap<String, DeserializerCtor>,
    retry_policies: HashMap<String, RetryCtor<C>>,
    buffers: HashMap<String, BufferCtor>,
    persistence: HashMap<String, PersistenceCtor>,
    clients: HashMap<String, ClientCtor>,
    metrics: HashMap<String, MetricsCtor>,
    embedded_broker: InMemoryLogBroker,
}

impl<C: Clock> ComponentRegistry<C> {
    /// Registry pre-populated with every shipped implementation.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            deserializers: HashMap::new(),
            retry_policies: HashMap::new(),
            buffers: HashMap::new(),
            persistence: HashMap::new(),
            clients: HashMap::new(),
            metrics: HashMap::new(),
            embedded_broker: InMemoryLogBroker::new(),
        };

        registry.register_deserializer("utf8", |_| Ok(Arc::new(Utf8Deserializer)));
        registry.register_deserializer("json", |_| Ok(Arc::new(JsonDeserializer)));

        registry.register_retry_policy("never", |_, _| Ok(Box::new(NeverRetry)));
        registry.register_retry_policy("exponential-backoff", |config, clock| {
            Ok(Box::new(ExponentialBackoff::new(
                clock.clone(),
                config.retry.max_attempts,
                config.retry.initial_delay(),
                config.retry.delay_multiplier,
            )))
        });

        registry.register_buffer("fifo", |config| {
            Ok(Arc::new(FifoBuffer::new(config.buffer.max_size)?))
        });
        registry.register_buffer("round-robin", |config| {
            Ok(Arc::new(RoundRobinBuffer::new(config.buffer.max_size)?))
        });
        registry.register_buffer("throttled", |config| {
            let pattern = config.buffer.throttled_regex.as_deref().unwrap_or(".*");
            Ok(Arc::new(ThrottledBuffer::new(
                config.buffer.max_size,
                config.buffer.throttled_size,
                pattern,
            )?))
        });

        registry.register_persistence("filesystem", |config| {
            Ok(Arc::new(FsPersistenceAdapter::new(
                &config.persistence.root,
                &config.persistence.prefix,
            )))
        });
        registry.register_persistence("in-memory", |_| {
            Ok(Arc::new(InMemoryPersistenceAdapter::new()))
        });

        registry.register_metrics("noop", |_| Ok(Arc::new(NoopMetrics)));
        registry.register_metrics("tracing", |_| Ok(Arc::new(TracingMetrics)));

        let broker = registry.embedded_broker.clone();
        registry.register_client("in-memory", move |_, _| Ok(Box::new(broker.client())));

        registry
    }

    /// The broker backing the shipped "in-memory" client; tests produce
    /// records through it.
    pub fn embedded_broker(&self) -> &InMemoryLogBroker {
        &self.embedded_broker
    }

    pub fn register_deserializer(
        &mut self,
        key: &str,
        ctor: impl Fn(&SidelineConfig) -> Result<Arc<dyn Deserializer>> + Send + Sync + 'static,
    ) {
        self.deserializers.insert(key.to_string(), Box::new(ctor));
    }

    pub fn register_retry_policy(
        &mut self,
        key: &str,
        ctor: impl Fn(&SidelineConfig, &C) -> Result<Box<dyn RetryPolicy>> + Send + Sync + 'static,
    ) {
        self.retry_policies.insert(key.to_string(), Box::new(ctor));
    }

    pub fn register_buffer(
        &mut self,
        key: &str,
        ctor: impl Fn(&SidelineConfig) -> Result<Arc<dyn MessageBuffer>> + Send + Sync + 'static,
    ) {
        self.buffers.insert(key.to_string(), Box::new(ctor));
    }

    pub fn register_persistence(
        &mut self,
        key: &str,
        ctor: impl Fn(&SidelineConfig) -> Result<Arc<dyn PersistenceAdapter>> + Send + Sync + 'static,
    ) {
        self.persistence.insert(key.to_string(), Box::new(ctor));
    }

    pub fn register_client(
        &mut self,
        key: &str,
        ctor: impl Fn(&SidelineConfig, &SourceId) -> Result<Box<dyn LogClient>> + Send + Sync + 'static,
    ) {
        self.clients.insert(key.to_string(), Box::new(ctor));
    }

    pub fn register_metrics(
        &mut self,
        key: &str,
        ctor: impl Fn(&SidelineConfig) -> Result<Arc<dyn MetricsRecorder>> + Send + Sync + 'static,
    ) {
        self.metrics.insert(key.to_string(), Box::new(ctor));
    }

    pub fn build_deserializer(&self, config: &SidelineConfig) -> Result<Arc<dyn Deserializer>> {
        let key = &config.consumer.deserializer;
        let ctor = lookup(&self.deserializers, key, "deserializer")?;
        ctor(config).with_context(|| format!("construct deserializer {key:?}"))
    }

    pub fn build_retry_policy(
        &self,
        config: &SidelineConfig,
        clock: &C,
    ) -> Result<Box<dyn RetryPolicy>> {
        let key = &config.retry.policy;
        let ctor = lookup(&self.retry_policies, key, "retry policy")?;
        ctor(config, clock).with_context(|| format!("construct retry policy {key:?}"))
    }

    pub fn build_buffer(&self, config: &SidelineConfig) -> Result<Arc<dyn MessageBuffer>> {
        let key = &config.buffer.variant;
        let ctor = lookup(&self.buffers, key, "buffer")?;
        ctor(config).with_context(|| format!("construct buffer {key:?}"))
    }

    pub fn build_persistence(&self, config: &SidelineConfig) -> Result<Arc<dyn PersistenceAdapter>> {
        let key = &config.persistence.adapter;
        let ctor = lookup(&self.persistence, key, "persistence adapter")?;
        ctor(config).with_context(|| format!("construct persistence adapter {key:?}"))
    }

    pub fn build_client(
        &self,
        config: &SidelineConfig,
        source_id: &SourceId,
    ) -> Result<Box<dyn LogClient>> {
        let key = &config.broker.client;
        let ctor = lookup(&self.clients, key, "broker client")?;
        ctor(config, source_id).with_context(|| format!("construct broker client {key:?}"))
    }

    pub fn build_metrics(&self, config: &SidelineConfig, key: &str) -> Result<Arc<dyn MetricsRecorder>> {
        let ctor = lookup(&self.metrics, key, "metrics recorder")?;
        ctor(config).with_context(|| format!("construct metrics recorder {key:?}"))
    }
}

fn lookup<'a, T>(map: &'a HashMap<String, T>, key: &str, kind: &str) -> Result<&'a T> {
    match map.get(key) {
        Some(ctor) => Ok(ctor),
        None => {
            let mut known: Vec<&str> = map.keys().map(String::as_str).collect();
            known.sort_unstable();
            bail!("unknown {kind} {key:?}; registered: {known:?}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{BrokerConfig, ConsumerConfig, SidelineConfig};
    use crate::core::time::SystemClock;

    fn config() -> SidelineConfig {
        SidelineConfig {
            broker: BrokerConfig {
                hosts: vec![],
                topic: "events".into(),
                client: "in-memory".into(),
            },
            consumer: ConsumerConfig {
                id_prefix: "firehose".into(),
                deserializer: "utf8".into(),
            },
            persistence: Default::default(),
            retry: Default::default(),
            buffer: Default::default(),
            flush_interval_ms: 100,
            output_stream_id: None,
        }
    }

    #[test]
    fn defaults_resolve_every_shipped_key() {
        let registry: ComponentRegistry<SystemClock> = ComponentRegistry::with_defaults();
        let config = config();
        registry.build_deserializer(&config).unwrap();
        registry.build_buffer(&config).unwrap();
        registry.build_retry_policy(&config, &SystemClock).unwrap();
        registry
            .build_client(&config, &SourceId::from("firehose-0"))
            .unwrap();
        registry.build_metrics(&config, "noop").unwrap();
    }

    #[test]
    fn unknown_keys_name_the_alternatives() {
        let registry: ComponentRegistry<SystemClock> = ComponentRegistry::with_defaults();
        let mut config = config();
        config.buffer.variant = "mystery".into();
        let err = match registry.build_buffer(&config) {
            Ok(_) => panic!("expected build_buffer to fail for unknown variant"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("round-robin"));
    }

    #[test]
    fn in_memory_clients_share_the_embedded_broker() {
        let registry: ComponentRegistry<SystemClock> = ComponentRegistry::with_defaults();
        registry.embedded_broker().produce("events", 0, None, b"x");
        let config = config();
        let mut client = registry
            .build_client(&config, &SourceId::from("firehose-0"))
            .unwrap();
        client.assign(&[crate::log::TopicPartition::new("events", 0)]);
        assert!(client.poll().is_some());
    }
}
