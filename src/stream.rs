//! Host-facing surface: one `SidelineStream` per topology task.
//!
//! The host opens the stream, repeatedly asks for the next message (emitting
//! it downstream itself), and reports acks/fails using the message id as the
//! opaque handle. Faults never surface through `next_message`; diagnostics go
//! to logs and the metrics sink.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::core::config::{SidelineConfig, TaskContext};
use crate::core::registry::ComponentRegistry;
use crate::core::time::{Clock, SystemClock};
use crate::messaging::{Message, MessageId};
use crate::ops::metrics::{MetricsRecorder, NoopMetrics};
use crate::sideline::controller::{SidelineController, SidelineHandle, SidelineTrigger};
use crate::sideline::coordinator::SourceCoordinator;
use crate::sideline::factory::VirtualSourceFactory;
use crate::storage::PersistenceAdapter;

/// Stream id used when the configuration names none.
pub const DEFAULT_STREAM_ID: &str = "default";

const METRICS_SCOPE: &str = "stream";

pub struct SidelineStream<C: Clock = SystemClock> {
    config: Arc<SidelineConfig>,
    registry: Arc<ComponentRegistry<C>>,
    clock: C,
    metrics: Arc<dyn MetricsRecorder>,
    coordinator: Option<SourceCoordinator<C>>,
    controller: Option<Arc<SidelineController<C>>>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    starting_trigger: Option<Box<dyn SidelineTrigger>>,
    stopping_trigger: Option<Box<dyn SidelineTrigger>>,
}

impl SidelineStream<SystemClock> {
    pub fn new(config: SidelineConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> SidelineStream<C> {
    pub fn with_clock(config: SidelineConfig, clock: C) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ComponentRegistry::with_defaults()),
            clock,
            metrics: Arc::new(NoopMetrics),
            coordinator: None,
            controller: None,
            persistence: None,
            starting_trigger: None,
            stopping_trigger: None,
        }
    }

    /// Swap in a registry carrying host-registered implementations. Must be
    /// called before `open`.
    pub fn set_registry(&mut self, registry: Arc<ComponentRegistry<C>>) {
        self.registry = registry;
    }

    pub fn set_metrics(&mut self, metrics: Arc<dyn MetricsRecorder>) {
        self.metrics = metrics;
    }

    /// Trigger invoked with a [`SidelineHandle`] once the stream is open;
    /// expected to start sidelines. Set before `open`.
    pub fn set_starting_trigger(&mut self, trigger: Box<dyn SidelineTrigger>) {
        self.starting_trigger = Some(trigger);
    }

    /// Trigger invoked with a [`SidelineHandle`] once the stream is open;
    /// expected to stop sidelines. Set before `open`.
    pub fn set_stopping_trigger(&mut self, trigger: Box<dyn SidelineTrigger>) {
        self.stopping_trigger = Some(trigger);
    }

    /// Validate configuration, start the firehose, and resume any persisted
    /// sideline requests. Must run inside a tokio runtime.
    pub async fn open(&mut self, context: TaskContext) -> Result<()> {
        self.config.validate()?;
        if self.coordinator.is_some() {
            anyhow::bail!("stream is already open");
        }

        // Resolve every pluggable part before touching durable state, so a
        // bad registry key leaves nothing behind.
        let persistence = self
            .registry
            .build_persistence(&self.config)
            .context("select persistence adapter")?;
        let buffer = self
            .registry
            .build_buffer(&self.config)
            .context("select message buffer")?;
        let factory = Arc::new(VirtualSourceFactory::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&persistence),
            Arc::clone(&self.metrics),
            self.clock.clone(),
            context,
        ));
        let firehose = factory.create_firehose()?;

        persistence.open().context("open persistence adapter")?;
        let coordinator = SourceCoordinator::new(
            Arc::clone(&self.config),
            buffer,
            Arc::clone(&self.metrics),
            self.clock.clone(),
        );
        if let Err(err) = coordinator.open(firehose).await {
            persistence.close();
            return Err(err);
        }

        let controller = Arc::new(SidelineController::new(
            Arc::clone(&self.config),
            coordinator.clone(),
            factory,
            Arc::clone(&persistence),
            Arc::clone(&self.metrics),
        ));
        if let Err(err) = controller.resume() {
            // No half-open stream: tear the firehose back down.
            coordinator.close().await;
            persistence.close();
            return Err(err.context("resume persisted sidelines"));
        }

        let handle = controller.handle();
        if let Some(trigger) = self.starting_trigger.as_mut() {
            trigger.open(handle.clone());
        }
        if let Some(trigger) = self.stopping_trigger.as_mut() {
            trigger.open(handle);
        }

        self.persistence = Some(persistence);
        self.coordinator = Some(coordinator);
        self.controller = Some(controller);
        info!("sideline stream open on {}", self.config.broker.topic);
        Ok(())
    }

    /// The next message the host should emit, if any. The id inside is the
    /// handle to pass back through `ack`/`fail`.
    pub fn next_message(&self) -> Option<Message> {
        let message = self.coordinator.as_ref()?.next_message()?;
        self.metrics.count(METRICS_SCOPE, "emit", 1);
        Some(message)
    }

    pub fn ack(&self, id: &MessageId) {
        self.metrics.count(METRICS_SCOPE, "ack", 1);
        if let Some(coordinator) = &self.coordinator {
            coordinator.ack(id);
        }
    }

    pub fn fail(&self, id: &MessageId) {
        self.metrics.count(METRICS_SCOPE, "fail", 1);
        if let Some(coordinator) = &self.coordinator {
            coordinator.fail(id);
        }
    }

    /// Handle for driving sidelines directly, without a trigger.
    pub fn sideline_handle(&self) -> Option<SidelineHandle> {
        self.controller.as_ref().map(SidelineController::handle)
    }

    /// The stream tuples are emitted on.
    pub fn output_stream_id(&self) -> &str {
        self.config
            .output_stream_id
            .as_deref()
            .unwrap_or(DEFAULT_STREAM_ID)
    }

    /// Field names of the configured deserializer's output tuples.
    pub fn output_fields(&self) -> Result<Vec<String>> {
        Ok(self.registry.build_deserializer(&self.config)?.output_fields())
    }

    /// Stop every source, join the workers, and release shared resources.
    pub async fn close(&mut self) {
        if let Some(trigger) = self.starting_trigger.as_mut() {
            trigger.close();
        }
        if let Some(trigger) = self.stopping_trigger.as_mut() {
            trigger.close();
        }
        self.controller = None;
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.close().await;
        }
        if let Some(persistence) = self.persistence.take() {
            persistence.close();
        }
        info!("sideline stream closed");
    }
}
