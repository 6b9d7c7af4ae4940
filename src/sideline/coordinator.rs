//! Owns the firehose and every replay source, runs each on its own worker
//! task, and routes host acks/fails back to the originating source.
//!
//! A virtual source is only ever touched by its worker; the host-facing
//! entry points forward feedback over a per-source channel which the worker
//! drains between poll iterations. The stop flag is the one piece of state
//! shared across threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::SidelineConfig;
use crate::core::time::Clock;
use crate::log::consumer::ConsumerStateHandle;
use crate::messaging::buffer::MessageBuffer;
use crate::messaging::filter::SharedFilterChain;
use crate::messaging::{Message, MessageId, SourceId};
use crate::ops::metrics::MetricsRecorder;
use crate::sideline::virtual_source::{SourceError, VirtualSource};

/// Sleep between polls when a source has nothing to hand over.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);
/// How long one blocked `put` attempt waits before stop/flush re-checks.
const PUT_RETRY: Duration = Duration::from_millis(50);
/// How long `close` waits for each worker before abandoning it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

enum Feedback {
    Ack(MessageId),
    Fail(MessageId),
}

struct SourceHandle {
    feedback_tx: mpsc::UnboundedSender<Feedback>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// Cheap view of the firehose for the sideline controller: its filter chain
/// and a snapshot handle onto its committed offsets.
#[derive(Clone)]
pub struct FirehoseHandle {
    pub source_id: SourceId,
    pub filter_chain: Arc<SharedFilterChain>,
    pub state: ConsumerStateHandle,
}

struct Inner<C: Clock> {
    config: Arc<SidelineConfig>,
    buffer: Arc<dyn MessageBuffer>,
    metrics: Arc<dyn MetricsRecorder>,
    clock: C,
    sources: Mutex<HashMap<SourceId, SourceHandle>>,
    firehose: Mutex<Option<FirehoseHandle>>,
}

pub struct SourceCoordinator<C: Clock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for SourceCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Clock> SourceCoordinator<C> {
    pub fn new(
        config: Arc<SidelineConfig>,
        buffer: Arc<dyn MessageBuffer>,
        metrics: Arc<dyn MetricsRecorder>,
        clock: C,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                buffer,
                metrics,
                clock,
                sources: Mutex::new(HashMap::new()),
                firehose: Mutex::new(None),
            }),
        }
    }

    /// Start the firehose worker and wait until its consumer is positioned,
    /// so sideline snapshots taken right after open see every claimed
    /// partition. Must be called once, inside a tokio runtime.
    pub async fn open(&self, firehose: VirtualSource) -> Result<()> {
        {
            let mut slot = self.inner.firehose.lock();
            if slot.is_some() {
                bail!("coordinator is already open");
            }
            *slot = Some(FirehoseHandle {
                source_id: firehose.source_id().clone(),
                filter_chain: firehose.filter_chain(),
                state: firehose.state_handle(),
            });
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        self.spawn_source(firehose, Some(ready_tx))?;
        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => {
                *self.inner.firehose.lock() = None;
                bail!("firehose failed to open: {message}")
            }
            Err(_) => {
                *self.inner.firehose.lock() = None;
                bail!("firehose worker exited before opening")
            }
        }
    }

    /// Hand a bounded replay source to the coordinator. Duplicate ids are a
    /// precondition error.
    pub fn add_replay_source(&self, source: VirtualSource) -> Result<()> {
        if self.inner.firehose.lock().is_none() {
            bail!("coordinator is not open");
        }
        self.spawn_source(source, None)
    }

    fn spawn_source(
        &self,
        source: VirtualSource,
        ready: Option<oneshot::Sender<Result<(), String>>>,
    ) -> Result<()> {
        let source_id = source.source_id().clone();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        {
            let mut sources = self.inner.sources.lock();
            if sources.contains_key(&source_id) {
                return Err(SourceError::DuplicateSource(source_id).into());
            }
            sources.insert(
                source_id.clone(),
                SourceHandle {
                    feedback_tx,
                    stop: source.stop_flag(),
                    join: None,
                },
            );
        }
        self.inner.buffer.add_source(&source_id);
        let join = tokio::spawn(run_worker(
            source,
            Arc::downgrade(&self.inner),
            feedback_rx,
            ready,
        ));
        if let Some(handle) = self.inner.sources.lock().get_mut(&source_id) {
            handle.join = Some(join);
        }
        info!(source = %source_id, "source worker started");
        Ok(())
    }

    /// Pop the next buffered message, if any.
    pub fn next_message(&self) -> Option<Message> {
        self.inner.buffer.poll()
    }

    /// Route an ack to the source that emitted the message. A source that
    /// already completed and deregistered just drops it.
    pub fn ack(&self, id: &MessageId) {
        self.inner.metrics.count(id.source_id.as_str(), "ack", 1);
        let sources = self.inner.sources.lock();
        match sources.get(&id.source_id) {
            Some(handle) => {
                let _ = handle.feedback_tx.send(Feedback::Ack(id.clone()));
            }
            None => debug!("dropping ack for retired source {}", id.source_id),
        }
    }

    pub fn fail(&self, id: &MessageId) {
        self.inner.metrics.count(id.source_id.as_str(), "fail", 1);
        let sources = self.inner.sources.lock();
        match sources.get(&id.source_id) {
            Some(handle) => {
                let _ = handle.feedback_tx.send(Feedback::Fail(id.clone()));
            }
            None => warn!("fail for retired source {}, nothing to do", id.source_id),
        }
    }

    pub fn firehose(&self) -> Option<FirehoseHandle> {
        self.inner.firehose.lock().clone()
    }

    pub fn has_source(&self, source_id: &SourceId) -> bool {
        self.inner.sources.lock().contains_key(source_id)
    }

    pub fn source_count(&self) -> usize {
        self.inner.sources.lock().len()
    }

    /// Request stop everywhere and join the workers, abandoning any that do
    /// not exit within the per-source timeout.
    pub async fn close(&self) {
        let handles: Vec<(SourceId, SourceHandle)> =
            self.inner.sources.lock().drain().collect();
        for (_, handle) in &handles {
            handle.stop.store(true, Ordering::Release);
        }
        for (source_id, mut handle) in handles {
            let Some(join) = handle.join.take() else {
                continue;
            };
            match tokio::time::timeout(JOIN_TIMEOUT, join).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("worker for {source_id} crashed: {err}"),
                Err(_) => warn!(
                    "worker for {source_id} ignored stop for {JOIN_TIMEOUT:?}, abandoning"
                ),
            }
        }
        *self.inner.firehose.lock() = None;
        info!("coordinator closed");
    }
}

fn apply_feedback(source: &mut VirtualSource, feedback: Feedback) {
    match feedback {
        Feedback::Ack(id) => source.ack(&id),
        Feedback::Fail(id) => source.fail(&id),
    }
}

fn deregister<C: Clock>(inner: &Weak<Inner<C>>, source_id: &SourceId) {
    if let Some(inner) = inner.upgrade() {
        inner.sources.lock().remove(source_id);
        inner.buffer.remove_source(source_id);
    }
}

/// The per-source worker loop. Sole owner of the virtual source.
async fn run_worker<C: Clock>(
    mut source: VirtualSource,
    inner: Weak<Inner<C>>,
    mut feedback_rx: mpsc::UnboundedReceiver<Feedback>,
    ready: Option<oneshot::Sender<Result<(), String>>>,
) {
    let source_id = source.source_id().clone();
    let (buffer, metrics, clock, flush_interval) = match inner.upgrade() {
        Some(inner) => (
            Arc::clone(&inner.buffer),
            Arc::clone(&inner.metrics),
            inner.clock.clone(),
            inner.config.flush_interval(),
        ),
        None => return,
    };

    if let Err(err) = source.open() {
        error!("opening source {source_id} failed: {err:#}");
        if let Some(ready) = ready {
            let _ = ready.send(Err(format!("{err:#}")));
        }
        deregister(&inner, &source_id);
        return;
    }
    if let Some(ready) = ready {
        let _ = ready.send(Ok(()));
    }

    let mut last_flush = clock.now();
    loop {
        while let Ok(feedback) = feedback_rx.try_recv() {
            apply_feedback(&mut source, feedback);
        }
        if source.stop_requested() {
            break;
        }
        if clock.now().saturating_duration_since(last_flush) >= flush_interval {
            let flush_started = clock.now();
            source.flush();
            metrics.timer(
                source_id.as_str(),
                "flush",
                clock.now().saturating_duration_since(flush_started),
            );
            metrics.gauge(source_id.as_str(), "buffer-depth", buffer.size() as f64);
            last_flush = clock.now();
        }
        match source.next_message() {
            Some(message) => {
                metrics.count(source_id.as_str(), "emit", 1);
                let mut pending = Some(message);
                while let Some(message) = pending.take() {
                    match buffer.put_timeout(message, PUT_RETRY).await {
                        Ok(()) => {}
                        Err(back) => {
                            if source.stop_requested() {
                                debug!(
                                    source = %source_id,
                                    "stop requested; dropping undelivered message"
                                );
                                break;
                            }
                            // Flush stays on schedule even while blocked on
                            // a full buffer.
                            if clock.now().saturating_duration_since(last_flush)
                                >= flush_interval
                            {
                                source.flush();
                                last_flush = clock.now();
                            }
                            pending = Some(back);
                        }
                    }
                }
            }
            None => tokio::time::sleep(IDLE_BACKOFF).await,
        }
    }

    // Feedback that raced the stop still lands before the final flush.
    while let Ok(feedback) = feedback_rx.try_recv() {
        apply_feedback(&mut source, feedback);
    }
    source.close();
    deregister(&inner, &source_id);
    info!(source = %source_id, "source worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{BrokerConfig, ConsumerConfig, TaskContext};
    use crate::core::registry::ComponentRegistry;
    use crate::core::time::SystemClock;
    use crate::log::client::InMemoryLogBroker;
    use crate::messaging::buffer::RoundRobinBuffer;
    use crate::ops::metrics::NoopMetrics;
    use crate::sideline::factory::VirtualSourceFactory;
    use crate::storage::memory::InMemoryPersistenceAdapter;
    use crate::storage::PersistenceAdapter;

    struct Rig {
        coordinator: SourceCoordinator<SystemClock>,
        factory: VirtualSourceFactory<SystemClock>,
        broker: InMemoryLogBroker,
    }

    fn rig() -> Rig {
        let config = Arc::new(SidelineConfig {
            broker: BrokerConfig {
                hosts: vec![],
                topic: "events".into(),
                client: "in-memory".into(),
            },
            consumer: ConsumerConfig {
                id_prefix: "spout".into(),
                deserializer: "utf8".into(),
            },
            persistence: Default::default(),
            retry: Default::default(),
            buffer: Default::default(),
            flush_interval_ms: 20,
            output_stream_id: None,
        });
        let registry = Arc::new(ComponentRegistry::with_defaults());
        let broker = registry.embedded_broker().clone();
        let persistence = InMemoryPersistenceAdapter::new();
        persistence.open().unwrap();
        let persistence: Arc<dyn crate::storage::PersistenceAdapter> = Arc::new(persistence);
        let metrics: Arc<dyn MetricsRecorder> = Arc::new(NoopMetrics);
        let coordinator = SourceCoordinator::new(
            Arc::clone(&config),
            Arc::new(RoundRobinBuffer::new(64).unwrap()),
            Arc::clone(&metrics),
            SystemClock,
        );
        let factory = VirtualSourceFactory::new(
            config,
            registry,
            persistence,
            metrics,
            SystemClock,
            TaskContext::default(),
        );
        Rig {
            coordinator,
            factory,
            broker,
        }
    }

    async fn next_with_timeout(coordinator: &SourceCoordinator<SystemClock>) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if let Some(message) = coordinator.next_message() {
                return Some(message);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        None
    }

    #[tokio::test]
    async fn firehose_messages_flow_through_the_buffer() {
        let rig = rig();
        rig.broker.produce("events", 0, None, b"hello");
        rig.coordinator
            .open(rig.factory.create_firehose().unwrap())
            .await
            .unwrap();
        let message = next_with_timeout(&rig.coordinator).await.unwrap();
        assert_eq!(message.values[1], "hello");
        rig.coordinator.ack(&message.id);
        rig.coordinator.close().await;
    }

    #[tokio::test]
    async fn double_open_and_duplicate_sources_are_rejected() {
        let rig = rig();
        rig.coordinator
            .open(rig.factory.create_firehose().unwrap())
            .await
            .unwrap();
        assert!(rig
            .coordinator
            .open(rig.factory.create_firehose().unwrap())
            .await
            .is_err());
        // The firehose id is taken.
        let duplicate = rig.factory.create_firehose().unwrap();
        let err = rig.coordinator.add_replay_source(duplicate).unwrap_err();
        assert!(err.downcast_ref::<SourceError>().is_some());
        rig.coordinator.close().await;
    }

    #[tokio::test]
    async fn completed_replay_sources_deregister_themselves() {
        let rig = rig();
        rig.broker.produce("events", 0, None, b"a");
        rig.coordinator
            .open(rig.factory.create_firehose().unwrap())
            .await
            .unwrap();
        let sideline = crate::sideline::SidelineId::generate();
        let starting: crate::log::OffsetMap =
            [(crate::log::TopicPartition::new("events", 0), -1)]
                .into_iter()
                .collect();
        let ending = starting.clone();
        let replay = rig
            .factory
            .create_replay(sideline.clone(), vec![], starting, ending)
            .unwrap();
        let replay_id = replay.source_id().clone();
        rig.coordinator.add_replay_source(replay).unwrap();
        // Empty range: the bounded source completes on its first flush tick
        // and its worker deregisters it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while rig.coordinator.has_source(&replay_id)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!rig.coordinator.has_source(&replay_id));
        rig.coordinator.close().await;
    }

    #[tokio::test]
    async fn acks_for_retired_sources_are_dropped() {
        let rig = rig();
        rig.coordinator
            .open(rig.factory.create_firehose().unwrap())
            .await
            .unwrap();
        let ghost = MessageId::new("events", 0, 0, SourceId::from("spout-0_gone"));
        rig.coordinator.ack(&ghost);
        rig.coordinator.fail(&ghost);
        rig.coordinator.close().await;
    }

    #[tokio::test]
    async fn close_stops_the_workers() {
        let rig = rig();
        rig.coordinator
            .open(rig.factory.create_firehose().unwrap())
            .await
            .unwrap();
        assert_eq!(rig.coordinator.source_count(), 1);
        rig.coordinator.close().await;
        assert_eq!(rig.coordinator.source_count(), 0);
        assert!(rig.coordinator.next_message().is_none());
    }
}
