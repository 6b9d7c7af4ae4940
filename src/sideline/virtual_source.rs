//! A virtual source: one logical producer of messages with its own consumer,
//! filter chain, and retry state. Many virtual sources live and die inside a
//! running stream; the firehose is merely the one without an ending state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::log::consumer::{ConsumerStateHandle, LogConsumer};
use crate::log::deserializer::Deserializer;
use crate::log::OffsetMap;
use crate::messaging::filter::SharedFilterChain;
use crate::messaging::retry::RetryPolicy;
use crate::messaging::{Message, MessageId, SourceId};
use crate::ops::metrics::MetricsRecorder;
use crate::sideline::SidelineId;
use crate::storage::PersistenceAdapter;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("virtual source {0} cannot be opened twice")]
    AlreadyOpened(SourceId),
    #[error("a virtual source named {0} is already registered")]
    DuplicateSource(SourceId),
}

/// Lifecycle of a virtual source. Bounded sources move to `Completing` on
/// their own once their ending state is fully acknowledged; the firehose
/// only leaves `Running` on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    New,
    Running,
    Completing,
    Closed,
}

pub(crate) struct VirtualSourceParts {
    pub source_id: SourceId,
    pub consumer: LogConsumer,
    pub deserializer: Arc<dyn Deserializer>,
    pub retry: Box<dyn RetryPolicy>,
    pub filter_chain: Arc<SharedFilterChain>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub starting_state: Option<OffsetMap>,
    pub ending_state: Option<OffsetMap>,
    pub sideline_id: Option<SidelineId>,
}

pub struct VirtualSource {
    source_id: SourceId,
    consumer: LogConsumer,
    deserializer: Arc<dyn Deserializer>,
    retry: Box<dyn RetryPolicy>,
    filter_chain: Arc<SharedFilterChain>,
    persistence: Arc<dyn PersistenceAdapter>,
    metrics: Arc<dyn MetricsRecorder>,
    starting_state: Option<OffsetMap>,
    ending_state: Option<OffsetMap>,
    sideline_id: Option<SidelineId>,
    tracked: HashMap<MessageId, Message>,
    state: SourceState,
    stop_requested: Arc<AtomicBool>,
}

impl VirtualSource {
    pub(crate) fn from_parts(parts: VirtualSourceParts) -> Self {
        Self {
            source_id: parts.source_id,
            consumer: parts.consumer,
            deserializer: parts.deserializer,
            retry: parts.retry,
            filter_chain: parts.filter_chain,
            persistence: parts.persistence,
            metrics: parts.metrics,
            starting_state: parts.starting_state,
            ending_state: parts.ending_state,
            sideline_id: parts.sideline_id,
            tracked: HashMap::new(),
            state: SourceState::New,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the underlying consumer at the starting state. Exactly once.
    pub fn open(&mut self) -> anyhow::Result<()> {
        if self.state != SourceState::New {
            return Err(SourceError::AlreadyOpened(self.source_id.clone()).into());
        }
        info!(
            source = %self.source_id,
            starting = %self.starting_state.clone().unwrap_or_default(),
            ending = %self.ending_state.clone().unwrap_or_default(),
            "opening virtual source"
        );
        self.consumer.open(self.starting_state.as_ref())?;
        self.state = SourceState::Running;
        Ok(())
    }

    /// The next message to hand downstream, or `None` when nothing is ready.
    pub fn next_message(&mut self) -> Option<Message> {
        // Failed messages whose backoff has elapsed replay first.
        if let Some(retry_id) = self.retry.next_eligible() {
            if let Some(message) = self.tracked.get(&retry_id) {
                self.metrics
                    .count(self.source_id.as_str(), "retry-emit", 1);
                return Some(message.clone());
            }
            warn!(
                source = %self.source_id,
                "retry policy yielded untracked message {retry_id}, dropping"
            );
            self.retry.acked(&retry_id);
        }

        let record = self.consumer.next_record()?;
        let id = MessageId::new(
            record.topic.clone(),
            record.partition,
            record.offset,
            self.source_id.clone(),
        );

        if self.exceeds_ending_offset(&id) {
            debug!(source = %self.source_id, "{id} exceeds the ending offset");
            let partition = id.topic_partition();
            // Never emitted, never committed: drop it from progress so it
            // cannot gate completion, then stop reading the partition.
            self.consumer.discard_offset(&partition, id.offset);
            self.consumer.unsubscribe_partition(&partition);
            return None;
        }

        let values = self.deserializer.deserialize(
            &record.topic,
            record.partition,
            record.offset,
            record.key.as_deref(),
            &record.value,
        );
        let Some(values) = values else {
            error!(source = %self.source_id, "deserialization returned nothing for {id}");
            self.metrics
                .count(self.source_id.as_str(), "deserialize-failed", 1);
            self.ack(&id);
            return None;
        };

        let message = Message::new(id.clone(), values);
        if self.filter_chain.matches(&message) {
            // Diverted: acknowledge so the offset floor moves past it.
            self.metrics.count(self.source_id.as_str(), "filtered", 1);
            self.ack(&id);
            return None;
        }

        self.tracked.insert(id, message.clone());
        Some(message)
    }

    fn exceeds_ending_offset(&self, id: &MessageId) -> bool {
        let Some(ending) = &self.ending_state else {
            return false;
        };
        match ending.get(&id.topic_partition()) {
            Some(end) => id.offset > end,
            None => {
                error!(
                    source = %self.source_id,
                    "bounded source polled {} which has no ending offset",
                    id.topic_partition()
                );
                true
            }
        }
    }

    /// Mark a message fully processed. Idempotent.
    pub fn ack(&mut self, id: &MessageId) {
        self.consumer.commit_offset(&id.topic_partition(), id.offset);
        self.tracked.remove(id);
        self.retry.acked(id);
    }

    /// Record a downstream failure; gives up (and acknowledges) once the
    /// retry policy is exhausted so one poison record cannot stall progress.
    pub fn fail(&mut self, id: &MessageId) {
        if !self.retry.retry_further(id) {
            warn!(source = %self.source_id, "not retrying failed message {id} any further");
            self.metrics
                .count(self.source_id.as_str(), "retry-exhausted", 1);
            self.ack(id);
            return;
        }
        self.retry.failed(id);
    }

    /// Maintenance tick: persist offset floors, then see whether a bounded
    /// source has drained its range.
    pub fn flush(&mut self) {
        if let Err(err) = self.consumer.flush_offsets() {
            warn!(source = %self.source_id, "offset flush failed: {err}");
            self.metrics
                .count(self.source_id.as_str(), "flush-failed", 1);
        }
        self.attempt_complete();
    }

    fn attempt_complete(&mut self) {
        if self.state != SourceState::Running {
            return;
        }
        let Some(ending) = self.ending_state.clone() else {
            return;
        };
        if !self.tracked.is_empty() {
            return;
        }
        let current = self.consumer.current_state();
        for (partition, floor) in current.iter() {
            let Some(end) = ending.get(partition) else {
                continue;
            };
            if floor < end {
                return;
            }
            self.consumer.unsubscribe_partition(partition);
        }
        info!(source = %self.source_id, "bounded source drained its range");
        self.state = SourceState::Completing;
        self.request_stop();
    }

    /// Release the source. A completed bounded source clears its persisted
    /// consumer offsets and sideline request entries; anything else flushes
    /// its offsets one last time.
    pub fn close(&mut self) {
        match self.state {
            SourceState::Closed => return,
            SourceState::Completing => {
                if let Err(err) = self.consumer.remove_consumer_state() {
                    warn!(source = %self.source_id, "failed clearing consumer state: {err}");
                }
                if let (Some(sideline_id), Some(starting)) =
                    (&self.sideline_id, &self.starting_state)
                {
                    for partition in starting.partitions() {
                        if let Err(err) = self
                            .persistence
                            .clear_sideline_request(sideline_id, partition.partition)
                        {
                            warn!(
                                source = %self.source_id,
                                "failed clearing sideline request {sideline_id}: {err}"
                            );
                        }
                    }
                }
            }
            _ => {
                if let Err(err) = self.consumer.flush_offsets() {
                    warn!(source = %self.source_id, "final offset flush failed: {err}");
                }
            }
        }
        self.state = SourceState::Closed;
        info!(source = %self.source_id, "virtual source closed");
    }

    /// Ask this source to stop cleanly. Safe from any thread.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    pub fn current_state(&self) -> OffsetMap {
        self.consumer.current_state()
    }

    pub fn state_handle(&self) -> ConsumerStateHandle {
        self.consumer.state_handle()
    }

    pub fn filter_chain(&self) -> Arc<SharedFilterChain> {
        Arc::clone(&self.filter_chain)
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn sideline_id(&self) -> Option<&SidelineId> {
        self.sideline_id.as_ref()
    }

    pub fn is_bounded(&self) -> bool {
        self.ending_state.is_some()
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }
}
