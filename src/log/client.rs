//! Broker client boundary.
//!
//! The consumer owns a [`LogClient`] and drives it through this trait;
//! transient broker faults are the client's problem and surface here only as
//! empty polls. The in-memory broker/client pair backs tests and embedded
//! use.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{LogRecord, TopicPartition};

/// Minimal per-partition view of a broker consumer: assignment, seeking,
/// non-blocking polling, and per-partition unsubscribe.
pub trait LogClient: Send {
    /// Partition indexes currently existing for a topic.
    fn partitions(&self, topic: &str) -> Vec<i32>;

    /// Replace the active assignment.
    fn assign(&mut self, partitions: &[TopicPartition]);

    /// Position the next read for a partition at `offset`.
    fn seek(&mut self, partition: &TopicPartition, offset: i64);

    /// Earliest available offset for a partition (the broker-resolved
    /// default starting position).
    fn earliest_offset(&self, partition: &TopicPartition) -> i64;

    /// Next record across any assigned partition, or `None` when nothing is
    /// ready. No cross-partition ordering is implied.
    fn poll(&mut self) -> Option<LogRecord>;

    /// Remove a partition from the assignment; returns whether anything
    /// changed. Idempotent.
    fn unassign(&mut self, partition: &TopicPartition) -> bool;
}

#[derive(Default)]
struct BrokerState {
    // topic -> partition -> records (offset == index).
    topics: HashMap<String, BTreeMap<i32, Vec<(Option<Bytes>, Bytes)>>>,
}

/// Shared in-memory log. Clones see the same data, so a test can keep
/// producing while consumers poll.
#[derive(Clone, Default)]
pub struct InMemoryLogBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryLogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state.lock();
        let entry = state.topics.entry(topic.to_string()).or_default();
        for partition in 0..partitions {
            entry.entry(partition).or_default();
        }
    }

    /// Append a record; returns its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> i64 {
        let mut state = self.state.lock();
        let records = state
            .topics
            .entry(topic.to_string())
            .or_default()
            .entry(partition)
            .or_default();
        records.push((
            key.map(Bytes::copy_from_slice),
            Bytes::copy_from_slice(value),
        ));
        (records.len() - 1) as i64
    }

    pub fn latest_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state.lock();
        let records = state.topics.get(topic)?.get(&partition)?;
        if records.is_empty() {
            None
        } else {
            Some((records.len() - 1) as i64)
        }
    }

    pub fn client(&self) -> InMemoryLogClient {
        InMemoryLogClient {
            broker: self.clone(),
            assigned: Vec::new(),
            positions: HashMap::new(),
            next_partition: 0,
        }
    }
}

/// One consumer over an [`InMemoryLogBroker`], round-robining its assigned
/// partitions on poll.
pub struct InMemoryLogClient {
    broker: InMemoryLogBroker,
    assigned: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    next_partition: usize,
}

impl LogClient for InMemoryLogClient {
    fn partitions(&self, topic: &str) -> Vec<i32> {
        let state = self.broker.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.keys().copied().collect())
            .unwrap_or_default()
    }

    fn assign(&mut self, partitions: &[TopicPartition]) {
        self.assigned = partitions.to_vec();
        self.next_partition = 0;
        for partition in &self.assigned {
            self.positions.entry(partition.clone()).or_insert(0);
        }
    }

    fn seek(&mut self, partition: &TopicPartition, offset: i64) {
        self.positions.insert(partition.clone(), offset.max(0));
    }

    fn earliest_offset(&self, _partition: &TopicPartition) -> i64 {
        0
    }

    fn poll(&mut self) -> Option<LogRecord> {
        let state = self.broker.state.lock();
        let count = self.assigned.len();
        for step in 0..count {
            let index = (self.next_partition + step) % count;
            let partition = self.assigned[index].clone();
            let position = self.positions.get(&partition).copied().unwrap_or(0);
            let record = state
                .topics
                .get(&partition.topic)
                .and_then(|topic| topic.get(&partition.partition))
                .and_then(|records| records.get(position as usize));
            if let Some((key, value)) = record {
                let record = LogRecord {
                    topic: partition.topic.clone(),
                    partition: partition.partition,
                    offset: position,
                    key: key.clone(),
                    value: value.clone(),
                };
                self.positions.insert(partition, position + 1);
                self.next_partition = (index + 1) % count;
                return Some(record);
            }
        }
        None
    }

    fn unassign(&mut self, partition: &TopicPartition) -> bool {
        let before = self.assigned.len();
        self.assigned.retain(|assigned| assigned != partition);
        self.next_partition = 0;
        before != self.assigned.len()
    }
}
