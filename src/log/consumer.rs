//! Partitioned log consumer: wraps a broker client, tracks committed and
//! pending offsets per partition, and flushes committed floors through the
//! persistence adapter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::log::client::LogClient;
use crate::log::{LogRecord, OffsetMap, TopicPartition};
use crate::messaging::SourceId;
use crate::storage::{PersistenceAdapter, PersistenceError};

/// Offset bookkeeping for one partition.
///
/// The floor is the highest offset such that every polled offset at or below
/// it has been committed; it is what gets persisted and what seeds the next
/// run. Robust to out-of-order commits, duplicate commits, and offset gaps.
#[derive(Debug)]
pub(crate) struct PartitionProgress {
    floor: i64,
    in_flight: BTreeSet<i64>,
    committed: BTreeSet<i64>,
}

impl PartitionProgress {
    fn new(floor: i64) -> Self {
        Self {
            floor,
            in_flight: BTreeSet::new(),
            committed: BTreeSet::new(),
        }
    }

    fn begin(&mut self, offset: i64) {
        if offset > self.floor {
            self.in_flight.insert(offset);
        }
    }

    fn finish(&mut self, offset: i64) {
        if !self.in_flight.remove(&offset) {
            // Duplicate or unknown commit; the floor stays monotone.
            return;
        }
        self.committed.insert(offset);
        // The floor may advance over every committed offset below the lowest
        // offset still in flight.
        while let Some(&lowest) = self.committed.first() {
            let blocked = self
                .in_flight
                .first()
                .is_some_and(|&in_flight| in_flight < lowest);
            if blocked {
                break;
            }
            self.floor = lowest;
            self.committed.pop_first();
        }
    }

    fn abandon(&mut self, offset: i64) {
        self.in_flight.remove(&offset);
    }

    fn floor(&self) -> i64 {
        self.floor
    }
}

/// Snapshot access to a consumer's committed floors from other threads.
#[derive(Clone)]
pub struct ConsumerStateHandle {
    progress: Arc<Mutex<BTreeMap<TopicPartition, PartitionProgress>>>,
}

impl ConsumerStateHandle {
    pub fn current_state(&self) -> OffsetMap {
        let progress = self.progress.lock();
        progress
            .iter()
            .map(|(partition, state)| (partition.clone(), state.floor()))
            .collect()
    }
}

pub struct LogConsumer {
    client: Box<dyn LogClient>,
    persistence: Arc<dyn PersistenceAdapter>,
    source_id: SourceId,
    topic: String,
    total_tasks: usize,
    task_index: usize,
    progress: Arc<Mutex<BTreeMap<TopicPartition, PartitionProgress>>>,
    assigned: Vec<TopicPartition>,
}

impl LogConsumer {
    pub fn new(
        client: Box<dyn LogClient>,
        persistence: Arc<dyn PersistenceAdapter>,
        source_id: SourceId,
        topic: impl Into<String>,
        total_tasks: usize,
        task_index: usize,
    ) -> Self {
        Self {
            client,
            persistence,
            source_id,
            topic: topic.into(),
            total_tasks: total_tasks.max(1),
            task_index,
            progress: Arc::new(Mutex::new(BTreeMap::new())),
            assigned: Vec::new(),
        }
    }

    /// Claim this task's partitions and position each one.
    ///
    /// The effective floor per partition is the persisted consumer offset if
    /// one exists, else the provided starting state, else one before the
    /// broker-resolved earliest offset; reading resumes at `floor + 1`.
    pub fn open(&mut self, starting_state: Option<&OffsetMap>) -> Result<()> {
        let claimed: Vec<TopicPartition> = self
            .client
            .partitions(&self.topic)
            .into_iter()
            .filter(|partition| (*partition as usize) % self.total_tasks == self.task_index)
            .map(|partition| TopicPartition::new(self.topic.clone(), partition))
            .collect();
        self.client.assign(&claimed);

        let mut progress = self.progress.lock();
        for partition in &claimed {
            let persisted = self
                .persistence
                .retrieve_consumer_offset(&self.source_id, partition.partition)
                .with_context(|| format!("retrieve offset for {partition}"))?;
            let floor = persisted
                .or_else(|| starting_state.and_then(|state| state.get(partition)))
                .unwrap_or_else(|| self.client.earliest_offset(partition) - 1);
            self.client.seek(partition, floor + 1);
            progress.insert(partition.clone(), PartitionProgress::new(floor));
        }
        drop(progress);

        info!(
            source = %self.source_id,
            partitions = claimed.len(),
            "consumer opened on {}",
            self.topic
        );
        self.assigned = claimed;
        Ok(())
    }

    /// Non-blocking poll across the subscribed partitions.
    pub fn next_record(&mut self) -> Option<LogRecord> {
        let record = self.client.poll()?;
        if let Some(progress) = self.progress.lock().get_mut(&record.topic_partition()) {
            progress.begin(record.offset);
        }
        Some(record)
    }

    /// Mark an offset fully processed. The persisted floor only advances at
    /// `flush_offsets` cadence.
    pub fn commit_offset(&self, partition: &TopicPartition, offset: i64) {
        if let Some(progress) = self.progress.lock().get_mut(partition) {
            progress.finish(offset);
        }
    }

    /// Forget a polled-but-never-emitted offset so it cannot gate completion.
    pub fn discard_offset(&self, partition: &TopicPartition, offset: i64) {
        if let Some(progress) = self.progress.lock().get_mut(partition) {
            progress.abandon(offset);
        }
    }

    /// Persist the committed floor of every claimed partition.
    pub fn flush_offsets(&self) -> Result<(), PersistenceError> {
        let floors: Vec<(i32, i64)> = {
            let progress = self.progress.lock();
            progress
                .iter()
                .map(|(partition, state)| (partition.partition, state.floor()))
                .collect()
        };
        for (partition, floor) in floors {
            self.persistence
                .persist_consumer_offset(&self.source_id, partition, floor)?;
        }
        Ok(())
    }

    /// Committed floors, snapshotted under a short lock.
    pub fn current_state(&self) -> OffsetMap {
        self.state_handle().current_state()
    }

    pub fn state_handle(&self) -> ConsumerStateHandle {
        ConsumerStateHandle {
            progress: Arc::clone(&self.progress),
        }
    }

    /// Remove a partition from active polling. Idempotent; returns whether a
    /// change occurred. Progress is kept so `current_state` stays complete.
    pub fn unsubscribe_partition(&mut self, partition: &TopicPartition) -> bool {
        let changed = self.client.unassign(partition);
        if changed {
            debug!(source = %self.source_id, "unsubscribed from {partition}");
        }
        changed
    }

    pub fn assigned_partitions(&self) -> &[TopicPartition] {
        &self.assigned
    }

    /// Clear persisted offsets for this source across all claimed partitions.
    pub fn remove_consumer_state(&self) -> Result<(), PersistenceError> {
        for partition in &self.assigned {
            self.persistence
                .clear_consumer_offset(&self.source_id, partition.partition)?;
        }
        Ok(())
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::client::InMemoryLogBroker;
    use crate::storage::memory::InMemoryPersistenceAdapter;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    fn adapter() -> Arc<dyn PersistenceAdapter> {
        let adapter = InMemoryPersistenceAdapter::new();
        adapter.open().unwrap();
        Arc::new(adapter)
    }

    fn consumer(broker: &InMemoryLogBroker, persistence: Arc<dyn PersistenceAdapter>) -> LogConsumer {
        LogConsumer::new(
            Box::new(broker.client()),
            persistence,
            SourceId::from("firehose-0"),
            "events",
            1,
            0,
        )
    }

    #[test]
    fn floor_advances_only_over_the_contiguous_prefix() {
        let mut progress = PartitionProgress::new(-1);
        for offset in 0..4 {
            progress.begin(offset);
        }
        progress.finish(1);
        progress.finish(3);
        assert_eq!(progress.floor(), -1);
        progress.finish(0);
        assert_eq!(progress.floor(), 1);
        progress.finish(2);
        assert_eq!(progress.floor(), 3);
    }

    #[test]
    fn duplicate_commits_do_not_move_the_floor() {
        let mut progress = PartitionProgress::new(-1);
        progress.begin(0);
        progress.finish(0);
        assert_eq!(progress.floor(), 0);
        progress.finish(0);
        progress.finish(17);
        assert_eq!(progress.floor(), 0);
    }

    #[test]
    fn floor_handles_offset_gaps() {
        let mut progress = PartitionProgress::new(-1);
        // Compacted topic: offsets 0, 2, 5.
        for offset in [0, 2, 5] {
            progress.begin(offset);
        }
        progress.finish(0);
        progress.finish(5);
        assert_eq!(progress.floor(), 0);
        progress.finish(2);
        assert_eq!(progress.floor(), 5);
    }

    #[test]
    fn open_prefers_persisted_offsets_over_starting_state() {
        let broker = InMemoryLogBroker::new();
        for value in [b"a", b"b", b"c", b"d"] {
            broker.produce("events", 0, None, value);
        }
        let persistence = adapter();
        persistence
            .persist_consumer_offset(&SourceId::from("firehose-0"), 0, 1)
            .unwrap();
        let mut consumer = consumer(&broker, persistence);
        let starting: OffsetMap = [(tp(0), 0)].into_iter().collect();
        consumer.open(Some(&starting)).unwrap();
        // Persisted floor 1 wins: next record is offset 2.
        assert_eq!(consumer.next_record().unwrap().offset, 2);
        assert_eq!(consumer.current_state().get(&tp(0)), Some(1));
    }

    #[test]
    fn open_falls_back_to_starting_state_then_earliest() {
        let broker = InMemoryLogBroker::new();
        broker.create_topic("events", 2);
        for value in [b"a", b"b", b"c"] {
            broker.produce("events", 0, None, value);
            broker.produce("events", 1, None, value);
        }
        let mut consumer = consumer(&broker, adapter());
        let starting: OffsetMap = [(tp(0), 1)].into_iter().collect();
        consumer.open(Some(&starting)).unwrap();
        let mut first_offsets = BTreeMap::new();
        while let Some(record) = consumer.next_record() {
            first_offsets
                .entry(record.partition)
                .or_insert(record.offset);
        }
        // Partition 0 resumes after the starting state, partition 1 from
        // the earliest offset.
        assert_eq!(first_offsets.get(&0), Some(&2));
        assert_eq!(first_offsets.get(&1), Some(&0));
    }

    #[test]
    fn partition_claims_follow_task_modulo() {
        let broker = InMemoryLogBroker::new();
        broker.create_topic("events", 4);
        let persistence = adapter();
        let mut consumer = LogConsumer::new(
            Box::new(broker.client()),
            persistence,
            SourceId::from("firehose-1"),
            "events",
            2,
            1,
        );
        consumer.open(None).unwrap();
        assert_eq!(consumer.assigned_partitions(), &[tp(1), tp(3)]);
    }

    #[test]
    fn flush_persists_floors_and_remove_clears_them() {
        let broker = InMemoryLogBroker::new();
        for value in [b"a", b"b"] {
            broker.produce("events", 0, None, value);
        }
        let persistence = adapter();
        let mut consumer = consumer(&broker, Arc::clone(&persistence));
        consumer.open(None).unwrap();
        let first = consumer.next_record().unwrap();
        consumer.commit_offset(&first.topic_partition(), first.offset);
        consumer.flush_offsets().unwrap();
        assert_eq!(
            persistence
                .retrieve_consumer_offset(&SourceId::from("firehose-0"), 0)
                .unwrap(),
            Some(0)
        );
        consumer.remove_consumer_state().unwrap();
        assert_eq!(
            persistence
                .retrieve_consumer_offset(&SourceId::from("firehose-0"), 0)
                .unwrap(),
            None
        );
    }

    #[test]
    fn unsubscribe_stops_polling_but_keeps_state() {
        let broker = InMemoryLogBroker::new();
        broker.create_topic("events", 2);
        broker.produce("events", 0, None, b"a");
        broker.produce("events", 1, None, b"b");
        let mut consumer = consumer(&broker, adapter());
        consumer.open(None).unwrap();
        assert!(consumer.unsubscribe_partition(&tp(0)));
        assert!(!consumer.unsubscribe_partition(&tp(0)));
        let record = consumer.next_record().unwrap();
        assert_eq!(record.partition, 1);
        assert!(consumer.next_record().is_none());
        assert!(consumer.current_state().get(&tp(0)).is_some());
    }
}
