//! Value types for the partitioned, offset-addressed log.

pub mod client;
pub mod consumer;
pub mod deserializer;

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// A single partition of a named topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Per-partition offset bookkeeping.
///
/// An offset stored here is the last fully acknowledged offset for that
/// partition; the next offset to consume is `stored + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap {
    offsets: BTreeMap<TopicPartition, i64>,
}

impl OffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets.get(partition).copied()
    }

    pub fn set(&mut self, partition: TopicPartition, offset: i64) {
        self.offsets.insert(partition, offset);
    }

    /// Overwrite per-partition entries with `other`'s value where present.
    pub fn merge(&mut self, other: &OffsetMap) {
        for (partition, offset) in &other.offsets {
            self.offsets.insert(partition.clone(), *offset);
        }
    }

    /// Per-partition lag of `self` behind `other` (`other - self`), over the
    /// union of both partition sets. Missing entries count as offset zero.
    pub fn compare(&self, other: &OffsetMap) -> BTreeMap<TopicPartition, i64> {
        let mut lag = BTreeMap::new();
        for partition in self.offsets.keys().chain(other.offsets.keys()) {
            if lag.contains_key(partition) {
                continue;
            }
            let ours = self.get(partition).unwrap_or(0);
            let theirs = other.get(partition).unwrap_or(0);
            lag.insert(partition.clone(), theirs - ours);
        }
        lag
    }

    pub fn partitions(&self) -> impl Iterator<Item = &TopicPartition> {
        self.offsets.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPartition, i64)> {
        self.offsets.iter().map(|(p, o)| (p, *o))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl FromIterator<(TopicPartition, i64)> for OffsetMap {
    fn from_iter<T: IntoIterator<Item = (TopicPartition, i64)>>(iter: T) -> Self {
        Self {
            offsets: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for OffsetMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (partition, offset)) in self.offsets.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{partition}={offset}")?;
        }
        write!(f, "}}")
    }
}

/// A raw record as delivered by the broker client.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl LogRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}
