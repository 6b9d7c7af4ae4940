//! Message identity and in-flight message types.

pub mod buffer;
pub mod filter;
pub mod retry;

use std::fmt;

use crate::log::TopicPartition;

/// Identifier of one virtual source within a running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque handle the host hands back in ack/fail. Globally unique across the
/// running process: (topic, partition, offset) is unique per source, and the
/// source id disambiguates the firehose from replay sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub source_id: SourceId,
}

impl MessageId {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, source_id: SourceId) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            source_id,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}:{}@{}",
            self.topic, self.partition, self.offset, self.source_id
        )
    }
}

/// A deserialized record plus its identity. Lives from emission until it is
/// acked or permanently failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub values: Vec<serde_json::Value>,
}

impl Message {
    pub fn new(id: MessageId, values: Vec<serde_json::Value>) -> Self {
        Self { id, values }
    }
}
