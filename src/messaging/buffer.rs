//! Bounded buffers between source workers and the host-facing output.
//!
//! `put` blocks (asynchronously) while the owning source's queue is full;
//! this is the sole backpressure mechanism. `poll` never blocks. Three
//! variants ship: a single shared FIFO, a fair per-source round-robin, and a
//! throttled round-robin whose per-source capacity depends on a source-id
//! regex.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::messaging::{Message, SourceId};

/// How long a blocked `put` waits between capacity re-checks.
const PUT_WAIT_CHUNK: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer capacity must be positive (got {0})")]
    InvalidCapacity(usize),
    #[error("invalid throttle pattern {pattern:?}: {detail}")]
    InvalidPattern { pattern: String, detail: String },
}

/// Bounded, per-source buffering with a single output.
#[async_trait]
pub trait MessageBuffer: Send + Sync {
    /// Register a source. Idempotent.
    fn add_source(&self, source_id: &SourceId);

    /// Deregister a source and drop anything still queued for it.
    fn remove_source(&self, source_id: &SourceId);

    /// Non-blocking insert; hands the message back when the queue is full.
    /// A source not yet added is added on first use.
    fn try_put(&self, message: Message) -> Result<(), Message>;

    /// Insert, waiting at most `wait` for capacity; hands the message back on
    /// timeout so a stopping worker is never wedged on a full buffer.
    async fn put_timeout(&self, message: Message, wait: Duration) -> Result<(), Message>;

    /// Insert, waiting as long as it takes.
    async fn put(&self, message: Message);

    /// Non-blocking removal of the next message, if any.
    fn poll(&self) -> Option<Message>;

    /// Total queued messages across all sources.
    fn size(&self) -> usize;
}

async fn put_with_deadline<B: MessageBuffer + ?Sized>(
    buffer: &B,
    space: &Notify,
    mut message: Message,
    wait: Duration,
) -> Result<(), Message> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match buffer.try_put(message) {
            Ok(()) => return Ok(()),
            Err(back) => message = back,
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(message);
        }
        let _ = tokio::time::timeout(remaining.min(PUT_WAIT_CHUNK), space.notified()).await;
    }
}

// ---------------------------------------------------------------------------
// FIFO
// ---------------------------------------------------------------------------

/// Single shared bounded queue across all sources.
pub struct FifoBuffer {
    capacity: usize,
    queue: Mutex<VecDeque<Message>>,
    space: Notify,
}

impl FifoBuffer {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity(capacity));
        }
        Ok(Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            space: Notify::new(),
        })
    }
}

#[async_trait]
impl MessageBuffer for FifoBuffer {
    fn add_source(&self, _source_id: &SourceId) {}

    fn remove_source(&self, source_id: &SourceId) {
        let mut queue = self.queue.lock();
        queue.retain(|m| m.id.source_id != *source_id);
        drop(queue);
        self.space.notify_waiters();
    }

    fn try_put(&self, message: Message) -> Result<(), Message> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(message);
        }
        queue.push_back(message);
        Ok(())
    }

    async fn put_timeout(&self, message: Message, wait: Duration) -> Result<(), Message> {
        put_with_deadline(self, &self.space, message, wait).await
    }

    async fn put(&self, mut message: Message) {
        loop {
            match self.put_timeout(message, PUT_WAIT_CHUNK).await {
                Ok(()) => return,
                Err(back) => message = back,
            }
        }
    }

    fn poll(&self) -> Option<Message> {
        let popped = self.queue.lock().pop_front();
        if popped.is_some() {
            self.space.notify_waiters();
        }
        popped
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Per-source round robin
// ---------------------------------------------------------------------------

enum CapacityPolicy {
    Uniform(usize),
    Throttled {
        size: usize,
        throttled_size: usize,
        pattern: Regex,
    },
}

impl CapacityPolicy {
    fn capacity_for(&self, source_id: &SourceId) -> usize {
        match self {
            Self::Uniform(size) => *size,
            Self::Throttled {
                size,
                throttled_size,
                pattern,
            } => {
                if pattern.is_match(source_id.as_str()) {
                    *throttled_size
                } else {
                    *size
                }
            }
        }
    }
}

#[derive(Default)]
struct PerSourceState {
    queues: HashMap<SourceId, VecDeque<Message>>,
    order: Vec<SourceId>,
    cursor: usize,
}

/// Register a queue for a source on first sight; the cursor resets so a
/// fresh iteration order includes it.
fn ensure_queue(state: &mut PerSourceState, source_id: &SourceId) {
    if let std::collections::hash_map::Entry::Vacant(entry) =
        state.queues.entry(source_id.clone())
    {
        entry.insert(VecDeque::new());
        state.order.push(source_id.clone());
        state.cursor = 0;
    }
}

struct SourceQueues {
    policy: CapacityPolicy,
    state: Mutex<PerSourceState>,
    space: Notify,
}

impl SourceQueues {
    fn new(policy: CapacityPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(PerSourceState::default()),
            space: Notify::new(),
        }
    }

    fn add(&self, source_id: &SourceId) {
        let mut state = self.state.lock();
        ensure_queue(&mut state, source_id);
    }

    fn remove(&self, source_id: &SourceId) {
        let mut state = self.state.lock();
        state.queues.remove(source_id);
        state.order.retain(|id| id != source_id);
        state.cursor = 0;
        drop(state);
        self.space.notify_waiters();
    }

    fn try_put(&self, message: Message) -> Result<(), Message> {
        let source_id = message.id.source_id.clone();
        let capacity = self.policy.capacity_for(&source_id);
        let mut state = self.state.lock();
        ensure_queue(&mut state, &source_id);
        let queue = state.queues.get_mut(&source_id).expect("queue just ensured");
        if queue.len() >= capacity {
            return Err(message);
        }
        queue.push_back(message);
        Ok(())
    }

    /// Advance the cursor across sources, skipping empty queues; one full
    /// cycle without a message yields nothing.
    fn poll(&self) -> Option<Message> {
        let mut state = self.state.lock();
        let count = state.order.len();
        for step in 0..count {
            let index = (state.cursor + step) % count;
            let source_id = state.order[index].clone();
            if let Some(message) = state
                .queues
                .get_mut(&source_id)
                .and_then(|queue| queue.pop_front())
            {
                state.cursor = (index + 1) % count;
                drop(state);
                self.space.notify_waiters();
                return Some(message);
            }
        }
        None
    }

    fn size(&self) -> usize {
        self.state.lock().queues.values().map(VecDeque::len).sum()
    }
}

/// Per-source bounded queues drained fairly in round-robin order.
pub struct RoundRobinBuffer {
    queues: SourceQueues,
}

impl RoundRobinBuffer {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity(capacity));
        }
        Ok(Self {
            queues: SourceQueues::new(CapacityPolicy::Uniform(capacity)),
        })
    }
}

#[async_trait]
impl MessageBuffer for RoundRobinBuffer {
    fn add_source(&self, source_id: &SourceId) {
        self.queues.add(source_id);
    }

    fn remove_source(&self, source_id: &SourceId) {
        self.queues.remove(source_id);
    }

    fn try_put(&self, message: Message) -> Result<(), Message> {
        self.queues.try_put(message)
    }

    async fn put_timeout(&self, message: Message, wait: Duration) -> Result<(), Message> {
        put_with_deadline(self, &self.queues.space, message, wait).await
    }

    async fn put(&self, mut message: Message) {
        loop {
            match self.put_timeout(message, PUT_WAIT_CHUNK).await {
                Ok(()) => return,
                Err(back) => message = back,
            }
        }
    }

    fn poll(&self) -> Option<Message> {
        self.queues.poll()
    }

    fn size(&self) -> usize {
        self.queues.size()
    }
}

/// Round-robin buffer whose sources get a small (throttled) capacity when
/// their id matches the configured pattern. Backpressure on `put` therefore
/// slows matched producers independently.
pub struct ThrottledBuffer {
    queues: SourceQueues,
}

impl ThrottledBuffer {
    pub fn new(size: usize, throttled_size: usize, pattern: &str) -> Result<Self, BufferError> {
        if size == 0 {
            return Err(BufferError::InvalidCapacity(size));
        }
        if throttled_size == 0 {
            return Err(BufferError::InvalidCapacity(throttled_size));
        }
        let pattern = Regex::new(pattern).map_err(|err| BufferError::InvalidPattern {
            pattern: pattern.to_string(),
            detail: err.to_string(),
        })?;
        Ok(Self {
            queues: SourceQueues::new(CapacityPolicy::Throttled {
                size,
                throttled_size,
                pattern,
            }),
        })
    }
}

#[async_trait]
impl MessageBuffer for ThrottledBuffer {
    fn add_source(&self, source_id: &SourceId) {
        self.queues.add(source_id);
    }

    fn remove_source(&self, source_id: &SourceId) {
        self.queues.remove(source_id);
    }

    fn try_put(&self, message: Message) -> Result<(), Message> {
        self.queues.try_put(message)
    }

    async fn put_timeout(&self, message: Message, wait: Duration) -> Result<(), Message> {
        put_with_deadline(self, &self.queues.space, message, wait).await
    }

    async fn put(&self, mut message: Message) {
        loop {
            match self.put_timeout(message, PUT_WAIT_CHUNK).await {
                Ok(()) => return,
                Err(back) => message = back,
            }
        }
    }

    fn poll(&self) -> Option<Message> {
        self.queues.poll()
    }

    fn size(&self) -> usize {
        self.queues.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageId;

    fn message(source: &str, offset: i64) -> Message {
        Message::new(
            MessageId::new("events", 0, offset, SourceId::from(source)),
            vec![offset.into()],
        )
    }

    #[test]
    fn fifo_preserves_order_and_capacity() {
        let buffer = FifoBuffer::new(2).unwrap();
        buffer.try_put(message("a", 0)).unwrap();
        buffer.try_put(message("a", 1)).unwrap();
        assert!(buffer.try_put(message("a", 2)).is_err());
        assert_eq!(buffer.poll().unwrap().id.offset, 0);
        assert_eq!(buffer.poll().unwrap().id.offset, 1);
        assert_eq!(buffer.poll(), None);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            FifoBuffer::new(0),
            Err(BufferError::InvalidCapacity(0))
        ));
        assert!(RoundRobinBuffer::new(0).is_err());
        assert!(ThrottledBuffer::new(10, 0, ".*").is_err());
    }

    #[test]
    fn round_robin_interleaves_sources() {
        let buffer = RoundRobinBuffer::new(10).unwrap();
        for offset in 0..3 {
            buffer.try_put(message("a", offset)).unwrap();
            buffer.try_put(message("b", offset)).unwrap();
        }
        let sources: Vec<String> = std::iter::from_fn(|| buffer.poll())
            .map(|m| m.id.source_id.to_string())
            .collect();
        assert_eq!(sources, vec!["a", "b", "a", "b", "a", "b"]);
    }

    #[test]
    fn round_robin_skips_empty_queues() {
        let buffer = RoundRobinBuffer::new(10).unwrap();
        buffer.add_source(&SourceId::from("idle"));
        buffer.try_put(message("busy", 0)).unwrap();
        buffer.try_put(message("busy", 1)).unwrap();
        assert_eq!(buffer.poll().unwrap().id.offset, 0);
        assert_eq!(buffer.poll().unwrap().id.offset, 1);
        assert_eq!(buffer.poll(), None);
    }

    #[test]
    fn put_auto_adds_unknown_sources() {
        let buffer = RoundRobinBuffer::new(10).unwrap();
        buffer.try_put(message("fresh", 7)).unwrap();
        assert_eq!(buffer.size(), 1);
        assert_eq!(buffer.poll().unwrap().id.offset, 7);
    }

    #[test]
    fn remove_source_drops_queued_messages() {
        let buffer = RoundRobinBuffer::new(10).unwrap();
        buffer.try_put(message("a", 0)).unwrap();
        buffer.try_put(message("b", 0)).unwrap();
        buffer.remove_source(&SourceId::from("a"));
        assert_eq!(buffer.size(), 1);
        assert_eq!(buffer.poll().unwrap().id.source_id.as_str(), "b");
    }

    #[test]
    fn throttled_capacity_follows_the_pattern() {
        let buffer = ThrottledBuffer::new(4, 2, "^replay-").unwrap();
        buffer.try_put(message("replay-1", 0)).unwrap();
        buffer.try_put(message("replay-1", 1)).unwrap();
        assert!(buffer.try_put(message("replay-1", 2)).is_err());
        for offset in 0..4 {
            buffer.try_put(message("firehose", offset)).unwrap();
        }
        assert!(buffer.try_put(message("firehose", 4)).is_err());
    }

    #[tokio::test]
    async fn put_timeout_returns_the_message_when_full() {
        let buffer = FifoBuffer::new(1).unwrap();
        buffer.put(message("a", 0)).await;
        let back = buffer
            .put_timeout(message("a", 1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(back.id.offset, 1);
        // Draining frees capacity for a pending put.
        buffer.poll().unwrap();
        buffer
            .put_timeout(back, Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn blocked_put_resumes_after_poll() {
        use std::sync::Arc;
        let buffer = Arc::new(FifoBuffer::new(1).unwrap());
        buffer.put(message("a", 0)).await;
        let writer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.put(message("a", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.poll().unwrap().id.offset, 0);
        writer.await.unwrap();
        assert_eq!(buffer.poll().unwrap().id.offset, 1);
    }
}
