//! Failed-message retry policies.
//!
//! A policy decides whether a failed message may be replayed and when it
//! becomes eligible. All time arithmetic goes through the injected [`Clock`]
//! so tests drive the schedule with virtual time.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::core::time::Clock;
use crate::messaging::MessageId;

/// Decides when/whether a failed message is replayed.
pub trait RetryPolicy: Send {
    /// Record a failure and schedule the next eligible attempt.
    fn failed(&mut self, id: &MessageId);

    /// Whether another attempt is permitted for this id.
    fn retry_further(&mut self, id: &MessageId) -> bool;

    /// The id whose scheduled time has passed, lowest scheduled time first;
    /// ties broken by insertion order. Non-blocking.
    fn next_eligible(&mut self) -> Option<MessageId>;

    /// Drop all tracking for this id.
    fn acked(&mut self, id: &MessageId);
}

/// Always gives up: every failure is permanent.
#[derive(Debug, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn failed(&mut self, _id: &MessageId) {}

    fn retry_further(&mut self, _id: &MessageId) -> bool {
        false
    }

    fn next_eligible(&mut self) -> Option<MessageId> {
        None
    }

    fn acked(&mut self, _id: &MessageId) {}
}

/// Retries up to `max_retries` times with exponentially growing delays:
/// attempt `n` becomes eligible `initial_delay * multiplier^(n-1)` after the
/// failure that scheduled it.
pub struct ExponentialBackoff<C: Clock> {
    clock: C,
    max_retries: u32,
    initial_delay: Duration,
    multiplier: f64,
    fail_counts: HashMap<MessageId, u32>,
    schedule: BTreeMap<(Instant, u64), MessageId>,
    scheduled_keys: HashMap<MessageId, (Instant, u64)>,
    next_seq: u64,
}

impl<C: Clock> ExponentialBackoff<C> {
    pub fn new(clock: C, max_retries: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            clock,
            max_retries,
            initial_delay,
            multiplier,
            fail_counts: HashMap::new(),
            schedule: BTreeMap::new(),
            scheduled_keys: HashMap::new(),
            next_seq: 0,
        }
    }

    fn delay_for(&self, fail_count: u32) -> Duration {
        let factor = self.multiplier.powi(fail_count.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor.max(0.0))
    }

    fn unschedule(&mut self, id: &MessageId) {
        if let Some(key) = self.scheduled_keys.remove(id) {
            self.schedule.remove(&key);
        }
    }
}

impl<C: Clock> RetryPolicy for ExponentialBackoff<C> {
    fn failed(&mut self, id: &MessageId) {
        let count = self.fail_counts.entry(id.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        let eligible_at = self.clock.now() + self.delay_for(count);
        self.unschedule(id);
        let key = (eligible_at, self.next_seq);
        self.next_seq += 1;
        self.schedule.insert(key, id.clone());
        self.scheduled_keys.insert(id.clone(), key);
    }

    fn retry_further(&mut self, id: &MessageId) -> bool {
        self.fail_counts.get(id).copied().unwrap_or(0) < self.max_retries
    }

    fn next_eligible(&mut self) -> Option<MessageId> {
        let now = self.clock.now();
        let (&key, _) = self.schedule.first_key_value()?;
        if key.0 > now {
            return None;
        }
        let id = self.schedule.remove(&key).expect("key just observed");
        self.scheduled_keys.remove(&id);
        // Fail count is kept until the message is acked so a later failure
        // keeps backing off from where it left.
        Some(id)
    }

    fn acked(&mut self, id: &MessageId) {
        self.fail_counts.remove(id);
        self.unschedule(id);
    }
}
