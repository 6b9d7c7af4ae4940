//! Metrics sink boundary.
//!
//! All calls are best-effort and never fail the caller. Scopes identify the
//! component emitting (e.g. a source id), names the series within it.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Sink for counters, timers, and gauges.
pub trait MetricsRecorder: Send + Sync {
    fn count(&self, scope: &str, name: &str, delta: u64);
    fn timer(&self, scope: &str, name: &str, elapsed: Duration);
    fn gauge(&self, scope: &str, name: &str, value: f64);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn count(&self, _scope: &str, _name: &str, _delta: u64) {}
    fn timer(&self, _scope: &str, _name: &str, _elapsed: Duration) {}
    fn gauge(&self, _scope: &str, _name: &str, _value: f64) {}
}

/// Emits every datapoint as a debug-level trace event.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn count(&self, scope: &str, name: &str, delta: u64) {
        debug!(scope, name, delta, "count");
    }

    fn timer(&self, scope: &str, name: &str, elapsed: Duration) {
        debug!(scope, name, elapsed_ms = elapsed.as_millis() as u64, "timer");
    }

    fn gauge(&self, scope: &str, name: &str, value: f64) {
        debug!(scope, name, value, "gauge");
    }
}

/// Accumulates datapoints in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<(String, String), u64>>,
    timers: Mutex<HashMap<(String, String), Vec<Duration>>>,
    gauges: Mutex<HashMap<(String, String), f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, scope: &str, name: &str) -> u64 {
        self.counters
            .lock()
            .get(&(scope.to_string(), name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, scope: &str, name: &str) -> Option<f64> {
        self.gauges
            .lock()
            .get(&(scope.to_string(), name.to_string()))
            .copied()
    }

    pub fn timer_samples(&self, scope: &str, name: &str) -> usize {
        self.timers
            .lock()
            .get(&(scope.to_string(), name.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn count(&self, scope: &str, name: &str, delta: u64) {
        *self
            .counters
            .lock()
            .entry((scope.to_string(), name.to_string()))
            .or_insert(0) += delta;
    }

    fn timer(&self, scope: &str, name: &str, elapsed: Duration) {
        self.timers
            .lock()
            .entry((scope.to_string(), name.to_string()))
            .or_default()
            .push(elapsed);
    }

    fn gauge(&self, scope: &str, name: &str, value: f64) {
        self.gauges
            .lock()
            .insert((scope.to_string(), name.to_string()), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = InMemoryMetrics::new();
        metrics.count("firehose-0", "emit", 1);
        metrics.count("firehose-0", "emit", 2);
        assert_eq!(metrics.counter("firehose-0", "emit"), 3);
        assert_eq!(metrics.counter("firehose-0", "ack"), 0);
    }

    #[test]
    fn gauges_keep_the_latest_value() {
        let metrics = InMemoryMetrics::new();
        metrics.gauge("buffer", "depth", 4.0);
        metrics.gauge("buffer", "depth", 2.0);
        assert_eq!(metrics.gauge_value("buffer", "depth"), Some(2.0));
    }
}
