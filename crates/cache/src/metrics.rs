//! Timing and counting contract for cache operations.
//!
//! Every operation the [`CacheHandle`](crate::CacheHandle) performs is
//! recorded as a counter named `<prefix>.<operation>.meter` and a latency
//! sample named `<prefix>.<operation>.timer`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const METER: &str = "meter";
pub const TIMER: &str = "timer";

/// `<prefix>.<operation>.<suffix>`
pub fn metric_name(prefix: &str, operation: &str, suffix: &str) -> String {
    format!("{prefix}.{operation}.{suffix}")
}

pub trait MetricsRecorder: Send + Sync {
    fn increment(&self, name: &str);
    fn record(&self, name: &str, elapsed: Duration);
}
impl dyn MetricsRecorder + '_ {
    pub fn start_timer(&self, name: String) -> Timer<'_> {
        Timer::start(self, name)
    }
}

/// Records the time between [`start`](Self::start) and [`stop`](Self::stop),
/// or drop, whichever comes first.
#[must_use = "a timer records when it is dropped"]
pub struct Timer<'a> {
    recorder: &'a dyn MetricsRecorder,
    name: String,
    started: Instant,
}
impl<'a> Timer<'a> {
    pub fn start(recorder: &'a dyn MetricsRecorder, name: String) -> Self {
        Self { recorder, name, started: Instant::now() }
    }

    pub fn stop(self) {}
}
impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.recorder.record(&self.name, self.started.elapsed());
    }
}

/// Forwards to the `metrics` facade, so whichever exporter the process has
/// installed picks the samples up.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;
impl MetricsRecorder for FacadeMetrics {
    fn increment(&self, name: &str) {
        metrics::counter!(name.to_string()).increment(1);
    }

    fn record(&self, name: &str, elapsed: Duration) {
        metrics::histogram!(name.to_string()).record(elapsed);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;
impl MetricsRecorder for NoopMetrics {
    fn increment(&self, _name: &str) {}
    fn record(&self, _name: &str, _elapsed: Duration) {}
}

/// Keeps every sample in memory. Meant for tests.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    timings: Mutex<HashMap<String, Vec<Duration>>>,
}
impl MemoryMetrics {
    pub fn count(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn timings(&self, name: &str) -> Vec<Duration> {
        self.timings.lock().get(name).cloned().unwrap_or_default()
    }

    /// Every metric name seen so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counters.lock().keys().cloned().collect();
        names.extend(self.timings.lock().keys().cloned());
        names.sort();
        names.dedup();
        names
    }
}
impl MetricsRecorder for MemoryMetrics {
    fn increment(&self, name: &str) {
        *self.counters.lock().entry(name.to_string()).or_default() += 1;
    }

    fn record(&self, name: &str, elapsed: Duration) {
        self.timings.lock().entry(name.to_string()).or_default().push(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name() {
        assert_eq!(metric_name("depot.cache", "get", METER), "depot.cache.get.meter");
        assert_eq!(metric_name("depot.cache", "get", TIMER), "depot.cache.get.timer");
    }

    #[test]
    fn test_timer_records_once() {
        let metrics = MemoryMetrics::default();
        Timer::start(&metrics, "t".to_string()).stop();
        {
            let _timer = Timer::start(&metrics, "t".to_string());
        }
        assert_eq!(metrics.timings("t").len(), 2);
        assert_eq!(metrics.count("t"), 0);
    }
}
