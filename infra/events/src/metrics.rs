use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sink for bus-level counters and timings, keyed by event name.
pub trait BusMetrics: Send + Sync + Debug {
    /// One publish attempt, accepted by the broker or not.
    fn record_published(&self, event: &str, elapsed: Duration, success: bool);

    /// One handler invocation, successful or not.
    fn record_consumed(&self, event: &str, elapsed: Duration, success: bool);

    /// A failed message was sent to retry tier `tier`.
    fn record_retry(&self, event: &str, tier: u32);

    fn record_duplicate(&self, event: &str);
}

/// Discards everything; used when `observability.metrics_enabled` is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl BusMetrics for NoopMetrics {
    fn record_published(&self, _event: &str, _elapsed: Duration, _success: bool) {}

    fn record_consumed(&self, _event: &str, _elapsed: Duration, _success: bool) {}

    fn record_retry(&self, _event: &str, _tier: u32) {}

    fn record_duplicate(&self, _event: &str) {}
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    publish_failed: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    duplicates: AtomicU64,
    publish_micros: AtomicU64,
    handle_micros: AtomicU64,
}

/// Point-in-time copy of the counters of one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounters {
    pub published: u64,
    pub publish_failed: u64,
    pub consumed: u64,
    pub failed: u64,
    pub retried: u64,
    pub duplicates: u64,
    pub publish_time: Duration,
    pub handle_time: Duration,
}

/// Process-local atomic counters.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    events: DashMap<String, Counters>,
}

impl InMemoryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self, event: &str) -> EventCounters {
        self.events.get(event).map(|c| copy(&c)).unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot_all(&self) -> Vec<(String, EventCounters)> {
        let mut all: Vec<_> =
            self.events.iter().map(|entry| (entry.key().clone(), copy(entry.value()))).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn with(&self, event: &str, f: impl FnOnce(&Counters)) {
        if let Some(counters) = self.events.get(event) {
            f(&counters);
            return;
        }
        f(&self.events.entry(event.to_owned()).or_default());
    }
}

impl BusMetrics for InMemoryMetrics {
    fn record_published(&self, event: &str, elapsed: Duration, success: bool) {
        self.with(event, |c| {
            if success {
                c.published.fetch_add(1, Ordering::Relaxed);
            } else {
                c.publish_failed.fetch_add(1, Ordering::Relaxed);
            }
            c.publish_micros.fetch_add(micros(elapsed), Ordering::Relaxed);
        });
    }

    fn record_consumed(&self, event: &str, elapsed: Duration, success: bool) {
        self.with(event, |c| {
            if success {
                c.consumed.fetch_add(1, Ordering::Relaxed);
            } else {
                c.failed.fetch_add(1, Ordering::Relaxed);
            }
            c.handle_micros.fetch_add(micros(elapsed), Ordering::Relaxed);
        });
    }

    fn record_retry(&self, event: &str, _tier: u32) {
        self.with(event, |c| {
            c.retried.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn record_duplicate(&self, event: &str) {
        self.with(event, |c| {
            c.duplicates.fetch_add(1, Ordering::Relaxed);
        });
    }
}

fn copy(c: &Counters) -> EventCounters {
    EventCounters {
        published: c.published.load(Ordering::Relaxed),
        publish_failed: c.publish_failed.load(Ordering::Relaxed),
        consumed: c.consumed.load(Ordering::Relaxed),
        failed: c.failed.load(Ordering::Relaxed),
        retried: c.retried.load(Ordering::Relaxed),
        duplicates: c.duplicates.load(Ordering::Relaxed),
        publish_time: Duration::from_micros(c.publish_micros.load(Ordering::Relaxed)),
        handle_time: Duration::from_micros(c.handle_micros.load(Ordering::Relaxed)),
    }
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_kept_per_event() {
        let metrics = InMemoryMetrics::new();
        metrics.record_published("A", Duration::from_millis(2), true);
        metrics.record_published("A", Duration::from_millis(3), true);
        metrics.record_published("A", Duration::from_millis(4), false);
        metrics.record_consumed("A", Duration::from_millis(1), true);
        metrics.record_consumed("A", Duration::from_millis(1), false);
        metrics.record_retry("A", 1);
        metrics.record_duplicate("B");

        let a = metrics.snapshot("A");
        assert_eq!((a.published, a.publish_failed), (2, 1));
        assert_eq!(a.publish_time, Duration::from_millis(9));
        assert_eq!((a.consumed, a.failed, a.retried), (1, 1, 1));
        assert_eq!(metrics.snapshot("B").duplicates, 1);
        assert_eq!(metrics.snapshot("C"), EventCounters::default());

        let names: Vec<_> = metrics.snapshot_all().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["A", "B"]);
    }
}
