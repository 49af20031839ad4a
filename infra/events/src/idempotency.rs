use crate::config::IdempotencySettings;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::trace;

/// Bounded, time-windowed record of processed message ids.
///
/// Best effort: ids are forgotten after the window or when the cap evicts them.
#[derive(Debug)]
pub struct IdempotencyCache {
    processed: Cache<String, Instant>,
    max_size: u64,
    purge: Mutex<()>,
}

impl IdempotencyCache {
    #[must_use]
    pub fn new(settings: &IdempotencySettings) -> Self {
        let max_size = settings.max_cache_size.max(1);
        let processed =
            Cache::builder().max_capacity(max_size).time_to_live(settings.window()).build();
        Self { processed, max_size, purge: Mutex::new(()) }
    }

    #[must_use]
    pub fn is_processed(&self, key: &str) -> bool {
        self.processed.contains_key(key)
    }

    pub fn mark_processed(&self, key: impl Into<String>) {
        self.processed.insert(key.into(), Instant::now());
        if self.processed.entry_count() >= self.max_size {
            self.purge_expired();
        }
    }

    /// Drops expired entries; skipped when another caller is already purging.
    pub fn purge_expired(&self) {
        let Some(_guard) = self.purge.try_lock() else {
            return;
        };
        self.processed.run_pending_tasks();
        trace!(entries = self.processed.entry_count(), "Idempotency cache purged");
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.processed.run_pending_tasks();
        self.processed.entry_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(window_ms: u64, size: u64) -> IdempotencySettings {
        IdempotencySettings { enabled: true, cache_duration_ms: window_ms, max_cache_size: size }
    }

    #[test]
    fn marks_are_visible_immediately() {
        let cache = IdempotencyCache::new(&settings(60_000, 100));
        assert!(!cache.is_processed("q:1"));
        cache.mark_processed("q:1");
        assert!(cache.is_processed("q:1"));
        assert!(!cache.is_processed("other:1"));
    }

    #[test]
    fn entries_expire_after_window() {
        let cache = IdempotencyCache::new(&settings(20, 100));
        cache.mark_processed("q:1");
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(!cache.is_processed("q:1"));
    }

    #[test]
    fn size_is_capped() {
        let cache = IdempotencyCache::new(&settings(60_000, 8));
        for i in 0..64 {
            cache.mark_processed(format!("q:{i}"));
        }
        assert!(cache.len() <= 8);
    }
}
