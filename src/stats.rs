//! Run statistics shared by all workers.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Live counters, updated with atomic adds from concurrently running workers.
#[derive(Debug)]
pub struct ProcessingStats {
    total: AtomicUsize,
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    updated: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    cache_hits: AtomicUsize,
    new_discoveries: AtomicUsize,
    stale_refreshes: AtomicUsize,
    started_at: DateTime<Utc>,
}

/// Final, immutable view of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSummary {
    pub total: usize,
    pub processed: usize,
    /// Items that ended with a result (export: feed found; import: bookmark
    /// created or updated).
    pub succeeded: usize,
    /// Subset of `succeeded` that overwrote an existing bookmark.
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cache_hits: usize,
    /// Discoveries run for URLs the cache had never seen.
    pub new_discoveries: usize,
    /// Discoveries run because the cached entry had expired.
    pub stale_refreshes: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProcessingStats {
    pub fn new(total: usize) -> Self {
        Self {
            total: AtomicUsize::new(total),
            processed: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            updated: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            new_discoveries: AtomicUsize::new(0),
            stale_refreshes: AtomicUsize::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.updated.fetch_add(1, Ordering::Relaxed);
        self.record_success();
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new_discovery(&self) {
        self.new_discoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_refresh(&self) {
        self.stale_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    /// Snapshots the counters and stamps the end time.
    ///
    /// Call after every worker has finished; earlier calls see a partial run.
    pub fn finish(&self) -> StatsSummary {
        StatsSummary {
            total: self.total.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            new_discoveries: self.new_discoveries.load(Ordering::Relaxed),
            stale_refreshes: self.stale_refreshes.load(Ordering::Relaxed),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

impl StatsSummary {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Created bookmarks (import) or found feeds (export), excluding updates.
    pub fn created(&self) -> usize {
        self.succeeded.saturating_sub(self.updated)
    }
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} processed, {} succeeded ({} updated), {} skipped, {} failed in {:.1}s",
            self.total,
            self.processed,
            self.succeeded,
            self.updated,
            self.skipped,
            self.failed,
            self.duration().as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_add_up() {
        let stats = ProcessingStats::new(5);
        stats.record_success();
        stats.record_update();
        stats.record_skip();
        stats.record_failure();
        stats.record_failure();
        stats.record_cache_hit();

        let summary = stats.finish();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.created(), 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.cache_hits, 1);
        assert!(summary.finished_at >= summary.started_at);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(ProcessingStats::new(800));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.record_success();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let summary = stats.finish();
        assert_eq!(summary.processed, 800);
        assert_eq!(summary.succeeded, 800);
    }

    #[test]
    fn test_display_summary() {
        let stats = ProcessingStats::new(2);
        stats.record_success();
        stats.record_failure();
        let line = stats.finish().to_string();
        assert!(line.starts_with("2 total, 2 processed, 1 succeeded (0 updated), 0 skipped, 1 failed"));
    }
}
