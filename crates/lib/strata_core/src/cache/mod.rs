//! In-memory caches derived from the record store.
//!
//! Caches are private, disposable copies of store state. Any of them may be
//! cleared at any time; every read path falls back to the store on a miss.

mod category;
mod concurrent;
mod record;

use std::sync::atomic::{AtomicU64, Ordering};

pub use category::{CategoryCache, TableCache};
pub use concurrent::ConcurrentCache;
pub use record::CacheRecord;

/// Hit and miss counters shared by the repositories of one context.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl CacheStatsSnapshot {
    /// Fraction of lookups answered from cache, or 0 with no lookups.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_count_hits_and_misses() {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        let snap = stats.snapshot();
        assert_eq!(snap, CacheStatsSnapshot { hits: 3, misses: 1 });
        assert!((snap.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stats_ratio_is_zero() {
        assert_eq!(CacheStatsSnapshot::default().hit_ratio(), 0.0);
    }
}
