//! Cache Statistics
//!
//! Lock-free counters maintained on the get/put path and a serializable
//! snapshot for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache statistics collector
#[derive(Debug, Default)]
pub struct CacheStatistics {
    in_memory_hits: AtomicU64,
    on_disk_hits: AtomicU64,
    misses_not_found: AtomicU64,
    misses_expired: AtomicU64,

    // Capacity-driven removals from the cache
    evictions: AtomicU64,

    // Get latency (nanoseconds)
    get_count: AtomicU64,
    total_get_time_ns: AtomicU64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.in_memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.on_disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss_not_found(&self) {
        self.misses_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss_expired(&self) {
        self.misses_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_time(&self, duration: Duration) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.total_get_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn in_memory_hits(&self) -> u64 {
        self.in_memory_hits.load(Ordering::Relaxed)
    }

    pub fn on_disk_hits(&self) -> u64 {
        self.on_disk_hits.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.in_memory_hits() + self.on_disk_hits()
    }

    pub fn misses_not_found(&self) -> u64 {
        self.misses_not_found.load(Ordering::Relaxed)
    }

    pub fn misses_expired(&self) -> u64 {
        self.misses_expired.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses_not_found() + self.misses_expired()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits() as f64;
        let total = hits + self.cache_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn average_get_time(&self) -> Duration {
        let count = self.get_count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_get_time_ns.load(Ordering::Relaxed) / count)
    }

    /// Reset all counters
    pub fn clear(&self) {
        self.in_memory_hits.store(0, Ordering::Relaxed);
        self.on_disk_hits.store(0, Ordering::Relaxed);
        self.misses_not_found.store(0, Ordering::Relaxed);
        self.misses_expired.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.get_count.store(0, Ordering::Relaxed);
        self.total_get_time_ns.store(0, Ordering::Relaxed);
    }

    /// Snapshot combined with current tier sizes
    pub fn snapshot(
        &self,
        cache_name: &str,
        memory_store_size: usize,
        disk_store_size: usize,
        disk_evictions: u64,
    ) -> StatisticsSnapshot {
        StatisticsSnapshot {
            cache_name: cache_name.to_string(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            in_memory_hits: self.in_memory_hits(),
            on_disk_hits: self.on_disk_hits(),
            misses_not_found: self.misses_not_found(),
            misses_expired: self.misses_expired(),
            evictions: self.evictions() + disk_evictions,
            memory_store_size,
            disk_store_size,
            hit_ratio: self.hit_ratio(),
            average_get_time_ms: self.average_get_time().as_secs_f64() * 1000.0,
        }
    }
}

/// Read-only statistics for monitoring collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub cache_name: String,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub in_memory_hits: u64,
    pub on_disk_hits: u64,
    pub misses_not_found: u64,
    pub misses_expired: u64,
    pub evictions: u64,
    pub memory_store_size: usize,
    pub disk_store_size: usize,
    pub hit_ratio: f64,
    pub average_get_time_ms: f64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
