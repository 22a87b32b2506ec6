/// Process-wide counters for the tile memory.
///
/// Everything here is a relaxed atomic: cheap to bump from any subsystem,
/// coherent enough for operational dashboards. `snapshot()` captures a
/// consistent-enough view for the status endpoint and the CLI.
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bounds (exclusive) of the query latency buckets, in milliseconds.
/// The last bucket is open-ended.
pub const LATENCY_BUCKETS_MS: [u64; 8] = [1, 5, 10, 25, 50, 100, 250, 500];

/// Shared counter block. One instance lives on the facade and is handed to
/// every subsystem as an `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    // Store
    pub tile_hits: AtomicU64,
    pub tile_misses: AtomicU64,
    pub cold_fetches: AtomicU64,
    pub self_heals: AtomicU64,
    pub depth_promotions: AtomicU64,

    // Tiering
    pub evictions: AtomicU64,
    pub promotions: AtomicU64,
    pub coalesced: AtomicU64,
    pub backpressure_events: AtomicU64,

    // Planner
    pub queries: AtomicU64,
    pub queries_partial: AtomicU64,
    pub queries_failed: AtomicU64,
    pub plan_cache_hits: AtomicU64,
    latency_buckets: [AtomicU64; 9],
    latency_total_ms: AtomicU64,

    // Prefetch
    pub hints_received: AtomicU64,
    pub hints_stale: AtomicU64,
    pub prefetched_tiles: AtomicU64,
    pub prefetched_used: AtomicU64,

    // Merge / replay
    pub merges: AtomicU64,
    pub merge_conflicts: AtomicU64,
    pub replays: AtomicU64,
    pub determinism_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed query with its wall-clock latency.
    pub fn record_query_latency(&self, elapsed_ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| elapsed_ms < bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut latency_buckets = [0u64; 9];
        for (slot, bucket) in latency_buckets.iter_mut().zip(self.latency_buckets.iter()) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        MetricsSnapshot {
            tile_hits: self.tile_hits.load(Ordering::Relaxed),
            tile_misses: self.tile_misses.load(Ordering::Relaxed),
            cold_fetches: self.cold_fetches.load(Ordering::Relaxed),
            self_heals: self.self_heals.load(Ordering::Relaxed),
            depth_promotions: self.depth_promotions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            queries_partial: self.queries_partial.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            plan_cache_hits: self.plan_cache_hits.load(Ordering::Relaxed),
            latency_buckets,
            latency_total_ms: self.latency_total_ms.load(Ordering::Relaxed),
            hints_received: self.hints_received.load(Ordering::Relaxed),
            hints_stale: self.hints_stale.load(Ordering::Relaxed),
            prefetched_tiles: self.prefetched_tiles.load(Ordering::Relaxed),
            prefetched_used: self.prefetched_used.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            merge_conflicts: self.merge_conflicts.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            determinism_failures: self.determinism_failures.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`Metrics`], with the derived ratios callers chart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tile_hits: u64,
    pub tile_misses: u64,
    pub cold_fetches: u64,
    pub self_heals: u64,
    pub depth_promotions: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub coalesced: u64,
    pub backpressure_events: u64,
    pub queries: u64,
    pub queries_partial: u64,
    pub queries_failed: u64,
    pub plan_cache_hits: u64,
    /// Counts per latency bucket; bounds are [`LATENCY_BUCKETS_MS`] plus an
    /// open-ended tail
    pub latency_buckets: [u64; 9],
    pub latency_total_ms: u64,
    pub hints_received: u64,
    pub hints_stale: u64,
    pub prefetched_tiles: u64,
    pub prefetched_used: u64,
    pub merges: u64,
    pub merge_conflicts: u64,
    pub replays: u64,
    pub determinism_failures: u64,
}

impl MetricsSnapshot {
    /// Warm-tier hit rate over all tile reads.
    pub fn hit_rate(&self) -> f64 {
        let total = self.tile_hits + self.tile_misses;
        if total == 0 {
            0.0
        } else {
            self.tile_hits as f64 / total as f64
        }
    }

    /// Fraction of prefetched tiles that were warm when actually read.
    pub fn prefetch_coverage(&self) -> f64 {
        if self.prefetched_tiles == 0 {
            0.0
        } else {
            self.prefetched_used as f64 / self.prefetched_tiles as f64
        }
    }

    /// Fraction of received hints that expired before they could be served.
    pub fn stale_hint_rate(&self) -> f64 {
        if self.hints_received == 0 {
            0.0
        } else {
            self.hints_stale as f64 / self.hints_received as f64
        }
    }

    /// Mean query latency in milliseconds.
    pub fn mean_query_latency_ms(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.latency_total_ms as f64 / self.queries as f64
        }
    }
}
