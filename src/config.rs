/// Configuration for a Tessera instance.
///
/// One struct covers the whole engine; subsystems borrow the fields they
/// need. Defaults are tuned for a local development footprint and every test
/// overrides only what it exercises.
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct TesseraConfig {
    /// Root directory for warm tiles, packfiles, the fine index, and the
    /// catalog
    pub data_dir: PathBuf,

    /// Warm tier capacity in bytes
    pub warm_capacity_bytes: u64,

    /// Eviction starts when free warm space drops below this fraction
    pub eviction_free_fraction: f64,

    /// Packfiles roll to a new file once they reach this size
    pub pack_target_bytes: u64,

    /// Deltas smaller than this fraction of their base are materialized to a
    /// full plane before going cold
    pub coalesce_ratio: f64,

    /// Maximum delta chain length before a write is promoted to a full tile
    pub max_delta_depth: usize,

    /// Accesses within this window count toward the recency pin
    pub pin_window: Duration,

    /// More than this many windowed accesses pins a tile in the warm tier
    pub pin_min_accesses: u32,

    /// Half-life of the decayed hotness counter
    pub heat_half_life: Duration,

    /// Consecutive cold-tier write failures before backpressure engages
    pub backpressure_failures: u32,

    /// Tiles with level >= this live in the coarse in-memory index
    pub coarse_level_cutoff: u8,

    /// Tile count ceiling for the coarse planning stage
    pub coarse_max_tiles: usize,

    /// Refinement fan-out ceiling per round
    pub refine_k_cap: usize,

    /// Candidates considered during reranking
    pub rerank_top_n: usize,

    /// Accept when the recall estimate reaches this
    pub recall_threshold: f32,

    /// Accept when planner confidence reaches this
    pub confidence_threshold: f32,

    /// Cached plans are reused within this TTL
    pub plan_cache_ttl: Duration,

    /// Cached plan capacity
    pub plan_cache_capacity: usize,

    /// Hints older than this are dropped as stale
    pub hint_ttl: Duration,

    /// Prefetch hint channel depth
    pub hint_channel_capacity: usize,

    /// Plan pins expire after this long
    pub plan_pin_ttl: Duration,

    /// Upper bound on fine-index staleness; the maintenance task flushes at
    /// least this often
    pub index_flush_interval: Duration,

    /// Background eviction / flush cadence
    pub maintenance_interval: Duration,

    /// Transient I/O retry attempts
    pub retry_attempts: u32,

    /// Base delay for retry backoff (doubles per attempt, with jitter)
    pub retry_base_delay: Duration,
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tessera"),
            warm_capacity_bytes: 256 * 1024 * 1024, // 256 MiB
            eviction_free_fraction: 0.10,
            pack_target_bytes: 128 * 1024 * 1024, // 128 MiB
            coalesce_ratio: 0.25,
            max_delta_depth: 4,
            pin_window: Duration::from_secs(600),
            pin_min_accesses: 1, // pinned once accessed more than once per window
            heat_half_life: Duration::from_secs(600),
            backpressure_failures: 3,
            coarse_level_cutoff: 2,
            coarse_max_tiles: 3,
            refine_k_cap: 16,
            rerank_top_n: 50,
            recall_threshold: 0.98,
            confidence_threshold: 0.92,
            plan_cache_ttl: Duration::from_secs(30),
            plan_cache_capacity: 64,
            hint_ttl: Duration::from_secs(120),
            hint_channel_capacity: 256,
            plan_pin_ttl: Duration::from_secs(30),
            index_flush_interval: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(5),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(20),
        }
    }
}

impl TesseraConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Warm bytes above which eviction kicks in.
    pub fn eviction_watermark(&self) -> u64 {
        let keep_free = (self.warm_capacity_bytes as f64 * self.eviction_free_fraction) as u64;
        self.warm_capacity_bytes.saturating_sub(keep_free)
    }
}
