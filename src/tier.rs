/// Tiered placement: warm files, cold packfiles, and the policy between.
///
/// The warm tier is the store's content-addressed files; the cold tier is
/// append-only packfiles. This engine decides which side every payload
/// lives on:
///
/// - Reads go warm-first. A warm miss falls through to the pack the cold
///   index points at, verifies, and promotes the bytes back to warm.
/// - When warm usage crosses the watermark, the least-hot unpinned tiles
///   are appended to the open pack and their warm files removed. Hotness
///   is a decayed counter, so bursts fade instead of pinning forever.
/// - Pins win over heat. A tile is pinned while a live query plan
///   references it, while it carries the `critical` tag, or while it was
///   accessed more than the configured count inside the recency window.
/// - A delta below the coalesce threshold never goes cold alone: its whole
///   chain is packed contiguously so the cold tier sees one neighborhood,
///   not a scatter of tiny patches.
/// - Cold copies are immutable and kept after promotion. Re-evicting a
///   tile that already has one is just dropping the warm file, and a
///   corrupt warm read heals itself from the pack.
///
/// Cold-tier write failures engage backpressure: after a few consecutive
/// errors evictions suspend (warm lifetimes effectively extend) and
/// opportunistic promotions stop, until a later write succeeds.
use crate::config::TesseraConfig;
use crate::delta;
use crate::error::{TesseraError, TesseraResult};
use crate::metrics::Metrics;
use crate::packfile::{self, ColdLocation, PackWriter};
use crate::store::TileStore;
use crate::types::{TileId, TileMeta};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Delta chains longer than this indicate broken parent links.
const MAX_CHAIN_WALK: usize = 128;

#[derive(Debug, Clone)]
struct Heat {
    score: f64,
    last: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_count: u32,
}

impl Heat {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            score: 0.0,
            last: now,
            window_start: now,
            window_count: 0,
        }
    }
}

struct PlanPin {
    tiles: Vec<TileId>,
    expires: Instant,
}

/// Warm/cold placement engine over one [`TileStore`].
pub struct TieringEngine {
    config: TesseraConfig,
    store: Arc<TileStore>,
    cold_dir: PathBuf,

    /// Tiles with a live warm file, by payload size
    warm: DashMap<TileId, u64>,
    /// Immutable cold copies; survive promotion back to warm
    cold_index: DashMap<TileId, ColdLocation>,
    heat: DashMap<TileId, Heat>,
    plan_pins: DashMap<u64, PlanPin>,
    /// Prefetched tiles not yet read; drained into coverage metrics
    prefetched: DashMap<TileId, ()>,

    writer: tokio::sync::Mutex<Option<PackWriter>>,
    pack_seq: AtomicU64,
    pin_seq: AtomicU64,
    warm_bytes: AtomicU64,
    cold_failures: AtomicU32,
    degraded: AtomicBool,
    metrics: Arc<Metrics>,
}

impl TieringEngine {
    pub fn new(config: TesseraConfig, store: Arc<TileStore>, metrics: Arc<Metrics>) -> Self {
        let cold_dir = config.data_dir.join("cold");
        Self {
            config,
            store,
            cold_dir,
            warm: DashMap::new(),
            cold_index: DashMap::new(),
            heat: DashMap::new(),
            plan_pins: DashMap::new(),
            prefetched: DashMap::new(),
            writer: tokio::sync::Mutex::new(None),
            pack_seq: AtomicU64::new(0),
            pin_seq: AtomicU64::new(0),
            warm_bytes: AtomicU64::new(0),
            cold_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<TileStore> {
        &self.store
    }

    /// Restore cold placement from the catalog.
    pub fn restore_cold_index(&self, entries: Vec<(TileId, ColdLocation)>, next_pack_seq: u64) {
        for (id, loc) in entries {
            self.cold_index.insert(id, loc);
        }
        self.pack_seq.store(next_pack_seq, Ordering::SeqCst);
    }

    pub fn cold_entries(&self) -> Vec<(TileId, ColdLocation)> {
        self.cold_index
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    pub fn next_pack_seq(&self) -> u64 {
        self.pack_seq.load(Ordering::SeqCst)
    }

    /// Recompute warm residency from what is actually on disk (open path).
    pub async fn rebuild_residency(&self) {
        let mut total = 0u64;
        for meta in self.store.all_metas() {
            if self.store.has_warm_payload(&meta).await {
                self.warm.insert(meta.tile_id, meta.size_bytes);
                total += meta.size_bytes;
            }
        }
        self.warm_bytes.store(total, Ordering::SeqCst);
    }

    /// Account a fresh warm write and evict if over the watermark.
    pub async fn note_warm_insert(&self, meta: &TileMeta) {
        if self.warm.insert(meta.tile_id, meta.size_bytes).is_none() {
            self.warm_bytes.fetch_add(meta.size_bytes, Ordering::SeqCst);
        }
        self.touch_heat(&meta.tile_id);
        self.maybe_evict().await;
    }

    /// Mark tiles as prefetched so first use counts toward coverage.
    pub fn note_prefetched(&self, ids: &[TileId]) {
        for id in ids {
            self.prefetched.insert(*id, ());
        }
        self.metrics
            .prefetched_tiles
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
    }

    /// Read one tile's stored bytes, wherever they live.
    pub async fn read(&self, meta: &TileMeta) -> TesseraResult<Vec<u8>> {
        self.store.record_access(&meta.tile_id);
        self.touch_heat(&meta.tile_id);
        if self.prefetched.remove(&meta.tile_id).is_some() {
            self.metrics.prefetched_used.fetch_add(1, Ordering::Relaxed);
        }

        match self.store.read_warm(meta).await {
            Ok(Some(bytes)) => {
                self.metrics.tile_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(bytes);
            }
            Ok(None) => {
                self.metrics.tile_misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(TesseraError::Corruption { tile_id, expected, actual }) => {
                // A cold copy can heal a damaged warm file; without one the
                // corruption propagates untouched.
                let Some(loc) = self.cold_index.get(&meta.tile_id).map(|l| *l) else {
                    return Err(TesseraError::Corruption { tile_id, expected, actual });
                };
                warn!(tile_id = %meta.tile_id, "warm payload corrupt, healing from cold tier");
                let bytes = self.fetch_cold(meta, &loc).await?;
                self.store.write_payload_forced(meta, &bytes).await?;
                if self.warm.insert(meta.tile_id, meta.size_bytes).is_none() {
                    self.warm_bytes.fetch_add(meta.size_bytes, Ordering::SeqCst);
                }
                self.metrics.self_heals.fetch_add(1, Ordering::Relaxed);
                return Ok(bytes);
            }
            Err(other) => return Err(other),
        }

        let Some(loc) = self.cold_index.get(&meta.tile_id).map(|l| *l) else {
            return Err(TesseraError::TileIdUnknown {
                tile_id: meta.tile_id,
            });
        };
        let bytes = self.fetch_cold(meta, &loc).await?;
        self.metrics.cold_fetches.fetch_add(1, Ordering::Relaxed);

        // Demand reads promote even under backpressure; only opportunistic
        // warming is throttled.
        self.store.write_payload_forced(meta, &bytes).await?;
        if self.warm.insert(meta.tile_id, meta.size_bytes).is_none() {
            self.warm_bytes.fetch_add(meta.size_bytes, Ordering::SeqCst);
        }
        self.metrics.promotions.fetch_add(1, Ordering::Relaxed);
        self.maybe_evict().await;
        Ok(bytes)
    }

    /// Warm the given tiles from the cold tier ahead of use. Returns how
    /// many were promoted. No-op while backpressure is active.
    pub async fn ensure_warm(&self, ids: &[TileId]) -> TesseraResult<usize> {
        if self.degraded.load(Ordering::SeqCst) {
            debug!("backpressure active, skipping opportunistic promotion");
            return Ok(0);
        }
        let pending: Vec<(TileId, TileMeta, ColdLocation)> = ids
            .iter()
            .filter(|id| !self.warm.contains_key(id))
            .filter_map(|id| {
                let meta = self.store.meta(id)?;
                let loc = self.cold_index.get(id).map(|l| *l)?;
                Some((*id, meta, loc))
            })
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        // Promotion is best-effort: cold reads for the batch overlap, and
        // one bad tile does not sink the rest of the hint.
        let results =
            futures::future::join_all(pending.iter().map(|(id, meta, loc)| async move {
                let bytes = self.fetch_cold(meta, loc).await?;
                self.store.write_payload_forced(meta, &bytes).await?;
                if self.warm.insert(*id, meta.size_bytes).is_none() {
                    self.warm_bytes.fetch_add(meta.size_bytes, Ordering::SeqCst);
                }
                self.metrics.promotions.fetch_add(1, Ordering::Relaxed);
                Ok::<(), TesseraError>(())
            }))
            .await;

        let mut promoted = 0usize;
        let mut first_err = None;
        for result in results {
            match result {
                Ok(()) => promoted += 1,
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if promoted > 0 {
            self.maybe_evict().await;
        }
        match first_err {
            Some(err) if promoted == 0 => Err(err),
            _ => Ok(promoted),
        }
    }

    /// Materialize the full payload for a chain head by walking parent
    /// links down to the base and applying patches oldest-first.
    pub async fn materialize(&self, head: &TileId) -> TesseraResult<Vec<u8>> {
        let mut metas = Vec::new();
        let mut cursor = *head;
        loop {
            if metas.len() > MAX_CHAIN_WALK {
                return Err(TesseraError::Encoding(format!(
                    "delta parent chain from {head} exceeds {MAX_CHAIN_WALK} links"
                )));
            }
            let meta = self
                .store
                .meta(&cursor)
                .ok_or(TesseraError::TileIdUnknown { tile_id: cursor })?;
            let parent = meta.parent_tile_id;
            metas.push(meta);
            match parent {
                Some(p) => cursor = p,
                None => break,
            }
        }
        metas.reverse();

        let mut current = self.read(&metas[0]).await?;
        for meta in &metas[1..] {
            let patch = self.read(meta).await?;
            current = delta::apply(&current, &patch)?;
        }
        Ok(current)
    }

    /// Pin a plan's tiles against eviction until the TTL passes. Returns a
    /// token `release_pins` accepts for early release.
    pub fn pin_plan(&self, tiles: Vec<TileId>) -> u64 {
        let token = self.pin_seq.fetch_add(1, Ordering::SeqCst);
        self.plan_pins.insert(
            token,
            PlanPin {
                tiles,
                expires: Instant::now() + self.config.plan_pin_ttl,
            },
        );
        token
    }

    pub fn release_pins(&self, token: u64) {
        self.plan_pins.remove(&token);
    }

    /// Drop all tiering state for a deleted tile. The pack entry it may
    /// leave behind goes dead and is reclaimed by compaction.
    pub fn forget(&self, tile_id: &TileId) {
        if let Some((_, size)) = self.warm.remove(tile_id) {
            self.warm_bytes.fetch_sub(size, Ordering::SeqCst);
        }
        self.cold_index.remove(tile_id);
        self.heat.remove(tile_id);
        self.prefetched.remove(tile_id);
    }

    /// Tiles currently resident in the warm tier.
    pub fn warm_ids(&self) -> Vec<TileId> {
        self.warm.iter().map(|e| *e.key()).collect()
    }

    pub fn is_warm(&self, tile_id: &TileId) -> bool {
        self.warm.contains_key(tile_id)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Periodic housekeeping: expire plan pins, run an eviction pass, and
    /// roll the open pack when it reaches its target size.
    pub async fn maintain(&self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .plan_pins
            .iter()
            .filter(|e| e.value().expires <= now)
            .map(|e| *e.key())
            .collect();
        for token in expired {
            self.plan_pins.remove(&token);
        }

        self.maybe_evict().await;
        if let Err(err) = self.roll_pack_if_full().await {
            warn!(error = %err, "pack roll failed");
        }
    }

    /// Seal the open pack regardless of size (shutdown and persist path).
    pub async fn flush_cold(&self) -> TesseraResult<()> {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.take() {
            if writer.entry_count() == 0 {
                let path = writer.path().to_path_buf();
                drop(writer);
                let _ = tokio::fs::remove_file(&path).await;
            } else {
                writer.seal().await?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> TierStats {
        let cold_bytes = self.cold_index.iter().map(|e| e.value().len).sum();
        TierStats {
            warm_tiles: self.warm.len(),
            warm_bytes: self.warm_bytes.load(Ordering::SeqCst),
            warm_capacity_bytes: self.config.warm_capacity_bytes,
            cold_tiles: self.cold_index.len(),
            cold_bytes,
            pinned_plans: self.plan_pins.len(),
            degraded: self.is_degraded(),
        }
    }

    async fn fetch_cold(&self, meta: &TileMeta, loc: &ColdLocation) -> TesseraResult<Vec<u8>> {
        let path = self.cold_dir.join(packfile::pack_file_name(loc.pack_seq));
        let bytes =
            packfile::read_entry(&path, &meta.tile_id, loc.offset, loc.len, loc.crc32).await?;
        // Crc guards the pack entry; the content address guards end to end.
        self.store.verify(meta, &bytes)?;
        Ok(bytes)
    }

    fn touch_heat(&self, tile_id: &TileId) {
        let now = Utc::now();
        let half_life = self.config.heat_half_life.as_secs_f64().max(1.0);
        let window = chrono::Duration::from_std(self.config.pin_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut entry = self.heat.entry(*tile_id).or_insert_with(|| Heat::new(now));
        let dt = now.signed_duration_since(entry.last).num_milliseconds().max(0) as f64 / 1000.0;
        entry.score = entry.score * 0.5f64.powf(dt / half_life) + 1.0;
        entry.last = now;
        if now.signed_duration_since(entry.window_start) > window {
            entry.window_start = now;
            entry.window_count = 0;
        }
        entry.window_count += 1;
    }

    fn current_heat(&self, tile_id: &TileId, now: DateTime<Utc>) -> f64 {
        let half_life = self.config.heat_half_life.as_secs_f64().max(1.0);
        self.heat
            .get(tile_id)
            .map(|h| {
                let dt = now.signed_duration_since(h.last).num_milliseconds().max(0) as f64
                    / 1000.0;
                h.score * 0.5f64.powf(dt / half_life)
            })
            .unwrap_or(0.0)
    }

    fn is_pinned(&self, meta: &TileMeta, now: DateTime<Utc>) -> bool {
        if meta.is_critical() {
            return true;
        }
        let instant_now = Instant::now();
        if self
            .plan_pins
            .iter()
            .any(|p| p.value().expires > instant_now && p.value().tiles.contains(&meta.tile_id))
        {
            return true;
        }
        let window = chrono::Duration::from_std(self.config.pin_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        if let Some(h) = self.heat.get(&meta.tile_id) {
            if now.signed_duration_since(h.window_start) <= window
                && h.window_count > self.config.pin_min_accesses
            {
                return true;
            }
        }
        false
    }

    /// Evict least-hot unpinned warm tiles until back under the watermark.
    async fn maybe_evict(&self) {
        if self.degraded.load(Ordering::SeqCst) {
            return;
        }
        let watermark = self.config.eviction_watermark();
        if self.warm_bytes.load(Ordering::SeqCst) <= watermark {
            return;
        }

        let now = Utc::now();
        let mut candidates: Vec<(f64, DateTime<Utc>, TileMeta)> = Vec::new();
        for entry in self.warm.iter() {
            let Some(meta) = self.store.meta(entry.key()) else {
                continue;
            };
            if self.is_pinned(&meta, now) {
                continue;
            }
            let last = self
                .store
                .usage_of(entry.key())
                .map(|u| u.last_access)
                .unwrap_or(meta.created_at);
            candidates.push((self.current_heat(entry.key(), now), last, meta));
        }
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        for (_, _, meta) in candidates {
            if self.warm_bytes.load(Ordering::SeqCst) <= watermark {
                break;
            }
            if !self.warm.contains_key(&meta.tile_id) {
                continue;
            }
            match self.evict_one(&meta).await {
                Ok(()) => {
                    self.cold_failures.store(0, Ordering::SeqCst);
                }
                Err(err) => {
                    let failures = self.cold_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(tile_id = %meta.tile_id, failures, error = %err, "cold write failed");
                    if failures >= self.config.backpressure_failures {
                        self.degraded.store(true, Ordering::SeqCst);
                        self.metrics
                            .backpressure_events
                            .fetch_add(1, Ordering::Relaxed);
                        info!("cold tier backpressure engaged, evictions suspended");
                        return;
                    }
                }
            }
        }

        if let Err(err) = self.roll_pack_if_full().await {
            warn!(error = %err, "pack roll failed");
        }
    }

    /// Move one tile (and, for under-threshold deltas, its whole chain)
    /// into the open pack, then drop the warm files.
    async fn evict_one(&self, meta: &TileMeta) -> TesseraResult<()> {
        let group = if self.is_coalescible(meta) {
            self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
            let chain = self.chain_metas(meta)?;
            debug!(
                tile_id = %meta.tile_id,
                members = chain.len(),
                "coalescing delta chain into one pack neighborhood"
            );
            chain
        } else {
            vec![meta.clone()]
        };

        let coalesced = group.len() > 1;
        for member in &group {
            let was_warm = self.warm.contains_key(&member.tile_id);
            if !self.cold_index.contains_key(&member.tile_id) {
                // Immutable cold copies are written once and reused forever
                let Some(bytes) = self.store.read_warm(member).await? else {
                    continue;
                };
                let loc = self.append_to_pack(&member.tile_id, &bytes, coalesced).await?;
                self.cold_index.insert(member.tile_id, loc);
            }
            if !was_warm {
                continue;
            }
            if self.prefetched.remove(&member.tile_id).is_some() {
                // Prefetched but evicted before anyone read it
                self.metrics.hints_stale.fetch_add(1, Ordering::Relaxed);
                debug!(tile_id = %member.tile_id, "prefetched tile evicted unused");
            }
            self.store.remove_warm_payload(member).await?;
            if let Some((_, size)) = self.warm.remove(&member.tile_id) {
                self.warm_bytes.fetch_sub(size, Ordering::SeqCst);
            }
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// A delta whose patch is small relative to its base drags its chain
    /// along instead of becoming a lone tiny cold object.
    fn is_coalescible(&self, meta: &TileMeta) -> bool {
        if !meta.is_delta() {
            return false;
        }
        let Ok(chain) = self.chain_metas(meta) else {
            return false;
        };
        let base_size = chain.first().map(|m| m.size_bytes).unwrap_or(0);
        base_size > 0
            && (meta.size_bytes as f64) < (base_size as f64) * self.config.coalesce_ratio
    }

    /// Walk parent links from a chain member down to its base; base first.
    fn chain_metas(&self, meta: &TileMeta) -> TesseraResult<Vec<TileMeta>> {
        let mut metas = vec![meta.clone()];
        let mut cursor = meta.parent_tile_id;
        while let Some(parent) = cursor {
            if metas.len() > MAX_CHAIN_WALK {
                return Err(TesseraError::Encoding(format!(
                    "delta parent chain from {} exceeds {MAX_CHAIN_WALK} links",
                    meta.tile_id
                )));
            }
            let parent_meta = self
                .store
                .meta(&parent)
                .ok_or(TesseraError::TileIdUnknown { tile_id: parent })?;
            cursor = parent_meta.parent_tile_id;
            metas.push(parent_meta);
        }
        metas.reverse();
        Ok(metas)
    }

    async fn append_to_pack(
        &self,
        tile_id: &TileId,
        bytes: &[u8],
        coalesced: bool,
    ) -> TesseraResult<ColdLocation> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let seq = self.pack_seq.fetch_add(1, Ordering::SeqCst);
            *guard = Some(PackWriter::create(&self.cold_dir, seq).await?);
        }
        let writer = guard.as_mut().expect("writer just created");
        writer.append(*tile_id, bytes, coalesced).await
    }

    async fn roll_pack_if_full(&self) -> TesseraResult<()> {
        let mut guard = self.writer.lock().await;
        let full = guard
            .as_ref()
            .map(|w| w.written() >= self.config.pack_target_bytes)
            .unwrap_or(false);
        if full {
            if let Some(writer) = guard.take() {
                writer.seal().await?;
            }
        }
        Ok(())
    }

    /// Rewrite packs whose live fraction fell below half, dropping entries
    /// no cold-index record points at anymore.
    pub async fn compact_packs(&self) -> TesseraResult<usize> {
        let open_seq = {
            let guard = self.writer.lock().await;
            guard.as_ref().map(|w| w.seq())
        };
        let mut dir = match tokio::fs::read_dir(&self.cold_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut compacted = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(seq) = name
                .strip_prefix("pack-")
                .and_then(|s| s.strip_suffix(".pack"))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if Some(seq) == open_seq {
                continue;
            }
            let Ok(manifest) = packfile::read_manifest(&path).await else {
                continue; // unsealed or foreign file
            };
            let live: Vec<_> = manifest
                .iter()
                .filter(|e| {
                    self.cold_index
                        .get(&e.tile_id)
                        .map(|loc| loc.pack_seq == seq && loc.offset == e.offset)
                        .unwrap_or(false)
                })
                .collect();
            if manifest.is_empty() || live.len() * 2 > manifest.len() {
                continue;
            }

            for entry in &live {
                let bytes = packfile::read_entry(
                    &path,
                    &entry.tile_id,
                    entry.offset,
                    entry.len,
                    entry.crc32,
                )
                .await?;
                let loc = self
                    .append_to_pack(&entry.tile_id, &bytes, entry.coalesced)
                    .await?;
                self.cold_index.insert(entry.tile_id, loc);
            }
            tokio::fs::remove_file(&path).await?;
            compacted += 1;
            info!(pack = name, live = live.len(), total = manifest.len(), "pack compacted");
        }
        Ok(compacted)
    }
}

/// Point-in-time tiering statistics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TierStats {
    pub warm_tiles: usize,
    pub warm_bytes: u64,
    pub warm_capacity_bytes: u64,
    pub cold_tiles: usize,
    pub cold_bytes: u64,
    pub pinned_plans: usize,
    pub degraded: bool,
}

impl TierStats {
    /// Warm utilization in [0, 1].
    pub fn utilization(&self) -> f64 {
        if self.warm_capacity_bytes == 0 {
            0.0
        } else {
            self.warm_bytes as f64 / self.warm_capacity_bytes as f64
        }
    }
}
