//! Query planner: a budgeted coarse-to-fine state machine.
//!
//! Each query runs one pass through `Coarse -> Localize -> Refine`,
//! checking the caller's budget at every transition and before every
//! refine read, so a tight budget short-circuits cleanly instead of being
//! killed mid-flight:
//!
//! - `Coarse` picks a handful of summary tiles from the in-memory coarse
//!   index. It runs even with a zero budget, which yields a coarse-only
//!   partial plan.
//! - `Localize` asks the semantic index for nearest neighbors and turns
//!   them into regions of interest in fine tile coordinates.
//! - `Refine` reads up to K tiles inside those regions through the tiering
//!   engine, promoting cold tiles on demand and skipping corrupt ones.
//!
//! A plan is accepted once estimated recall or confidence clears its
//! threshold; otherwise it comes back explicitly partial with the reason
//! attached. When the fine index is down the planner falls back to a
//! cached prior plan, then to a scan over warm tiles, and only fails when
//! neither exists. Candidate ranking fuses index similarity with level,
//! hotness, recency, hint overlap and distance heuristics.

use crate::config::TesseraConfig;
use crate::error::{TesseraError, TesseraResult};
use crate::graph::{SnapshotGraph, TileChain};
use crate::index::{SearchHit, SemanticIndex, Vector};
use crate::metrics::Metrics;
use crate::prefetch::{scale_bbox, HintLog};
use crate::tier::TieringEngine;
use crate::types::{
    Acceptance, BBox, Hint, PartialReason, PlannedTile, QueryPlan, QueryRequest, TileCoord,
    TileId, TileMeta,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Similarity is the primary signal; the scale keeps a full-strength match
/// ahead of any stack of secondary bonuses.
const SIM_WEIGHT: f64 = 20.0;
const LEVEL_WEIGHT: f64 = 3.0;
const HOTNESS_WEIGHT: f64 = 2.0;
const RECENCY_MAX_POINTS: f64 = 6.0;
const RECENCY_WINDOW_SECS: f64 = 360.0;
const HINT_BONUS: f64 = 12.0;
const DISTANCE_PENALTY: f64 = 0.25;

/// Refine never plans more reads than this before the hard request cap.
const REFINE_SOFT_K: usize = 8;
/// Recall bookkeeping enumerates at most this many region cells.
const MAX_ROI_CELLS: usize = 4096;

struct CachedPlan {
    plan: QueryPlan,
    cached_at: Instant,
}

/// One refine candidate: a resolved chain head plus its fused score.
#[derive(Clone)]
struct Candidate {
    meta: TileMeta,
    chain: TileChain,
    owner: String,
    raw: f64,
}

pub struct QueryPlanner {
    config: TesseraConfig,
    graph: Arc<SnapshotGraph>,
    tier: Arc<TieringEngine>,
    index: Arc<SemanticIndex>,
    hint_log: Arc<HintLog>,
    metrics: Arc<Metrics>,
    plan_cache: DashMap<(String, String), CachedPlan>,
}

impl QueryPlanner {
    pub fn new(
        config: TesseraConfig,
        graph: Arc<SnapshotGraph>,
        tier: Arc<TieringEngine>,
        index: Arc<SemanticIndex>,
        hint_log: Arc<HintLog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            graph,
            tier,
            index,
            hint_log,
            metrics,
            plan_cache: DashMap::new(),
        }
    }

    /// Plan one query. Partial outcomes are successful plans with a
    /// reason; `Err` is reserved for invalid requests and unrecoverable
    /// dependency failures.
    pub async fn plan(&self, req: QueryRequest) -> TesseraResult<QueryPlan> {
        let started = Instant::now();
        req.validate()
            .map_err(|reason| TesseraError::InvalidInput { reason })?;
        self.graph.require(&req.snapshot_id)?;

        let budget = Duration::from_millis(req.budget_ms);
        let goal = (!req.goal.is_empty()).then(|| Vector::new(req.goal.clone()));
        let text = req.text.as_deref().filter(|t| !t.is_empty());
        let cache_key = (request_digest(&req), req.snapshot_id.clone());

        // Identical repeats within the TTL are served straight from cache.
        // With the index degraded the fallback path serves the same cache
        // entry instead, marked partial.
        if self.index.is_available() {
            if let Some(plan) = self.cached_plan(&cache_key, true) {
                self.metrics.plan_cache_hits.fetch_add(1, Ordering::Relaxed);
                self.pin_plan_chains(&plan);
                self.metrics.record_query_latency(elapsed_ms(started));
                return Ok(plan);
            }
        }

        let (max_level, min_level) = req.level_range;
        let visible = self.graph.visible_tiles(
            &req.snapshot_id,
            Some(req.stream),
            Some(req.level_range),
            None,
        );
        let heads: HashMap<TileId, (TileCoord, TileChain, String)> = visible
            .into_iter()
            .map(|(coord, chain, owner)| (chain.head(), (coord, chain, owner)))
            .collect();
        let hints = self.hint_log.recent(&req.snapshot_id, req.stream);

        // Coarse: summary tiles from the top one or two levels present,
        // served from RAM, attempted regardless of budget
        let top_level = heads
            .values()
            .map(|(coord, _, _)| coord.level)
            .max()
            .unwrap_or(max_level);
        let coarse_floor = top_level.saturating_sub(1).max(self.config.coarse_level_cutoff);
        let coarse_allowed: HashSet<TileId> = heads
            .iter()
            .filter(|(_, (coord, _, _))| coord.level >= coarse_floor)
            .map(|(id, _)| *id)
            .collect();
        let coarse_hits = if coarse_allowed.is_empty() {
            Vec::new()
        } else if let Some(goal) = goal.as_ref() {
            self.index
                .search_coarse(goal, self.config.coarse_max_tiles, Some(&coarse_allowed))
        } else if let Some(text) = text {
            self.index
                .search_lexical(text, self.config.coarse_max_tiles, Some(&coarse_allowed))
        } else {
            Vec::new()
        };
        let coarse_picks = self.build_candidates(&coarse_hits, &heads, &hints, max_level);

        if started.elapsed() >= budget {
            let confidence = if coarse_picks.is_empty() { 0.0 } else { 0.55 };
            return Ok(self.finish(
                &req,
                started,
                coarse_picks,
                Vec::new(),
                0,
                0,
                confidence,
                Acceptance::Partial,
                Some(PartialReason::BudgetExpired),
                &cache_key,
            ));
        }

        // Localize: nearest neighbors in the fine tiers become regions of
        // interest at the finest requested level
        let fine_allowed: HashSet<TileId> = heads
            .iter()
            .filter(|(_, (coord, _, _))| coord.level < coarse_floor)
            .map(|(id, _)| *id)
            .collect();
        let localized = match self.localize(goal.as_ref(), text, &fine_allowed) {
            Ok(hits) => hits,
            Err(err) => {
                debug!(error = %err, "fine index unavailable, using fallback");
                return self.degraded_plan(&req, started, &cache_key, &heads, &hints, max_level);
            }
        };

        let mut rois: Vec<BBox> = Vec::new();
        for hit in localized.iter().take(REFINE_SOFT_K) {
            if let Some((coord, _, _)) = heads.get(&hit.tile_id) {
                if let Some(roi) = coord.project_to(min_level) {
                    rois.push(roi);
                }
            }
        }
        for hint in &hints {
            for bbox in hint.bboxes.iter().take(4) {
                rois.push(bbox_at_level(bbox, hint.level_range.1, min_level));
            }
        }

        if started.elapsed() >= budget {
            let candidates = self.build_candidates(&localized, &heads, &hints, max_level);
            let total = region_cells(&rois).len();
            let confidence = if coarse_picks.is_empty() && candidates.is_empty() {
                0.0
            } else {
                0.55
            };
            return Ok(self.finish(
                &req,
                started,
                coarse_picks,
                candidates,
                0,
                total,
                confidence,
                Acceptance::Partial,
                Some(PartialReason::BudgetExpired),
                &cache_key,
            ));
        }

        // Refine: read up to K tiles inside the regions, finest levels only
        let refine_ceiling = max_level.min(2);
        let similarity: HashMap<TileId, f32> =
            localized.iter().map(|h| (h.tile_id, h.score)).collect();
        let mut refine_pool: Vec<Candidate> = Vec::new();
        for (id, (coord, chain, owner)) in &heads {
            if coord.level < min_level || coord.level > refine_ceiling {
                continue;
            }
            let Some(cover) = coord.project_to(min_level) else {
                continue;
            };
            if !rois.iter().any(|roi| roi.intersects(&cover)) {
                continue;
            }
            let sim = similarity.get(id).copied().unwrap_or(0.0) as f64;
            if let Some(c) = self.candidate(*id, coord, chain, owner, sim, &hints, max_level) {
                refine_pool.push(c);
            }
        }
        sort_candidates(&mut refine_pool, &self.graph);

        let roi_slots = region_cells(&rois).len().max(1);
        let k = REFINE_SOFT_K
            .min(roi_slots)
            .min(self.config.refine_k_cap)
            .min(req.max_tiles);

        let mut refined: Vec<Candidate> = Vec::new();
        let mut corrupt = 0usize;
        let mut attempted = 0usize;
        let mut budget_hit = false;
        let mut last_corruption = None;
        for candidate in refine_pool {
            if refined.len() >= k {
                break;
            }
            if started.elapsed() >= budget {
                budget_hit = true;
                break;
            }
            attempted += 1;
            match self.tier.read(&candidate.meta).await {
                Ok(_) => refined.push(candidate),
                Err(err @ TesseraError::Corruption { .. }) => {
                    corrupt += 1;
                    warn!(tile_id = %candidate.meta.tile_id, "skipping corrupt refine candidate");
                    last_corruption = Some(err);
                }
                Err(err) => {
                    debug!(tile_id = %candidate.meta.tile_id, error = %err, "refine read failed");
                }
            }
        }

        // Every candidate failing integrity is the one unrecoverable refine
        // outcome; anything short of that degrades to a partial plan
        if attempted > 0 && refined.is_empty() && corrupt == attempted {
            if let Some(err) = last_corruption {
                self.metrics.queries_failed.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        }

        // Accept: recall or confidence clears its threshold, else the plan
        // is explicitly partial
        let covers: Vec<BBox> = refined
            .iter()
            .filter_map(|c| c.meta.coord().project_to(min_level))
            .collect();
        let (covered, total) = roi_coverage(&rois, &covers, min_level);
        let recall = if total == 0 {
            0.0
        } else {
            covered as f32 / total as f32
        };
        let hint_ratio = if refined.is_empty() {
            0.0
        } else {
            refined
                .iter()
                .filter(|c| hint_overlap(&c.meta.coord(), &hints) > 0.0)
                .count() as f32
                / refined.len() as f32
        };
        let confidence = if refined.is_empty() && coarse_picks.is_empty() {
            0.0
        } else {
            (0.55 + 0.08 * refined.len() as f32 + 0.25 * hint_ratio).min(0.99)
        };

        let (acceptance, reason) = if recall >= self.config.recall_threshold
            || confidence >= self.config.confidence_threshold
        {
            (Acceptance::Accepted, None)
        } else if budget_hit || started.elapsed() >= budget {
            (Acceptance::Partial, Some(PartialReason::BudgetExpired))
        } else {
            (Acceptance::Partial, Some(PartialReason::AcceptanceUnmet))
        };

        Ok(self.finish(
            &req,
            started,
            coarse_picks,
            refined,
            covered,
            total,
            confidence,
            acceptance,
            reason,
            &cache_key,
        ))
    }

    fn localize(
        &self,
        goal: Option<&Vector>,
        text: Option<&str>,
        allowed: &HashSet<TileId>,
    ) -> TesseraResult<Vec<SearchHit>> {
        let pool = self.config.rerank_top_n;
        let mut merged: HashMap<TileId, f32> = HashMap::new();
        if let Some(goal) = goal {
            for hit in self.index.search_fine(goal, pool, Some(allowed))? {
                merged.insert(hit.tile_id, hit.score);
            }
        }
        if let Some(text) = text {
            for hit in self.index.search_lexical(text, pool, Some(allowed)) {
                merged
                    .entry(hit.tile_id)
                    .and_modify(|s| *s = s.max(hit.score))
                    .or_insert(hit.score);
            }
        }
        let hits: Vec<SearchHit> = merged
            .into_iter()
            .map(|(tile_id, score)| SearchHit::new(tile_id, score))
            .collect();
        let mut reranked = self.index.rerank(goal, text, hits);
        reranked.retain(|h| h.score > 0.0);
        Ok(reranked)
    }

    /// Index-down ladder: a cached prior plan first, then a heuristic scan
    /// over tiles that are already warm, then a typed failure.
    fn degraded_plan(
        &self,
        req: &QueryRequest,
        started: Instant,
        cache_key: &(String, String),
        heads: &HashMap<TileId, (TileCoord, TileChain, String)>,
        hints: &[Hint],
        max_level: u8,
    ) -> TesseraResult<QueryPlan> {
        if let Some(mut plan) = self.cached_plan(cache_key, false) {
            plan.acceptance = Acceptance::Partial;
            plan.partial_reason = Some(PartialReason::IndexDegraded);
            plan.elapsed_ms = elapsed_ms(started);
            self.pin_plan_chains(&plan);
            self.metrics.queries_partial.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_query_latency(plan.elapsed_ms);
            return Ok(plan);
        }

        let warm: HashSet<TileId> = self.tier.warm_ids().into_iter().collect();
        let mut pool: Vec<Candidate> = Vec::new();
        for (id, (coord, chain, owner)) in heads {
            if !warm.contains(id) {
                continue;
            }
            if let Some(c) = self.candidate(*id, coord, chain, owner, 0.0, hints, max_level) {
                pool.push(c);
            }
        }
        if pool.is_empty() {
            self.metrics.queries_failed.fetch_add(1, Ordering::Relaxed);
            return Err(TesseraError::IndexUnavailable {
                reason: "no cached plan and no warm tiles to scan".to_string(),
            });
        }
        sort_candidates(&mut pool, &self.graph);
        pool.truncate(req.max_tiles);

        let plan = self.finish(
            req,
            started,
            Vec::new(),
            pool,
            0,
            0,
            0.0,
            Acceptance::Partial,
            Some(PartialReason::IndexDegraded),
            cache_key,
        );
        Ok(plan)
    }

    fn build_candidates(
        &self,
        hits: &[SearchHit],
        heads: &HashMap<TileId, (TileCoord, TileChain, String)>,
        hints: &[Hint],
        max_level: u8,
    ) -> Vec<Candidate> {
        let mut out = Vec::new();
        for hit in hits {
            if let Some((coord, chain, owner)) = heads.get(&hit.tile_id) {
                if let Some(c) =
                    self.candidate(hit.tile_id, coord, chain, owner, hit.score as f64, hints, max_level)
                {
                    out.push(c);
                }
            }
        }
        sort_candidates(&mut out, &self.graph);
        out
    }

    fn candidate(
        &self,
        id: TileId,
        coord: &TileCoord,
        chain: &TileChain,
        owner: &str,
        similarity: f64,
        hints: &[Hint],
        max_level: u8,
    ) -> Option<Candidate> {
        let meta = self.tier.store().meta(&id)?;
        let raw = self.score(coord, &meta, similarity, hints, max_level);
        Some(Candidate {
            meta,
            chain: chain.clone(),
            owner: owner.to_string(),
            raw,
        })
    }

    /// Fused ranking score. Similarity leads; level, hotness, recency and
    /// hint overlap add; distance from the attention origin subtracts.
    fn score(
        &self,
        coord: &TileCoord,
        meta: &TileMeta,
        similarity: f64,
        hints: &[Hint],
        max_level: u8,
    ) -> f64 {
        let usage = self.tier.store().usage_of(&meta.tile_id);
        let access_count = usage.as_ref().map(|u| u.access_count).unwrap_or(0);
        let last_access = usage.map(|u| u.last_access).unwrap_or(meta.created_at);
        let age_secs = Utc::now()
            .signed_duration_since(last_access)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let recency =
            RECENCY_MAX_POINTS * (1.0 - (age_secs / RECENCY_WINDOW_SECS)).clamp(0.0, 1.0);
        let level_points = (max_level.saturating_sub(coord.level)) as f64 * LEVEL_WEIGHT;
        let hotness = ((1 + access_count) as f64).ln() * HOTNESS_WEIGHT;
        let hint_points = hint_overlap(coord, hints) * HINT_BONUS;
        let distance = (coord.x.unsigned_abs() as f64 + coord.y.unsigned_abs() as f64)
            * DISTANCE_PENALTY;
        similarity * SIM_WEIGHT + level_points + hotness + recency + hint_points - distance
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        req: &QueryRequest,
        started: Instant,
        coarse: Vec<Candidate>,
        fine: Vec<Candidate>,
        covered: usize,
        total: usize,
        confidence: f32,
        acceptance: Acceptance,
        reason: Option<PartialReason>,
        cache_key: &(String, String),
    ) -> QueryPlan {
        let mut all = fine;
        for c in coarse {
            if !all.iter().any(|x| x.meta.tile_id == c.meta.tile_id) {
                all.push(c);
            }
        }
        sort_candidates(&mut all, &self.graph);
        all.truncate(req.max_tiles);

        let chain_ids: Vec<TileId> = all
            .iter()
            .flat_map(|c| c.chain.tiles.iter().copied())
            .collect();
        self.tier.pin_plan(chain_ids);

        let tiles: Vec<PlannedTile> = all
            .iter()
            .map(|c| PlannedTile {
                tile_id: c.meta.tile_id,
                stream: c.meta.stream,
                snapshot_id: c.owner.clone(),
                level: c.meta.level,
                x: c.meta.x,
                y: c.meta.y,
                score: c.raw as f32,
            })
            .collect();

        let recall = if total == 0 {
            0.0
        } else {
            covered as f32 / total as f32
        };
        let elapsed = elapsed_ms(started);
        let plan = QueryPlan {
            query_id: format!("qry-{}", uuid::Uuid::new_v4().simple()),
            snapshot_id: req.snapshot_id.clone(),
            stream: req.stream,
            tiles,
            acceptance,
            partial_reason: reason,
            confidence,
            recall_estimate: recall,
            budget_ms: req.budget_ms,
            elapsed_ms: elapsed,
        };

        if acceptance == Acceptance::Accepted {
            self.cache_plan(cache_key.clone(), plan.clone());
        } else {
            self.metrics.queries_partial.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.record_query_latency(elapsed);
        debug!(
            query_id = %plan.query_id,
            tiles = plan.tiles.len(),
            ?acceptance,
            elapsed_ms = elapsed,
            "plan finished"
        );
        plan
    }

    fn cached_plan(&self, key: &(String, String), respect_ttl: bool) -> Option<QueryPlan> {
        let entry = self.plan_cache.get(key)?;
        if respect_ttl && entry.cached_at.elapsed() > self.config.plan_cache_ttl {
            return None;
        }
        Some(entry.plan.clone())
    }

    fn cache_plan(&self, key: (String, String), plan: QueryPlan) {
        if self.plan_cache.len() >= self.config.plan_cache_capacity
            && !self.plan_cache.contains_key(&key)
        {
            // Drop the stalest entry to stay within capacity
            let oldest = self
                .plan_cache
                .iter()
                .min_by_key(|e| e.value().cached_at)
                .map(|e| e.key().clone());
            if let Some(oldest) = oldest {
                self.plan_cache.remove(&oldest);
            }
        }
        self.plan_cache.insert(
            key,
            CachedPlan {
                plan,
                cached_at: Instant::now(),
            },
        );
    }

    fn pin_plan_chains(&self, plan: &QueryPlan) {
        let mut ids = Vec::new();
        for tile in &plan.tiles {
            if let Some(chain) = self.graph.chain_at(&tile.snapshot_id, &tile.coord()) {
                ids.extend(chain.tiles);
            }
        }
        if !ids.is_empty() {
            self.tier.pin_plan(ids);
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Digest of everything that makes two requests equivalent for caching.
fn request_digest(req: &QueryRequest) -> String {
    let mut hasher = blake3::Hasher::new();
    for value in &req.goal {
        hasher.update(&value.to_le_bytes());
    }
    hasher.update(&[0x00]);
    if let Some(text) = &req.text {
        hasher.update(text.as_bytes());
    }
    hasher.update(&[0x00]);
    hasher.update(req.stream.as_str().as_bytes());
    hasher.update(&[req.level_range.0, req.level_range.1]);
    hasher.update(&(req.max_tiles as u64).to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Order candidates best-first: fused score, then finer level, then the
/// younger owning snapshot, then id.
fn sort_candidates(pool: &mut [Candidate], graph: &SnapshotGraph) {
    let created: HashMap<String, DateTime<Utc>> = pool
        .iter()
        .filter_map(|c| graph.get(&c.owner).map(|s| (c.owner.clone(), s.created_at)))
        .collect();
    pool.sort_by(|a, b| {
        b.raw
            .partial_cmp(&a.raw)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.meta.level.cmp(&b.meta.level))
            .then_with(|| {
                let ca = created.get(&a.owner);
                let cb = created.get(&b.owner);
                cb.cmp(&ca)
            })
            .then_with(|| a.meta.tile_id.cmp(&b.meta.tile_id))
    });
}

/// Reproject a bbox between pyramid grids. Coarsening floors the corners;
/// refining multiplies them out to the full covered span.
fn bbox_at_level(bbox: &BBox, from: u8, to: u8) -> BBox {
    if to >= from {
        return scale_bbox(bbox, from, to);
    }
    let factor = 1i64 << u8::min(from - to, 30);
    let clamp = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    BBox {
        x: clamp((bbox.x as i64).saturating_mul(factor)),
        y: clamp((bbox.y as i64).saturating_mul(factor)),
        w: (bbox.w as u64)
            .saturating_mul(factor as u64)
            .min(u32::MAX as u64) as u32,
        h: (bbox.h as u64)
            .saturating_mul(factor as u64)
            .min(u32::MAX as u64) as u32,
    }
}

/// Max confidence of any recent hint whose regions overlap this tile.
fn hint_overlap(coord: &TileCoord, hints: &[Hint]) -> f64 {
    let mut best = 0f32;
    for hint in hints {
        if hint.stream != coord.stream {
            continue;
        }
        let fine = hint.level_range.1;
        for bbox in &hint.bboxes {
            let overlaps = if coord.level >= fine {
                scale_bbox(bbox, fine, coord.level).contains(coord.x, coord.y)
            } else {
                // Tile is finer than the hint's grid; compare its ancestor
                let shift = 1i64 << (fine - coord.level).min(62);
                let ax = (coord.x as i64).div_euclid(shift) as i32;
                let ay = (coord.y as i64).div_euclid(shift) as i32;
                bbox.contains(ax, ay)
            };
            if overlaps {
                best = best.max(hint.confidence);
            }
        }
    }
    best as f64
}

/// Distinct cells across all regions, capped to keep enumeration bounded.
fn region_cells(rois: &[BBox]) -> HashSet<(i32, i32)> {
    let mut cells = HashSet::new();
    'all: for roi in rois {
        for dx in 0..roi.w.min(MAX_ROI_CELLS as u32) {
            for dy in 0..roi.h.min(MAX_ROI_CELLS as u32) {
                cells.insert((roi.x + dx as i32, roi.y + dy as i32));
                if cells.len() >= MAX_ROI_CELLS {
                    break 'all;
                }
            }
        }
    }
    cells
}

/// How many region cells the selected tiles cover, with the total.
fn roi_coverage(rois: &[BBox], covers: &[BBox], _min_level: u8) -> (usize, usize) {
    let cells = region_cells(rois);
    let covered = cells
        .iter()
        .filter(|(x, y)| covers.iter().any(|c| c.contains(*x, *y)))
        .count();
    (covered, cells.len())
}
