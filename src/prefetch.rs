//! Prefetch scheduler: turns advisory hints into warm tiles.
//!
//! Hints arrive on a bounded channel and are consumed by one background
//! worker, so foreground queries never wait on prefetch work. The worker
//! resolves each hint's regions to tile chains through the snapshot graph
//! and asks the tiering engine to warm them. Everything here is advisory:
//! a full channel drops the hint, an expired hint is logged and skipped,
//! and promotion failures are logged rather than surfaced.
//!
//! Processed hints are also kept in a short recency log the planner reads
//! to boost tiles that overlap freshly hinted regions.

use crate::config::TesseraConfig;
use crate::graph::SnapshotGraph;
use crate::metrics::Metrics;
use crate::tier::TieringEngine;
use crate::types::{BBox, Hint, Stream, TileId};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Most hints drained per wakeup before yielding back to the runtime.
const MAX_BATCH: usize = 32;
/// Upper bound on tiles one hint may stage.
const MAX_TILES_PER_HINT: usize = 64;
/// Recent hints kept for planner scoring.
const HINT_LOG_CAPACITY: usize = 256;

/// Ring of recently processed hints, pruned by age on read.
pub struct HintLog {
    ttl: Duration,
    entries: Mutex<VecDeque<Hint>>,
}

impl HintLog {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, hint: Hint) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.push_back(hint);
        while entries.len() > HINT_LOG_CAPACITY {
            entries.pop_front();
        }
    }

    /// Unexpired hints for one snapshot and stream, oldest first.
    pub fn recent(&self, snapshot_id: &str, stream: Stream) -> Vec<Hint> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let now = Utc::now();
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|h| {
                h.snapshot_id == snapshot_id && h.stream == stream && h.age(now) <= ttl
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All unexpired hints (catalog save path).
    pub fn all(&self) -> Vec<Hint> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        entries.iter().cloned().collect()
    }
}

/// Handle for submitting hints; owns the background worker.
pub struct PrefetchScheduler {
    tx: mpsc::Sender<Hint>,
    hint_log: Arc<HintLog>,
    metrics: Arc<Metrics>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrefetchScheduler {
    pub fn spawn(
        config: &TesseraConfig,
        graph: Arc<SnapshotGraph>,
        tier: Arc<TieringEngine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.hint_channel_capacity);
        let hint_log = Arc::new(HintLog::new(config.hint_ttl));
        let worker = tokio::spawn(worker_loop(
            rx,
            graph,
            tier,
            hint_log.clone(),
            metrics.clone(),
            config.hint_ttl,
        ));
        Self {
            tx,
            hint_log,
            metrics,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue one hint. Returns `false` when the queue is full or closed;
    /// the hint is dropped in that case, never blocked on.
    pub fn submit(&self, hint: Hint) -> bool {
        match self.tx.try_send(hint) {
            Ok(()) => true,
            Err(err) => {
                self.metrics.hints_stale.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "hint dropped, queue unavailable");
                false
            }
        }
    }

    pub fn hint_log(&self) -> &Arc<HintLog> {
        &self.hint_log
    }

    pub async fn shutdown(&self) {
        let handle = self.worker.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<Hint>,
    graph: Arc<SnapshotGraph>,
    tier: Arc<TieringEngine>,
    hint_log: Arc<HintLog>,
    metrics: Arc<Metrics>,
    ttl: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(hint) => batch.push(hint),
                Err(_) => break,
            }
        }
        for hint in batch {
            process_hint(hint, &graph, &tier, &hint_log, &metrics, ttl).await;
        }
    }
    debug!("prefetch worker stopped");
}

async fn process_hint(
    hint: Hint,
    graph: &SnapshotGraph,
    tier: &TieringEngine,
    hint_log: &HintLog,
    metrics: &Metrics,
    ttl: Duration,
) {
    metrics.hints_received.fetch_add(1, Ordering::Relaxed);

    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120));
    if hint.age(Utc::now()) > ttl {
        metrics.hints_stale.fetch_add(1, Ordering::Relaxed);
        debug!(query_id = %hint.query_id, "hint expired before processing");
        return;
    }
    hint_log.record(hint.clone());

    let targets = resolve_hint_tiles(&hint, graph);
    if targets.is_empty() {
        return;
    }
    match tier.ensure_warm(&targets).await {
        Ok(promoted) => {
            // Only tiles actually resident count toward coverage
            let staged: Vec<TileId> = targets
                .iter()
                .filter(|id| tier.is_warm(id))
                .copied()
                .collect();
            tier.note_prefetched(&staged);
            if promoted > 0 {
                debug!(
                    query_id = %hint.query_id,
                    staged = staged.len(),
                    promoted,
                    "hint staged tiles"
                );
            }
        }
        Err(err) => {
            warn!(query_id = %hint.query_id, error = %err, "hint promotion failed");
        }
    }
}

/// Expand a hint's regions into the tile ids needed to serve them,
/// including every chain member so materialization stays warm-only.
fn resolve_hint_tiles(hint: &Hint, graph: &SnapshotGraph) -> Vec<TileId> {
    let (max_level, min_level) = hint.level_range;
    let mut ids: Vec<TileId> = Vec::new();
    'levels: for level in min_level..=max_level {
        for bbox in &hint.bboxes {
            let scaled = scale_bbox(bbox, min_level, level);
            let visible = graph.visible_tiles(
                &hint.snapshot_id,
                Some(hint.stream),
                Some((level, level)),
                Some(scaled),
            );
            for (_, chain, _) in visible {
                for id in &chain.tiles {
                    if !ids.contains(id) {
                        ids.push(*id);
                    }
                    if ids.len() >= MAX_TILES_PER_HINT {
                        break 'levels;
                    }
                }
            }
        }
    }
    ids
}

/// Project a bounding box from a finer level to a coarser one. Tile x/y
/// halve per level, so the scaled box covers every coarse tile any fine
/// tile in the box folds into.
pub fn scale_bbox(bbox: &BBox, from_level: u8, to_level: u8) -> BBox {
    if to_level <= from_level {
        return *bbox;
    }
    let factor = 1i64 << (to_level - from_level).min(62);
    let x1 = (bbox.x as i64).div_euclid(factor);
    let y1 = (bbox.y as i64).div_euclid(factor);
    let x2 = (bbox.x as i64 + bbox.w.max(1) as i64 - 1).div_euclid(factor);
    let y2 = (bbox.y as i64 + bbox.h.max(1) as i64 - 1).div_euclid(factor);
    BBox {
        x: x1 as i32,
        y: y1 as i32,
        w: (x2 - x1 + 1) as u32,
        h: (y2 - y1 + 1) as u32,
    }
}
