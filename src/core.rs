//! The main Tessera handle.
//!
//! Wires the store, snapshot graph, tiering engine, semantic index, query
//! planner, prefetch scheduler, and replay log together behind one cloneable
//! facade, and owns the background maintenance loop that drives eviction,
//! coalescing, and index flushes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::catalog;
use crate::config::TesseraConfig;
use crate::error::{TesseraError, TesseraResult};
use crate::graph::SnapshotGraph;
use crate::index::{vector_from_f32_payload, IndexStats, SemanticIndex};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::planner::QueryPlanner;
use crate::prefetch::PrefetchScheduler;
use crate::replay::{ReplayLog, ReplayReport};
use crate::store::{StoreStats, TileStore};
use crate::tier::{TierStats, TieringEngine};
use crate::types::{
    payload_digest, CreateSnapshot, Hint, MergePolicy, QueryPlan, QueryRequest, Snapshot, Stream,
    Tile, TileCoord, TileId, TileMeta, TileRecord, Trace,
};

/// A hierarchical tile store with content-addressed storage, snapshot
/// lineage, two-tier residency, and budgeted query planning.
///
/// `Tessera` is cheap to clone (all state lives behind `Arc`s) and safe to
/// share across tasks. One instance owns one data directory; opening the
/// same directory twice from the same process is not supported.
///
/// # Example
///
/// ```ignore
/// use tessera::{CreateSnapshot, QueryRequest, Tessera, TileRecord};
/// use tessera::types::{Dtype, Stream};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let db = Tessera::open_in("./tessera-data").await?;
///
///     let snapshot = db.create_snapshot(CreateSnapshot::default()).await?;
///
///     // Write one embedding tile at the finest level.
///     let payload: Vec<u8> = 0.7f32.to_le_bytes().to_vec();
///     db.ingest(vec![TileRecord::full(
///         Stream::Embedding,
///         &snapshot.snapshot_id,
///         0,
///         4,
///         -2,
///         (1, 1, 1),
///         Dtype::F32,
///         payload,
///     )])
///     .await?;
///
///     // Ask for the regions most similar to a goal vector.
///     let plan = db
///         .query(QueryRequest::new(vec![0.7], &snapshot.snapshot_id, 50))
///         .await?;
///     println!("planned {} tiles", plan.tiles.len());
///
///     db.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Tessera {
    config: TesseraConfig,
    store: Arc<TileStore>,
    graph: Arc<SnapshotGraph>,
    tier: Arc<TieringEngine>,
    index: Arc<SemanticIndex>,
    planner: Arc<QueryPlanner>,
    prefetch: Arc<PrefetchScheduler>,
    replay: Arc<ReplayLog>,
    metrics: Arc<Metrics>,
    /// One lock per snapshot id serializes chain mutation during ingest.
    ingest_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    maintenance: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for Tessera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tessera")
            .field("data_dir", &self.config.data_dir)
            .field("tiles", &self.store.len())
            .field("snapshots", &self.graph.len())
            .finish()
    }
}

impl Tessera {
    /// Open (or create) a tile store in `config.data_dir`.
    ///
    /// When a catalog file from a previous run exists it is loaded first:
    /// tile metadata, snapshot lineage, cold locations, usage counters,
    /// hints, and traces all come back, and the RAM-resident index tiers
    /// are rebuilt from the restored metadata. Payloads themselves are
    /// never copied around by open; they stay where the tiers put them.
    pub async fn open(config: TesseraConfig) -> TesseraResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(
            TileStore::open(
                &config.data_dir,
                config.retry_attempts,
                config.retry_base_delay,
                metrics.clone(),
            )
            .await?,
        );
        let graph = Arc::new(SnapshotGraph::new());
        let tier = Arc::new(TieringEngine::new(
            config.clone(),
            store.clone(),
            metrics.clone(),
        ));
        let index = Arc::new(
            SemanticIndex::open(
                config.data_dir.join("index"),
                config.coarse_level_cutoff,
                config.rerank_top_n,
            )
            .await?,
        );
        let prefetch = Arc::new(PrefetchScheduler::spawn(
            &config,
            graph.clone(),
            tier.clone(),
            metrics.clone(),
        ));
        let replay = Arc::new(ReplayLog::new(tier.clone(), metrics.clone()));
        let planner = Arc::new(QueryPlanner::new(
            config.clone(),
            graph.clone(),
            tier.clone(),
            index.clone(),
            prefetch.hint_log().clone(),
            metrics.clone(),
        ));

        let catalog_path = config.data_dir.join(catalog::CATALOG_FILE);
        if catalog::exists(&catalog_path).await {
            catalog::load(
                &catalog_path,
                &store,
                &graph,
                &tier,
                prefetch.hint_log(),
                &replay,
            )
            .await?;
        }

        let db = Self {
            config,
            store,
            graph,
            tier,
            index,
            planner,
            prefetch,
            replay,
            metrics,
            ingest_locks: Arc::new(DashMap::new()),
            maintenance: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        };

        db.restore_ram_index().await;

        let handle = db.spawn_maintenance();
        if let Ok(mut guard) = db.maintenance.lock() {
            *guard = Some(handle);
        }

        info!(
            data_dir = %db.config.data_dir.display(),
            tiles = db.store.len(),
            snapshots = db.graph.len(),
            "tessera opened"
        );
        Ok(db)
    }

    /// Open with default configuration rooted at `data_dir`.
    pub async fn open_in(data_dir: impl AsRef<Path>) -> TesseraResult<Self> {
        Self::open(TesseraConfig::new(data_dir.as_ref())).await
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Create a snapshot node. Parents must already exist.
    pub async fn create_snapshot(&self, req: CreateSnapshot) -> TesseraResult<Snapshot> {
        self.graph.create_snapshot(req)
    }

    /// Fetch one snapshot by id.
    pub fn get_snapshot(&self, snapshot_id: &str) -> TesseraResult<Snapshot> {
        self.graph.require(snapshot_id)
    }

    /// All snapshots, newest first.
    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.graph.list()
    }

    /// Merge two snapshots into a new one, resolving per-tile divergence
    /// with `policy` (or each snapshot's own policy when `None`).
    ///
    /// Returns [`TesseraError::Conflict`] listing every undecidable tile
    /// when the policy leaves divergence unresolved; no partial merge node
    /// is created in that case.
    pub async fn merge(
        &self,
        a: &str,
        b: &str,
        policy: Option<MergePolicy>,
    ) -> TesseraResult<Snapshot> {
        self.graph.merge(&self.tier, a, b, policy).await
    }

    // ------------------------------------------------------------------
    // Tiles
    // ------------------------------------------------------------------

    /// Ingest a batch of tiles, returning the head metadata for each in
    /// input order.
    ///
    /// Each record is committed independently: payload bytes are written
    /// before the chain pointer moves, so a failure mid-batch leaves
    /// earlier records fully applied and the failing record's bytes as
    /// unreferenced (harmless) content. Delta records must name the
    /// current chain head as their base; a stale base is rejected with
    /// [`TesseraError::InvalidInput`] so the caller can re-read and
    /// re-encode. When a chain grows past `max_delta_depth` the head is
    /// promoted: the materialized content is written back as a new full
    /// tile and the returned metadata describes that promoted tile.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let metas = db.ingest(vec![record]).await?;
    /// assert_eq!(metas.len(), 1);
    /// ```
    pub async fn ingest(&self, records: Vec<TileRecord>) -> TesseraResult<Vec<TileMeta>> {
        let mut heads = Vec::with_capacity(records.len());
        for record in records {
            heads.push(self.ingest_one(record).await?);
        }
        Ok(heads)
    }

    async fn ingest_one(&self, record: TileRecord) -> TesseraResult<TileMeta> {
        if record.payload.is_empty() {
            return Err(TesseraError::InvalidInput {
                reason: "tile payload must not be empty".to_string(),
            });
        }
        self.graph.require(&record.snapshot_id)?;

        let actual = payload_digest(&record.payload);
        if let Some(expected) = &record.checksum {
            if expected != &actual {
                return Err(TesseraError::Integrity {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let lock = self.ingest_lock(&record.snapshot_id);
        let _guard = lock.lock().await;

        let coord = TileCoord::new(record.stream, record.level, record.x, record.y);
        let tile_id = TileId::compute(
            record.stream,
            &record.snapshot_id,
            record.level,
            record.x,
            record.y,
            &record.payload,
        );

        // Retried submission of a tile that is already in its chain.
        if let Some(existing) = self.store.meta(&tile_id) {
            if self
                .graph
                .resolve(&record.snapshot_id, &coord)
                .is_some_and(|(_, chain)| chain.contains(&tile_id))
            {
                return Ok(existing);
            }
        }

        let meta = TileMeta {
            tile_id,
            stream: record.stream,
            snapshot_id: record.snapshot_id.clone(),
            level: record.level,
            x: record.x,
            y: record.y,
            shape: record.shape,
            dtype: record.dtype,
            halo: record.halo,
            parent_tile_id: record.delta_base,
            checksum: actual,
            size_bytes: record.payload.len() as u64,
            tags: record.tags.clone(),
            created_at: Utc::now(),
        };

        let (head, content) = if let Some(base) = record.delta_base {
            let chain = self
                .graph
                .resolve(&record.snapshot_id, &coord)
                .map(|(_, chain)| chain)
                .ok_or_else(|| TesseraError::InvalidInput {
                    reason: format!("delta base {base} has no chain at {coord}"),
                })?;
            if chain.head() != base {
                return Err(TesseraError::InvalidInput {
                    reason: format!(
                        "delta base {base} is not the current head at {coord}; \
                         re-read the tile and re-encode"
                    ),
                });
            }

            self.store.write_payload(&meta, &record.payload).await?;
            let depth = self
                .graph
                .record_delta_tile(&record.snapshot_id, coord, &chain, tile_id);
            self.tier.note_warm_insert(&meta).await;

            let content = self.tier.materialize(&tile_id).await?;
            if depth > self.config.max_delta_depth {
                let promoted = self.promote_to_full(&meta, &content).await?;
                (promoted, content)
            } else {
                (meta, content)
            }
        } else {
            self.store.write_payload(&meta, &record.payload).await?;
            self.graph
                .record_full_tile(&record.snapshot_id, coord, tile_id);
            self.tier.note_warm_insert(&meta).await;
            let content = record.payload;
            (meta, content)
        };

        let vector = match head.stream {
            Stream::Embedding => vector_from_f32_payload(&content),
            _ => None,
        };
        let text = match head.stream {
            Stream::Log => Some(String::from_utf8_lossy(&content).into_owned()),
            _ => None,
        };
        self.index.upsert(&head, vector, text.as_deref()).await;

        Ok(head)
    }

    /// Collapse an over-deep chain into a single full tile and repoint the
    /// chain at it. The old chain members stay in the store; other
    /// snapshots may still resolve through them.
    async fn promote_to_full(
        &self,
        delta_head: &TileMeta,
        content: &[u8],
    ) -> TesseraResult<TileMeta> {
        let coord = delta_head.coord();
        let tile_id = TileId::compute(
            delta_head.stream,
            &delta_head.snapshot_id,
            delta_head.level,
            delta_head.x,
            delta_head.y,
            content,
        );
        let promoted = TileMeta {
            tile_id,
            parent_tile_id: None,
            checksum: payload_digest(content),
            size_bytes: content.len() as u64,
            created_at: Utc::now(),
            ..delta_head.clone()
        };
        self.store.write_payload(&promoted, content).await?;
        self.graph
            .record_full_tile(&promoted.snapshot_id, coord, tile_id);
        self.tier.note_warm_insert(&promoted).await;
        self.metrics.depth_promotions.fetch_add(1, Ordering::Relaxed);
        debug!(
            tile_id = %tile_id,
            coord = %coord,
            snapshot_id = promoted.snapshot_id,
            "delta chain promoted to full tile"
        );
        Ok(promoted)
    }

    fn ingest_lock(&self, snapshot_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.ingest_locks
            .entry(snapshot_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Read one tile through snapshot lineage, materializing delta chains
    /// and promoting from cold when needed.
    pub async fn get_tile(&self, snapshot_id: &str, coord: &TileCoord) -> TesseraResult<Tile> {
        self.graph.require(snapshot_id)?;
        let (_, chain) =
            self.graph
                .resolve(snapshot_id, coord)
                .ok_or_else(|| TesseraError::TileNotFound {
                    snapshot_id: snapshot_id.to_string(),
                    coord: *coord,
                })?;
        self.read_tile(chain.head()).await
    }

    /// Read one tile directly by content address.
    pub async fn get_tile_by_id(&self, tile_id: &TileId) -> TesseraResult<Tile> {
        self.read_tile(*tile_id).await
    }

    async fn read_tile(&self, tile_id: TileId) -> TesseraResult<Tile> {
        let meta = self
            .store
            .meta(&tile_id)
            .ok_or(TesseraError::TileIdUnknown { tile_id })?;
        let payload = self.tier.materialize(&tile_id).await?;
        Ok(Tile { meta, payload })
    }

    /// Delete a tile that no snapshot references.
    ///
    /// Referenced tiles are refused with [`TesseraError::Referenced`];
    /// drop or merge the snapshot first.
    pub async fn delete_tile(&self, tile_id: &TileId) -> TesseraResult<()> {
        if self.store.meta(tile_id).is_none() {
            return Err(TesseraError::TileIdUnknown { tile_id: *tile_id });
        }
        if let Some(snapshot_id) = self.graph.referenced_by(tile_id) {
            return Err(TesseraError::Referenced {
                tile_id: *tile_id,
                snapshot_id,
            });
        }
        self.index.remove(tile_id).await;
        self.tier.forget(tile_id);
        self.store.unregister(tile_id).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query, prefetch, replay
    // ------------------------------------------------------------------

    /// Plan a retrieval within the request's tile and latency budgets.
    ///
    /// Always returns *something* while the store is reachable: a fully
    /// `Accepted` plan when recall and confidence clear their thresholds,
    /// otherwise a `Partial` plan carrying the best tiles found and the
    /// reason planning stopped. See [`QueryRequest`] for budget semantics.
    pub async fn query(&self, req: QueryRequest) -> TesseraResult<QueryPlan> {
        self.planner.plan(req).await
    }

    /// Submit an advisory prefetch hint. Returns `false` when the hint
    /// channel is full and the hint was dropped.
    pub fn prefetch(&self, hint: Hint) -> bool {
        self.prefetch.submit(hint)
    }

    /// Record a trace of `steps` against a snapshot so it can be replayed
    /// later. Each step names the tiles it read, in order.
    pub async fn record_trace(
        &self,
        snapshot_id: &str,
        seed: u64,
        steps: Vec<(String, Vec<TileId>)>,
    ) -> TesseraResult<Trace> {
        self.graph.require(snapshot_id)?;
        self.replay.record(snapshot_id, seed, steps).await
    }

    /// Re-execute a recorded trace and verify every step digest matches.
    pub async fn replay_trace(&self, trace_id: &str) -> TesseraResult<ReplayReport> {
        self.replay.replay(trace_id).await
    }

    /// Fetch a recorded trace without replaying it.
    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        self.replay.get(trace_id)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Flush everything that can be made durable: seal the open cold pack,
    /// append buffered fine-index records, and write the catalog.
    ///
    /// A degraded fine index does not fail persistence; its records stay
    /// buffered and the catalog is written regardless.
    pub async fn persist(&self) -> TesseraResult<()> {
        self.tier.flush_cold().await?;
        if let Err(err) = self.index.flush().await {
            debug!(error = %err, "fine index flush deferred; records stay buffered");
        }
        catalog::save(
            &self.catalog_path(),
            &self.store,
            &self.graph,
            &self.tier,
            self.prefetch.hint_log(),
            &self.replay,
        )
        .await
    }

    /// Rewrite the fine index log from live entries and rebuild the
    /// RAM-resident tiers from stored metadata. Returns the number of
    /// fine entries kept.
    pub async fn reindex(&self) -> TesseraResult<usize> {
        let kept = self.index.rebuild().await?;
        self.restore_ram_index().await;
        Ok(kept)
    }

    /// Rewrite cold packfiles to drop dead entries. Returns the number of
    /// packs compacted.
    pub async fn compact(&self) -> TesseraResult<usize> {
        self.tier.compact_packs().await
    }

    /// Current state of every subsystem.
    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: self.config.data_dir.clone(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            tiles: self.store.len(),
            snapshots: self.graph.len(),
            traces: self.replay.len(),
            tier: self.tier.stats(),
            index: self.index.stats(),
            store: self.store.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Persist state and stop background work. The handle stays usable
    /// for reads afterwards, but maintenance no longer runs.
    pub async fn shutdown(&self) -> TesseraResult<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self.maintenance.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.prefetch.shutdown().await;
        self.persist().await
    }

    /// Raw counters shared by every subsystem.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    fn catalog_path(&self) -> PathBuf {
        self.config.data_dir.join(catalog::CATALOG_FILE)
    }

    /// Rebuild the RAM-resident index tiers (coarse vectors, lexical
    /// postings) from stored metadata. The fine log is durable on its own
    /// and is not touched here.
    async fn restore_ram_index(&self) {
        let mut restored = 0usize;
        for meta in self.store.all_metas() {
            let wants_vector = meta.stream == Stream::Embedding
                && meta.level >= self.config.coarse_level_cutoff;
            let vector = if wants_vector {
                match self.tier.materialize(&meta.tile_id).await {
                    Ok(payload) => vector_from_f32_payload(&payload),
                    Err(err) => {
                        debug!(
                            tile_id = %meta.tile_id,
                            error = %err,
                            "coarse vector restore skipped"
                        );
                        None
                    }
                }
            } else {
                None
            };
            let text = if meta.stream == Stream::Log {
                match self.tier.materialize(&meta.tile_id).await {
                    Ok(payload) => Some(String::from_utf8_lossy(&payload).into_owned()),
                    Err(_) => None,
                }
            } else {
                None
            };
            self.index.reindex_tile(&meta, vector, text.as_deref());
            restored += 1;
        }
        if restored > 0 {
            debug!(tiles = restored, "index tiers restored from store metadata");
        }
    }

    /// Background loop: tier maintenance every `maintenance_interval`,
    /// fine-index flush every `index_flush_interval`.
    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let tier = self.tier.clone();
        let index = self.index.clone();
        let shutdown = self.shutdown.clone();
        let tick = self.config.maintenance_interval;
        let flush_every =
            (self.config.index_flush_interval.as_millis() / tick.as_millis().max(1)).max(1) as u64;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut ticks = 0u64;
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                tier.maintain().await;
                ticks += 1;
                if ticks % flush_every == 0 {
                    // Flush failures flip the index to degraded and are
                    // logged there; the loop keeps running.
                    let _ = index.flush().await;
                }
            }
        })
    }
}

/// Point-in-time view of the whole system, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub data_dir: PathBuf,
    pub uptime_secs: u64,
    pub tiles: usize,
    pub snapshots: usize,
    pub traces: usize,
    pub tier: TierStats,
    pub index: IndexStats,
    pub store: StoreStats,
    pub metrics: MetricsSnapshot,
}
