//! Catalog persistence: everything except payload bytes.
//!
//! Payloads already live on disk in content-addressed warm files and cold
//! packs. The catalog captures the rest of the state a restart needs: tile
//! metadata, usage counters, the snapshot DAG with its tile chains, the
//! cold index, recent hints and recorded traces.
//!
//! # File format
//!
//! One JSON document with a leading format version. The file is written to
//! a temporary sibling and atomically renamed into place, so a crash leaves
//! either the old catalog or the new one, never a torn mix. Loading a
//! catalog written by an incompatible version fails with a typed error
//! rather than a deserialization mess.

use crate::error::{TesseraError, TesseraResult};
use crate::graph::{SnapshotGraph, TileChain};
use crate::packfile::ColdLocation;
use crate::prefetch::HintLog;
use crate::replay::ReplayLog;
use crate::store::TileStore;
use crate::tier::TieringEngine;
use crate::types::{Hint, Snapshot, TileCoord, TileId, TileMeta, TileUsage, Trace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// File name under the data directory.
pub const CATALOG_FILE: &str = "catalog.json";

const CATALOG_VERSION: u32 = 1;

/// Serializable snapshot of all non-payload state.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogSnapshot {
    /// Format version for compatibility checks
    version: u32,
    saved_at: DateTime<Utc>,
    /// Lamport watermark; restored stamps stay strictly monotonic
    lamport: u64,
    snapshots: Vec<Snapshot>,
    chains: Vec<(String, TileCoord, TileChain)>,
    tiles: Vec<TileMeta>,
    usage: Vec<(TileId, TileUsage)>,
    cold_index: Vec<(TileId, ColdLocation)>,
    next_pack_seq: u64,
    hints: Vec<Hint>,
    traces: Vec<Trace>,
}

fn catalog_error(context: &str, err: impl std::fmt::Display) -> TesseraError {
    TesseraError::Catalog {
        reason: format!("{context}: {err}"),
    }
}

/// Write the catalog atomically to `path`.
pub async fn save(
    path: &Path,
    store: &TileStore,
    graph: &SnapshotGraph,
    tier: &TieringEngine,
    hint_log: &HintLog,
    replay: &ReplayLog,
) -> TesseraResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| catalog_error("create catalog directory", e))?;
    }

    let snapshot = CatalogSnapshot {
        version: CATALOG_VERSION,
        saved_at: Utc::now(),
        lamport: graph.lamport(),
        snapshots: graph.list(),
        chains: graph.all_chains(),
        tiles: store.all_metas(),
        usage: store.all_usage(),
        cold_index: tier.cold_entries(),
        next_pack_seq: tier.next_pack_seq(),
        hints: hint_log.all(),
        traces: replay.all(),
    };

    let bytes =
        serde_json::to_vec(&snapshot).map_err(|e| catalog_error("serialize catalog", e))?;

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| catalog_error("write catalog temp file", e))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| catalog_error("replace catalog file", e))?;

    debug!(
        tiles = snapshot.tiles.len(),
        snapshots = snapshot.snapshots.len(),
        cold = snapshot.cold_index.len(),
        "catalog saved"
    );
    Ok(())
}

/// Load a catalog and replay it into freshly constructed components.
///
/// The store's metadata table, the snapshot graph, the tiering engine's
/// cold index and residency, the hint log and the trace log all come back.
/// Warm residency is rebuilt by scanning the payload directory, so tiles
/// whose files vanished between runs simply fall back to their cold copies.
pub async fn load(
    path: &Path,
    store: &TileStore,
    graph: &SnapshotGraph,
    tier: &TieringEngine,
    hint_log: &HintLog,
    replay: &ReplayLog,
) -> TesseraResult<()> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| catalog_error("read catalog file", e))?;
    let snapshot: CatalogSnapshot =
        serde_json::from_slice(&bytes).map_err(|e| catalog_error("parse catalog", e))?;

    if snapshot.version != CATALOG_VERSION {
        return Err(TesseraError::Catalog {
            reason: format!(
                "incompatible catalog version {} (expected {})",
                snapshot.version, CATALOG_VERSION
            ),
        });
    }

    for meta in snapshot.tiles {
        store.register(meta);
    }
    for (tile_id, usage) in snapshot.usage {
        store.set_usage(tile_id, usage);
    }
    for node in snapshot.snapshots {
        graph.insert_node(node);
    }
    for (snapshot_id, coord, chain) in snapshot.chains {
        graph.record_chain(&snapshot_id, coord, chain);
    }
    graph.claim_lamport(snapshot.lamport);

    tier.restore_cold_index(snapshot.cold_index, snapshot.next_pack_seq);
    tier.rebuild_residency().await;

    for hint in snapshot.hints {
        hint_log.record(hint);
    }
    replay.restore(snapshot.traces);

    info!(
        tiles = store.len(),
        snapshots = graph.len(),
        traces = replay.len(),
        "catalog loaded"
    );
    Ok(())
}

pub async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TesseraConfig;
    use crate::metrics::Metrics;
    use crate::types::{payload_digest, CreateSnapshot, Dtype, Stream, DEFAULT_HALO};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct World {
        dir: TempDir,
        store: Arc<TileStore>,
        graph: Arc<SnapshotGraph>,
        tier: Arc<TieringEngine>,
        hint_log: Arc<HintLog>,
        replay: ReplayLog,
    }

    async fn world_in(dir: TempDir) -> World {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(
            TileStore::open(dir.path(), 3, Duration::from_millis(1), metrics.clone())
                .await
                .unwrap(),
        );
        let config = TesseraConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let tier = Arc::new(TieringEngine::new(
            config.clone(),
            store.clone(),
            metrics.clone(),
        ));
        let graph = Arc::new(SnapshotGraph::new());
        let hint_log = Arc::new(HintLog::new(config.hint_ttl));
        let replay = ReplayLog::new(tier.clone(), metrics);
        World {
            dir,
            store,
            graph,
            tier,
            hint_log,
            replay,
        }
    }

    async fn seed(world: &World) -> TileId {
        world
            .graph
            .create_snapshot(CreateSnapshot {
                snapshot_id: Some("s".to_string()),
                ..Default::default()
            })
            .unwrap();
        let payload = b"catalog payload";
        let meta = TileMeta {
            tile_id: TileId::compute(Stream::KvCache, "s", 0, 0, 0, payload),
            stream: Stream::KvCache,
            snapshot_id: "s".to_string(),
            level: 0,
            x: 0,
            y: 0,
            shape: (payload.len() as u32, 1, 1),
            dtype: Dtype::U8,
            halo: DEFAULT_HALO,
            parent_tile_id: None,
            checksum: payload_digest(payload),
            size_bytes: payload.len() as u64,
            tags: vec!["catalog".to_string()],
            created_at: Utc::now(),
        };
        world.store.write_payload(&meta, payload).await.unwrap();
        world.graph.record_full_tile("s", meta.coord(), meta.tile_id);
        world.tier.note_warm_insert(&meta).await;
        meta.tile_id
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let w = world_in(TempDir::new().unwrap()).await;
        let tile_id = seed(&w).await;
        w.hint_log.record(Hint {
            query_id: "q".to_string(),
            snapshot_id: "s".to_string(),
            stream: Stream::KvCache,
            level_range: (0, 0),
            bboxes: vec![],
            confidence: 0.5,
            issued_at: Utc::now(),
        });
        let trace = w
            .replay
            .record("s", 9, vec![("step".to_string(), vec![tile_id])])
            .await
            .unwrap();

        let path = w.dir.path().join(CATALOG_FILE);
        save(&path, &w.store, &w.graph, &w.tier, &w.hint_log, &w.replay)
            .await
            .unwrap();

        // Same directory, fresh components: payload files are still there
        let dir = w.dir;
        let fresh = world_in(dir).await;
        load(
            &fresh.dir.path().join(CATALOG_FILE),
            &fresh.store,
            &fresh.graph,
            &fresh.tier,
            &fresh.hint_log,
            &fresh.replay,
        )
        .await
        .unwrap();

        assert!(fresh.store.contains(&tile_id));
        assert!(fresh.graph.contains("s"));
        assert!(fresh.tier.is_warm(&tile_id));
        assert_eq!(fresh.hint_log.len(), 1);
        assert!(fresh.replay.get(&trace.trace_id).is_some());

        // Replay still verifies against the restored store
        fresh.replay.replay(&trace.trace_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_lamport_stays_monotonic_across_restart() {
        let w = world_in(TempDir::new().unwrap()).await;
        seed(&w).await;
        let before = w.graph.lamport();

        let path = w.dir.path().join(CATALOG_FILE);
        save(&path, &w.store, &w.graph, &w.tier, &w.hint_log, &w.replay)
            .await
            .unwrap();

        let fresh = world_in(w.dir).await;
        load(
            &fresh.dir.path().join(CATALOG_FILE),
            &fresh.store,
            &fresh.graph,
            &fresh.tier,
            &fresh.hint_log,
            &fresh.replay,
        )
        .await
        .unwrap();
        assert!(fresh.graph.lamport() >= before);
        assert!(fresh.graph.claim_lamport(0) > before);
    }

    #[tokio::test]
    async fn test_incompatible_version_is_refused() {
        let w = world_in(TempDir::new().unwrap()).await;
        seed(&w).await;
        let path = w.dir.path().join(CATALOG_FILE);
        save(&path, &w.store, &w.graph, &w.tier, &w.hint_log, &w.replay)
            .await
            .unwrap();

        let mut doc: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        doc["version"] = serde_json::json!(999);
        tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();

        let fresh = world_in(w.dir).await;
        let err = load(
            &fresh.dir.path().join(CATALOG_FILE),
            &fresh.store,
            &fresh.graph,
            &fresh.tier,
            &fresh.hint_log,
            &fresh.replay,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TesseraError::Catalog { .. }));
    }

    #[tokio::test]
    async fn test_missing_catalog_is_typed() {
        let w = world_in(TempDir::new().unwrap()).await;
        let err = load(
            &w.dir.path().join("nope.json"),
            &w.store,
            &w.graph,
            &w.tier,
            &w.hint_log,
            &w.replay,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TesseraError::Catalog { .. }));
        assert!(!exists(&w.dir.path().join("nope.json")).await);
    }
}
