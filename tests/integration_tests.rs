/// Integration tests for Tessera.
///
/// These tests verify end-to-end functionality of the tile store through
/// the public facade: snapshots, ingest, delta chains, merges, retrieval,
/// prefetch, replay and restart recovery.
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;
use tessera::types::payload_digest;
use tessera::{
    Acceptance, CreateSnapshot, Dtype, Hint, MergePolicy, NumericOp, PartialReason, QueryRequest,
    Stream, Tessera, TesseraError, TileCoord, TileRecord,
};
use tokio::time::sleep;

async fn open_db(dir: &TempDir) -> Tessera {
    Tessera::open_in(dir.path()).await.unwrap()
}

async fn snapshot(db: &Tessera, id: &str) -> String {
    db.create_snapshot(CreateSnapshot {
        snapshot_id: Some(id.to_string()),
        ..Default::default()
    })
    .await
    .unwrap()
    .snapshot_id
}

async fn child_snapshot(db: &Tessera, id: &str, parent: &str) -> String {
    db.create_snapshot(CreateSnapshot {
        snapshot_id: Some(id.to_string()),
        parents: vec![parent.to_string()],
        ..Default::default()
    })
    .await
    .unwrap()
    .snapshot_id
}

fn embedding_record(snapshot_id: &str, level: u8, x: i32, y: i32, values: &[f32]) -> TileRecord {
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    TileRecord::full(
        Stream::Embedding,
        snapshot_id,
        level,
        x,
        y,
        (1, 1, values.len() as u32),
        Dtype::F32,
        payload,
    )
}

fn text_record(snapshot_id: &str, stream: Stream, x: i32, text: &str) -> TileRecord {
    TileRecord::full(
        stream,
        snapshot_id,
        0,
        x,
        0,
        (1, 1, 1),
        Dtype::U8,
        text.as_bytes().to_vec(),
    )
}

fn f32s(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_lifecycle() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let root = db
        .create_snapshot(CreateSnapshot {
            snapshot_id: Some("root".to_string()),
            tags: [("run".to_string(), "42".to_string())].into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(root.snapshot_id, "root");
    assert!(root.parents.is_empty());
    assert_eq!(root.tags.get("run").map(String::as_str), Some("42"));

    let child = db
        .create_snapshot(CreateSnapshot {
            snapshot_id: Some("child".to_string()),
            parents: vec!["root".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(child.parents, vec!["root".to_string()]);
    assert!(
        child.provenance.lamport > root.provenance.lamport,
        "lamport must increase across snapshot creations"
    );

    // Duplicate ids are rejected, unknown parents are rejected
    let dup = db
        .create_snapshot(CreateSnapshot {
            snapshot_id: Some("root".to_string()),
            ..Default::default()
        })
        .await;
    assert!(matches!(dup, Err(TesseraError::SnapshotExists { .. })));

    let orphan = db
        .create_snapshot(CreateSnapshot {
            snapshot_id: Some("orphan".to_string()),
            parents: vec!["ghost".to_string()],
            ..Default::default()
        })
        .await;
    assert!(matches!(orphan, Err(TesseraError::SnapshotNotFound { .. })));

    let listed = db.list_snapshots();
    assert_eq!(listed.len(), 2);
    assert!(db.get_snapshot("child").is_ok());
    assert!(db.get_snapshot("ghost").is_err());
}

// ============================================================================
// Ingest and reads
// ============================================================================

#[tokio::test]
async fn test_ingest_and_read_back() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "s1").await;

    let record = embedding_record(&snap, 0, 3, -7, &[0.25, 0.5]);
    let expected_checksum = payload_digest(&record.payload);
    let metas = db.ingest(vec![record]).await.unwrap();
    assert_eq!(metas.len(), 1);

    let meta = &metas[0];
    assert_eq!(meta.snapshot_id, snap);
    assert_eq!((meta.level, meta.x, meta.y), (0, 3, -7));
    assert_eq!(meta.checksum, expected_checksum);
    assert!(meta.parent_tile_id.is_none());

    let coord = TileCoord {
        stream: Stream::Embedding,
        level: 0,
        x: 3,
        y: -7,
    };
    let tile = db.get_tile(&snap, &coord).await.unwrap();
    assert_eq!(tile.meta.tile_id, meta.tile_id);
    assert_eq!(f32s(&tile.payload), vec![0.25, 0.5]);

    let by_id = db.get_tile_by_id(&meta.tile_id).await.unwrap();
    assert_eq!(by_id.payload, tile.payload);

    // A coordinate never written is a clean miss
    let missing = TileCoord {
        stream: Stream::Embedding,
        level: 0,
        x: 99,
        y: 99,
    };
    let err = db.get_tile(&snap, &missing).await.unwrap_err();
    assert!(matches!(err, TesseraError::TileNotFound { .. }));
}

#[tokio::test]
async fn test_batch_ingest_is_ordered_and_counted() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "batch").await;

    let records: Vec<TileRecord> = (0..6)
        .map(|i| embedding_record(&snap, 0, i, 0, &[i as f32, 1.0]))
        .collect();
    let metas = db.ingest(records).await.unwrap();

    assert_eq!(metas.len(), 6);
    for (i, meta) in metas.iter().enumerate() {
        assert_eq!(meta.x, i as i32, "metas must come back in input order");
    }
    assert_eq!(db.status().tiles, 6);
}

#[tokio::test]
async fn test_full_reingest_replaces_chain() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "rewrite").await;

    let coord = TileCoord {
        stream: Stream::Embedding,
        level: 0,
        x: 0,
        y: 0,
    };
    let old = db
        .ingest(vec![embedding_record(&snap, 0, 0, 0, &[1.0])])
        .await
        .unwrap();
    let new = db
        .ingest(vec![embedding_record(&snap, 0, 0, 0, &[2.0])])
        .await
        .unwrap();
    assert_ne!(old[0].tile_id, new[0].tile_id);

    let tile = db.get_tile(&snap, &coord).await.unwrap();
    assert_eq!(f32s(&tile.payload), vec![2.0]);

    // The superseded head is no longer referenced and can be deleted;
    // the live head cannot.
    db.delete_tile(&old[0].tile_id).await.unwrap();
    let err = db.delete_tile(&new[0].tile_id).await.unwrap_err();
    assert!(matches!(err, TesseraError::Referenced { .. }));
    assert!(db.get_tile_by_id(&old[0].tile_id).await.is_err());
}

#[tokio::test]
async fn test_delta_chain_survives_restart() {
    let dir = TempDir::new().unwrap();
    let coord = TileCoord {
        stream: Stream::KvCache,
        level: 1,
        x: 2,
        y: 2,
    };

    let base_bytes: Vec<u8> = (0u8..64).collect();
    let mut step1 = base_bytes.clone();
    step1[10] = 0xaa;
    let mut step2 = step1.clone();
    step2[40] = 0xbb;

    {
        let db = open_db(&dir).await;
        let snap = snapshot(&db, "chain").await;

        let base = db
            .ingest(vec![TileRecord::full(
                Stream::KvCache,
                &snap,
                1,
                2,
                2,
                (8, 8, 1),
                Dtype::U8,
                base_bytes.clone(),
            )])
            .await
            .unwrap();

        let mut d1 = TileRecord::full(
            Stream::KvCache,
            &snap,
            1,
            2,
            2,
            (8, 8, 1),
            Dtype::U8,
            tessera::delta::encode(&base_bytes, &step1).unwrap(),
        );
        d1.delta_base = Some(base[0].tile_id);
        let d1_meta = db.ingest(vec![d1]).await.unwrap();
        assert_eq!(d1_meta[0].parent_tile_id, Some(base[0].tile_id));

        let mut d2 = TileRecord::full(
            Stream::KvCache,
            &snap,
            1,
            2,
            2,
            (8, 8, 1),
            Dtype::U8,
            tessera::delta::encode(&step1, &step2).unwrap(),
        );
        d2.delta_base = Some(d1_meta[0].tile_id);
        db.ingest(vec![d2]).await.unwrap();

        let tile = db.get_tile("chain", &coord).await.unwrap();
        assert_eq!(tile.payload, step2);

        db.shutdown().await.unwrap();
    }

    // Reopen: the chain and its materialization come back from the catalog
    let db = open_db(&dir).await;
    let tile = db.get_tile("chain", &coord).await.unwrap();
    assert_eq!(tile.payload, step2, "delta chain must survive a restart");
    db.shutdown().await.unwrap();
}

// ============================================================================
// Merges
// ============================================================================

#[tokio::test]
async fn test_merge_last_writer_wins() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let base = snapshot(&db, "base").await;
    db.ingest(vec![embedding_record(&base, 0, 0, 0, &[0.0])])
        .await
        .unwrap();

    let a = child_snapshot(&db, "side-a", &base).await;
    let b = child_snapshot(&db, "side-b", &base).await;
    db.ingest(vec![embedding_record(&a, 0, 0, 0, &[1.0])])
        .await
        .unwrap();
    db.ingest(vec![embedding_record(&b, 0, 0, 0, &[2.0])])
        .await
        .unwrap();

    let merged = db
        .merge("side-a", "side-b", Some(MergePolicy::LastWriterWins))
        .await
        .unwrap();
    assert_eq!(merged.parents, vec!["side-a".to_string(), "side-b".to_string()]);

    // side-b was created later, so its lamport stamp is higher and it wins
    let coord = TileCoord {
        stream: Stream::Embedding,
        level: 0,
        x: 0,
        y: 0,
    };
    let tile = db.get_tile(&merged.snapshot_id, &coord).await.unwrap();
    assert_eq!(f32s(&tile.payload), vec![2.0]);
    assert!(db.metrics().merges.load(Ordering::Relaxed) >= 1);
}

#[tokio::test]
async fn test_merge_combines_disjoint_writes() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let base = snapshot(&db, "base").await;
    let a = child_snapshot(&db, "a", &base).await;
    let b = child_snapshot(&db, "b", &base).await;
    db.ingest(vec![embedding_record(&a, 0, 0, 0, &[1.0])])
        .await
        .unwrap();
    db.ingest(vec![embedding_record(&b, 0, 5, 5, &[2.0])])
        .await
        .unwrap();

    let merged = db.merge("a", "b", None).await.unwrap();

    let at = |x, y| TileCoord {
        stream: Stream::Embedding,
        level: 0,
        x,
        y,
    };
    let left = db.get_tile(&merged.snapshot_id, &at(0, 0)).await.unwrap();
    let right = db.get_tile(&merged.snapshot_id, &at(5, 5)).await.unwrap();
    assert_eq!(f32s(&left.payload), vec![1.0]);
    assert_eq!(f32s(&right.payload), vec![2.0]);
}

#[tokio::test]
async fn test_merge_numeric_mean() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let base = snapshot(&db, "base").await;
    let a = child_snapshot(&db, "a", &base).await;
    let b = child_snapshot(&db, "b", &base).await;
    db.ingest(vec![embedding_record(&a, 0, 0, 0, &[1.0, 3.0])])
        .await
        .unwrap();
    db.ingest(vec![embedding_record(&b, 0, 0, 0, &[3.0, 5.0])])
        .await
        .unwrap();

    let merged = db
        .merge(
            "a",
            "b",
            Some(MergePolicy::NumericCombine {
                op: NumericOp::Mean,
            }),
        )
        .await
        .unwrap();

    let coord = TileCoord {
        stream: Stream::Embedding,
        level: 0,
        x: 0,
        y: 0,
    };
    let tile = db.get_tile(&merged.snapshot_id, &coord).await.unwrap();
    assert_eq!(f32s(&tile.payload), vec![2.0, 4.0]);
    // The combined tile is new content in the merged snapshot
    assert_eq!(tile.meta.snapshot_id, merged.snapshot_id);
}

#[tokio::test]
async fn test_merge_structural_disjoint_line_edits() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let base = snapshot(&db, "base").await;
    db.ingest(vec![text_record(
        &base,
        Stream::Skill,
        0,
        "alpha\nbeta\ngamma\n",
    )])
    .await
    .unwrap();

    let a = child_snapshot(&db, "a", &base).await;
    let b = child_snapshot(&db, "b", &base).await;
    db.ingest(vec![text_record(&a, Stream::Skill, 0, "ALPHA\nbeta\ngamma\n")])
        .await
        .unwrap();
    db.ingest(vec![text_record(&b, Stream::Skill, 0, "alpha\nbeta\nGAMMA\n")])
        .await
        .unwrap();

    let merged = db
        .merge("a", "b", Some(MergePolicy::Structural))
        .await
        .unwrap();

    let coord = TileCoord {
        stream: Stream::Skill,
        level: 0,
        x: 0,
        y: 0,
    };
    let tile = db.get_tile(&merged.snapshot_id, &coord).await.unwrap();
    assert_eq!(
        String::from_utf8(tile.payload).unwrap(),
        "ALPHA\nbeta\nGAMMA\n"
    );
}

#[tokio::test]
async fn test_merge_structural_overlapping_edits_conflict() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let base = snapshot(&db, "base").await;
    db.ingest(vec![text_record(&base, Stream::Skill, 0, "one\ntwo\n")])
        .await
        .unwrap();

    let a = child_snapshot(&db, "a", &base).await;
    let b = child_snapshot(&db, "b", &base).await;
    db.ingest(vec![text_record(&a, Stream::Skill, 0, "ONE-A\ntwo\n")])
        .await
        .unwrap();
    db.ingest(vec![text_record(&b, Stream::Skill, 0, "ONE-B\ntwo\n")])
        .await
        .unwrap();

    let err = db
        .merge("a", "b", Some(MergePolicy::Structural))
        .await
        .unwrap_err();
    match err {
        TesseraError::Conflict { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!((conflicts[0].x, conflicts[0].y), (0, 0));
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert!(db.metrics().merge_conflicts.load(Ordering::Relaxed) >= 1);
}

// ============================================================================
// Retrieval
// ============================================================================

#[tokio::test]
async fn test_query_coarse_to_fine_acceptance() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "q").await;

    // A coarse overview tile plus matching fine tiles under it
    let metas = db
        .ingest(vec![
            embedding_record(&snap, 2, 0, 0, &[1.0, 0.0]),
            embedding_record(&snap, 0, 0, 0, &[0.9, 0.1]),
            embedding_record(&snap, 0, 1, 0, &[0.8, 0.2]),
        ])
        .await
        .unwrap();

    let mut req = QueryRequest::new(vec![1.0, 0.0], &snap, 100);
    req.stream = Stream::Embedding;
    let plan = db.query(req).await.unwrap();

    assert_eq!(plan.acceptance, Acceptance::Accepted);
    assert!(!plan.tiles.is_empty());
    assert!(plan.confidence > 0.0);
    assert!(
        plan.tiles.iter().any(|t| t.level == 2),
        "plan should carry the coarse orientation tile"
    );
    assert!(
        plan.tiles.iter().any(|t| t.tile_id == metas[1].tile_id),
        "the closest fine tile should be refined into the plan"
    );
}

#[tokio::test]
async fn test_query_single_tile_exact_goal_accepted() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "one").await;

    let payload = [0.1_f32, 0.2, 0.3, 0.4];
    let metas = db
        .ingest(vec![embedding_record(&snap, 0, 0, 0, &payload)])
        .await
        .unwrap();

    let mut req = QueryRequest::new(payload.to_vec(), &snap, 150);
    req.stream = Stream::Embedding;
    let plan = db.query(req).await.unwrap();

    assert_eq!(plan.acceptance, Acceptance::Accepted);
    assert!(
        plan.tiles.iter().any(|t| t.tile_id == metas[0].tile_id),
        "the exact-match tile should be planned"
    );
    assert!(plan.confidence > 0.5);
}

#[tokio::test]
async fn test_query_zero_budget_serves_coarse_partial() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "q0").await;

    db.ingest(vec![
        embedding_record(&snap, 2, 0, 0, &[1.0, 0.0]),
        embedding_record(&snap, 0, 0, 0, &[1.0, 0.0]),
    ])
    .await
    .unwrap();

    let mut req = QueryRequest::new(vec![1.0, 0.0], &snap, 0);
    req.stream = Stream::Embedding;
    let plan = db.query(req).await.unwrap();

    assert!(plan.is_partial());
    assert_eq!(plan.partial_reason, Some(PartialReason::BudgetExpired));
    assert!(
        plan.tiles.iter().all(|t| t.level >= 2),
        "zero budget must never descend below the in-memory coarse level"
    );
}

#[tokio::test]
async fn test_query_respects_max_tiles() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "cap").await;

    let mut records = vec![embedding_record(&snap, 2, 0, 0, &[1.0, 0.0])];
    for x in 0..12 {
        records.push(embedding_record(&snap, 0, x, 0, &[1.0, 0.0]));
    }
    db.ingest(records).await.unwrap();

    let mut req = QueryRequest::new(vec![1.0, 0.0], &snap, 100);
    req.stream = Stream::Embedding;
    req.max_tiles = 3;
    let plan = db.query(req).await.unwrap();
    assert!(plan.tiles.len() <= 3);
}

#[tokio::test]
async fn test_query_lexical_text_goal() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "lex").await;

    db.ingest(vec![
        text_record(&snap, Stream::Log, 0, "login handler accepted session"),
        text_record(&snap, Stream::Log, 1, "cache flush completed"),
    ])
    .await
    .unwrap();

    let mut req = QueryRequest::new(Vec::new(), &snap, 100);
    req.stream = Stream::Log;
    req.text = Some("login handler".to_string());
    let plan = db.query(req).await.unwrap();

    assert!(!plan.tiles.is_empty(), "lexical goal should find the log tile");
    assert_eq!(plan.tiles[0].x, 0, "best match should be the login tile");
}

#[tokio::test]
async fn test_query_unknown_snapshot_and_empty_goal() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "v").await;

    let err = db
        .query(QueryRequest::new(vec![1.0], "ghost", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::SnapshotNotFound { .. }));

    let err = db.query(QueryRequest::new(Vec::new(), &snap, 10)).await;
    assert!(matches!(err, Err(TesseraError::InvalidInput { .. })));
}

#[tokio::test]
async fn test_plan_cache_serves_repeat_queries() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "pc").await;

    db.ingest(vec![embedding_record(&snap, 2, 0, 0, &[1.0, 0.0])])
        .await
        .unwrap();

    let mut req = QueryRequest::new(vec![1.0, 0.0], &snap, 100);
    req.stream = Stream::Embedding;
    let first = db.query(req.clone()).await.unwrap();
    let second = db.query(req).await.unwrap();

    assert_eq!(first.tile_ids(), second.tile_ids());
    assert!(
        db.metrics().plan_cache_hits.load(Ordering::Relaxed) >= 1,
        "identical request against an unchanged snapshot should hit the plan cache"
    );
}

// ============================================================================
// Prefetch
// ============================================================================

#[tokio::test]
async fn test_prefetch_hint_accepted_and_consumed() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "pf").await;

    db.ingest(vec![embedding_record(&snap, 0, 1, 1, &[0.5])])
        .await
        .unwrap();

    let accepted = db.prefetch(Hint {
        query_id: "hint-1".to_string(),
        snapshot_id: snap.clone(),
        stream: Stream::Embedding,
        level_range: (2, 0),
        bboxes: vec![tessera::BBox::new(0, 0, 4, 4)],
        confidence: 0.9,
        issued_at: tessera::Utc::now(),
    });
    assert!(accepted, "a fresh hint must be accepted");

    // The scheduler works in the background
    sleep(Duration::from_millis(200)).await;
    assert!(db.metrics().hints_received.load(Ordering::Relaxed) >= 1);
}

// ============================================================================
// Traces and replay
// ============================================================================

#[tokio::test]
async fn test_trace_replay_reads_identical_state() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "tr").await;

    db.ingest(vec![
        embedding_record(&snap, 2, 0, 0, &[1.0, 0.0]),
        embedding_record(&snap, 0, 0, 0, &[1.0, 0.0]),
    ])
    .await
    .unwrap();

    let mut req = QueryRequest::new(vec![1.0, 0.0], &snap, 100);
    req.stream = Stream::Embedding;
    let plan = db.query(req).await.unwrap();

    let trace = db
        .record_trace(&snap, 7, vec![("step-0".to_string(), plan.tile_ids())])
        .await
        .unwrap();
    assert!(!trace.fingerprint.is_empty());

    let report = db.replay_trace(&trace.trace_id).await.unwrap();
    assert_eq!(report.steps, 1);
    assert_eq!(report.tiles_read, plan.tiles.len());
    assert!(db.metrics().replays.load(Ordering::Relaxed) >= 1);
    assert_eq!(db.metrics().determinism_failures.load(Ordering::Relaxed), 0);

    let fetched = db.get_trace(&trace.trace_id).unwrap();
    assert_eq!(fetched.fingerprint, trace.fingerprint);
}

#[tokio::test]
async fn test_trace_replay_survives_restart() {
    let dir = TempDir::new().unwrap();
    let trace_id;
    {
        let db = open_db(&dir).await;
        let snap = snapshot(&db, "tr2").await;
        let metas = db
            .ingest(vec![embedding_record(&snap, 0, 0, 0, &[0.25])])
            .await
            .unwrap();
        let trace = db
            .record_trace(&snap, 1, vec![("s".to_string(), vec![metas[0].tile_id])])
            .await
            .unwrap();
        trace_id = trace.trace_id;
        db.shutdown().await.unwrap();
    }

    let db = open_db(&dir).await;
    let report = db.replay_trace(&trace_id).await.unwrap();
    assert_eq!(report.tiles_read, 1);
    db.shutdown().await.unwrap();
}

// ============================================================================
// Restart and durability
// ============================================================================

#[tokio::test]
async fn test_restart_restores_snapshots_tiles_and_index() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir).await;
        let snap = snapshot(&db, "keep").await;
        db.ingest(vec![
            embedding_record(&snap, 2, 0, 0, &[0.0, 1.0]),
            embedding_record(&snap, 0, 2, 2, &[0.0, 1.0]),
            text_record(&snap, Stream::Log, 0, "checkpoint written"),
        ])
        .await
        .unwrap();
        db.shutdown().await.unwrap();
    }

    let db = open_db(&dir).await;
    assert_eq!(db.status().tiles, 3);
    assert!(db.get_snapshot("keep").is_ok());

    // Vector search works again after the in-memory index rebuild
    let mut req = QueryRequest::new(vec![0.0, 1.0], "keep", 100);
    req.stream = Stream::Embedding;
    let plan = db.query(req).await.unwrap();
    assert!(!plan.tiles.is_empty());

    // So does lexical search over log tiles
    let mut req = QueryRequest::new(Vec::new(), "keep", 100);
    req.stream = Stream::Log;
    req.text = Some("checkpoint".to_string());
    let plan = db.query(req).await.unwrap();
    assert!(!plan.tiles.is_empty());

    db.shutdown().await.unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_ingest_into_distinct_snapshots() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let left = snapshot(&db, "left").await;
    let right = snapshot(&db, "right").await;

    let db_a = db.clone();
    let db_b = db.clone();
    let a = tokio::spawn(async move {
        for x in 0..20 {
            db_a.ingest(vec![embedding_record("left", 0, x, 0, &[x as f32])])
                .await
                .unwrap();
        }
    });
    let b = tokio::spawn(async move {
        for x in 0..20 {
            db_b.ingest(vec![embedding_record("right", 0, x, 0, &[x as f32])])
                .await
                .unwrap();
        }
    });
    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(db.status().tiles, 40);
    for (snap, x) in [(&left, 7), (&right, 13)] {
        let coord = TileCoord {
            stream: Stream::Embedding,
            level: 0,
            x,
            y: 0,
        };
        let tile = db.get_tile(snap, &coord).await.unwrap();
        assert_eq!(f32s(&tile.payload), vec![x as f32]);
    }
}

#[tokio::test]
async fn test_status_reflects_activity() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let snap = snapshot(&db, "st").await;

    db.ingest(vec![embedding_record(&snap, 2, 0, 0, &[1.0])])
        .await
        .unwrap();
    let mut req = QueryRequest::new(vec![1.0], &snap, 50);
    req.stream = Stream::Embedding;
    db.query(req).await.unwrap();

    let status = db.status();
    assert_eq!(status.tiles, 1);
    assert_eq!(status.snapshots, 1);
    assert!(status.tier.warm_tiles >= 1);
    assert!(status.index.coarse_entries >= 1);
    assert!(status.metrics.queries >= 1);
    assert!(!status.version.is_empty());
}
