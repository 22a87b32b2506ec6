//! Trace recording and deterministic replay.
//!
//! A trace pins down one execution: the snapshot it ran against, the seed,
//! and for every step the input text, the tiles it read and a digest of the
//! content it consumed. Replay re-reads the same tiles and recomputes each
//! digest; the first divergence is a typed failure naming the step.
//!
//! The environment fingerprint is checked before any tile is touched.
//! Replaying a trace from a different build or platform is refused outright
//! instead of surfacing as a spurious determinism failure.

use crate::error::{TesseraError, TesseraResult};
use crate::metrics::Metrics;
use crate::tier::TieringEngine;
use crate::types::{TileId, Trace, TraceStep};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// What must match between the recording and replaying processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvFingerprint {
    pub os: String,
    pub arch: String,
    pub pkg_version: String,
}

impl EnvFingerprint {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pkg_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// SHA-256 hex over the fingerprint fields.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.os.as_bytes());
        hasher.update([0x00]);
        hasher.update(self.arch.as_bytes());
        hasher.update([0x00]);
        hasher.update(self.pkg_version.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Digest of one step's effective inputs: seed, step position, input text
/// and the materialized payload of every tile read, in recorded order.
pub fn step_digest(seed: u64, step_index: usize, input: &str, payloads: &[Vec<u8>]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(&(step_index as u64).to_le_bytes());
    hasher.update(input.as_bytes());
    for payload in payloads {
        hasher.update(&(payload.len() as u64).to_le_bytes());
        hasher.update(payload);
    }
    hasher.finalize().to_hex().to_string()
}

/// Summary of one successful replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub trace_id: String,
    pub snapshot_id: String,
    pub steps: usize,
    pub tiles_read: usize,
}

/// In-memory trace log. Traces persist through the catalog; replay reads
/// tiles through the tiering engine and never writes.
pub struct ReplayLog {
    tier: Arc<TieringEngine>,
    traces: DashMap<String, Trace>,
    metrics: Arc<Metrics>,
}

impl ReplayLog {
    pub fn new(tier: Arc<TieringEngine>, metrics: Arc<Metrics>) -> Self {
        Self {
            tier,
            traces: DashMap::new(),
            metrics,
        }
    }

    /// Reload traces saved by a previous process.
    pub fn restore(&self, traces: Vec<Trace>) {
        for trace in traces {
            self.traces.insert(trace.trace_id.clone(), trace);
        }
    }

    pub fn get(&self, trace_id: &str) -> Option<Trace> {
        self.traces.get(trace_id).map(|t| t.value().clone())
    }

    /// All recorded traces, for catalog persistence.
    pub fn all(&self) -> Vec<Trace> {
        self.traces.iter().map(|t| t.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Record a trace over the store's current contents. Each step's digest
    /// covers the fully materialized tile content, so delta tiles hash the
    /// same regardless of how their chains are laid out on disk.
    pub async fn record(
        &self,
        snapshot_id: &str,
        seed: u64,
        steps: Vec<(String, Vec<TileId>)>,
    ) -> TesseraResult<Trace> {
        let mut recorded = Vec::with_capacity(steps.len());
        for (index, (input, tile_ids)) in steps.into_iter().enumerate() {
            let mut payloads = Vec::with_capacity(tile_ids.len());
            for tile_id in &tile_ids {
                payloads.push(self.tier.materialize(tile_id).await?);
            }
            let output = step_digest(seed, index, &input, &payloads);
            recorded.push(TraceStep {
                input,
                tile_ids,
                output,
            });
        }

        let trace = Trace {
            trace_id: format!("trc-{}", uuid::Uuid::new_v4().simple()),
            snapshot_id: snapshot_id.to_string(),
            seed,
            fingerprint: EnvFingerprint::current().digest(),
            steps: recorded,
            created_at: Utc::now(),
        };
        info!(
            trace_id = %trace.trace_id,
            snapshot_id,
            steps = trace.steps.len(),
            "trace recorded"
        );
        self.traces.insert(trace.trace_id.clone(), trace.clone());
        Ok(trace)
    }

    /// Re-execute a trace's reads and verify every step digest.
    pub async fn replay(&self, trace_id: &str) -> TesseraResult<ReplayReport> {
        let trace = self.get(trace_id).ok_or_else(|| TesseraError::TraceNotFound {
            trace_id: trace_id.to_string(),
        })?;

        let current = EnvFingerprint::current().digest();
        if current != trace.fingerprint {
            return Err(TesseraError::EnvironmentMismatch {
                recorded: trace.fingerprint,
                current,
            });
        }

        let mut tiles_read = 0usize;
        for (index, step) in trace.steps.iter().enumerate() {
            let mut payloads = Vec::with_capacity(step.tile_ids.len());
            for tile_id in &step.tile_ids {
                payloads.push(self.tier.materialize(tile_id).await?);
                tiles_read += 1;
            }
            let output = step_digest(trace.seed, index, &step.input, &payloads);
            if output != step.output {
                debug!(
                    trace_id,
                    step = index,
                    recorded = %step.output,
                    recomputed = %output,
                    "replay diverged"
                );
                self.metrics
                    .determinism_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(TesseraError::Determinism { step: index });
            }
        }

        self.metrics.replays.fetch_add(1, Ordering::Relaxed);
        Ok(ReplayReport {
            trace_id: trace.trace_id.clone(),
            snapshot_id: trace.snapshot_id.clone(),
            steps: trace.steps.len(),
            tiles_read,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TesseraConfig;
    use crate::store::TileStore;
    use crate::types::{payload_digest, Dtype, Stream, TileMeta, DEFAULT_HALO};
    use std::time::Duration;
    use tempfile::TempDir;

    struct World {
        _dir: TempDir,
        store: Arc<TileStore>,
        tier: Arc<TieringEngine>,
        log: ReplayLog,
    }

    async fn world() -> World {
        let dir = TempDir::new().unwrap();
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
            config,
            store.clone(),
            metrics.clone(),
        ));
        let log = ReplayLog::new(tier.clone(), metrics);
        World {
            _dir: dir,
            store,
            tier,
            log,
        }
    }

    async fn seed_tile(world: &World, x: i32, payload: &[u8]) -> TileId {
        let meta = TileMeta {
            tile_id: TileId::compute(Stream::KvCache, "s", 0, x, 0, payload),
            stream: Stream::KvCache,
            snapshot_id: "s".to_string(),
            level: 0,
            x,
            y: 0,
            shape: (payload.len() as u32, 1, 1),
            dtype: Dtype::U8,
            halo: DEFAULT_HALO,
            parent_tile_id: None,
            checksum: payload_digest(payload),
            size_bytes: payload.len() as u64,
            tags: vec![],
            created_at: Utc::now(),
        };
        world.store.write_payload(&meta, payload).await.unwrap();
        world.tier.note_warm_insert(&meta).await;
        meta.tile_id
    }

    #[test]
    fn test_fingerprint_is_stable_and_field_sensitive() {
        let a = EnvFingerprint::current();
        let b = EnvFingerprint::current();
        assert_eq!(a.digest(), b.digest());

        let mut c = EnvFingerprint::current();
        c.pkg_version = "0.0.0-other".to_string();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_step_digest_orders_and_separates_payloads() {
        let p1 = vec![1u8, 2, 3];
        let p2 = vec![4u8, 5];
        let forward = step_digest(7, 0, "in", &[p1.clone(), p2.clone()]);
        let swapped = step_digest(7, 0, "in", &[p2, p1]);
        assert_ne!(forward, swapped);
        // Length framing keeps [1,2]+[3] distinct from [1]+[2,3]
        let a = step_digest(7, 0, "in", &[vec![1, 2], vec![3]]);
        let b = step_digest(7, 0, "in", &[vec![1], vec![2, 3]]);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_record_then_replay_succeeds() {
        let w = world().await;
        let t1 = seed_tile(&w, 0, b"alpha").await;
        let t2 = seed_tile(&w, 1, b"beta").await;

        let trace = w
            .log
            .record(
                "s",
                42,
                vec![
                    ("first".to_string(), vec![t1]),
                    ("second".to_string(), vec![t1, t2]),
                ],
            )
            .await
            .unwrap();

        let report = w.log.replay(&trace.trace_id).await.unwrap();
        assert_eq!(report.steps, 2);
        assert_eq!(report.tiles_read, 3);
        assert_eq!(w.store.metrics().replays.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_tampered_step_fails_at_that_index() {
        let w = world().await;
        let t1 = seed_tile(&w, 0, b"alpha").await;
        let trace = w
            .log
            .record(
                "s",
                42,
                vec![
                    ("first".to_string(), vec![t1]),
                    ("second".to_string(), vec![t1]),
                ],
            )
            .await
            .unwrap();

        let mut tampered = trace.clone();
        tampered.steps[1].output = "not-the-real-digest".to_string();
        w.log.restore(vec![tampered]);

        let err = w.log.replay(&trace.trace_id).await.unwrap_err();
        assert!(matches!(err, TesseraError::Determinism { step: 1 }));
        assert_eq!(
            w.store
                .metrics()
                .determinism_failures
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_foreign_fingerprint_is_refused_before_reads() {
        let w = world().await;
        let t1 = seed_tile(&w, 0, b"alpha").await;
        let trace = w
            .log
            .record("s", 1, vec![("only".to_string(), vec![t1])])
            .await
            .unwrap();

        let mut foreign = trace.clone();
        foreign.fingerprint = "recorded-elsewhere".to_string();
        w.log.restore(vec![foreign]);

        let reads_before = w.store.metrics().tile_hits.load(Ordering::Relaxed);
        let err = w.log.replay(&trace.trace_id).await.unwrap_err();
        assert!(matches!(err, TesseraError::EnvironmentMismatch { .. }));
        assert_eq!(
            w.store.metrics().tile_hits.load(Ordering::Relaxed),
            reads_before
        );
    }

    #[tokio::test]
    async fn test_unknown_trace_is_typed() {
        let w = world().await;
        let err = w.log.replay("trc-missing").await.unwrap_err();
        assert!(matches!(err, TesseraError::TraceNotFound { .. }));
    }
}
