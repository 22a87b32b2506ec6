/// Content-addressed warm-tier tile store.
///
/// Payloads live as individual files under the data directory, one per tile
/// id, laid out by coordinate so a human can find them:
///
/// ```text
/// tiles/{stream}/{snapshot}/L{level}/x{x}/y{y}/{digest12}.tile
/// ```
///
/// Identity is content: the same coordinate and bytes always produce the
/// same id, so a repeated ingest is a no-op that leaves the existing file
/// untouched. Every read re-hashes the bytes and compares against the
/// recorded checksum and the id itself; a mismatch is a `Corruption` error,
/// which is never retried blindly. Transient I/O errors, by contrast, are
/// retried a bounded number of times with jittered exponential backoff.
///
/// The store only knows the warm tier. Cold placement, promotion, and
/// self-healing are the tiering engine's job; it calls back into
/// `write_payload_forced` when it restores a damaged warm copy.
use crate::error::{TesseraError, TesseraResult};
use crate::metrics::Metrics;
use crate::types::{payload_digest, TileId, TileMeta, TileUsage};
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Warm-tier payload store plus the in-memory tile metadata registry.
pub struct TileStore {
    root: PathBuf,
    tiles: DashMap<TileId, TileMeta>,
    usage: DashMap<TileId, TileUsage>,
    retry_attempts: u32,
    retry_base_delay: Duration,
    metrics: Arc<Metrics>,

    warm_writes: AtomicU64,
    dedup_skips: AtomicU64,
    verified_reads: AtomicU64,
}

impl TileStore {
    /// Open (or create) a store rooted at `data_dir`.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        retry_attempts: u32,
        retry_base_delay: Duration,
        metrics: Arc<Metrics>,
    ) -> TesseraResult<Self> {
        let root = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("tiles")).await?;
        Ok(Self {
            root,
            tiles: DashMap::new(),
            usage: DashMap::new(),
            retry_attempts,
            retry_base_delay,
            metrics,
            warm_writes: AtomicU64::new(0),
            dedup_skips: AtomicU64::new(0),
            verified_reads: AtomicU64::new(0),
        })
    }

    /// Where this tile's warm payload lives on disk.
    pub fn payload_path(&self, meta: &TileMeta) -> PathBuf {
        self.root
            .join("tiles")
            .join(meta.stream.as_str())
            .join(&meta.snapshot_id)
            .join(format!("L{}", meta.level))
            .join(format!("x{}", meta.x))
            .join(format!("y{}", meta.y))
            .join(format!("{}.tile", meta.tile_id.short()))
    }

    /// Register metadata without touching disk (catalog load path).
    pub fn register(&self, meta: TileMeta) {
        self.tiles.insert(meta.tile_id, meta);
    }

    pub fn meta(&self, tile_id: &TileId) -> Option<TileMeta> {
        self.tiles.get(tile_id).map(|m| m.clone())
    }

    pub fn contains(&self, tile_id: &TileId) -> bool {
        self.tiles.contains_key(tile_id)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Every registered tile's metadata. Used by the catalog and by index
    /// rebuilds; not on any hot path.
    pub fn all_metas(&self) -> Vec<TileMeta> {
        self.tiles.iter().map(|e| e.value().clone()).collect()
    }

    /// Write a payload if its tile id is new.
    ///
    /// Returns `false` when the tile already existed; the on-disk file is
    /// left untouched in that case (its mtime does not change). The payload
    /// must already match `meta.checksum`; callers validate before handing
    /// bytes over.
    pub async fn write_payload(&self, meta: &TileMeta, payload: &[u8]) -> TesseraResult<bool> {
        let path = self.payload_path(meta);
        if self.tiles.contains_key(&meta.tile_id) && path_exists(&path).await {
            self.dedup_skips.fetch_add(1, Ordering::Relaxed);
            debug!(tile_id = %meta.tile_id, "duplicate ingest, payload kept as-is");
            return Ok(false);
        }
        self.write_file_atomic(&path, payload).await?;
        self.tiles.insert(meta.tile_id, meta.clone());
        self.warm_writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Overwrite a warm payload unconditionally. Used by the tiering engine
    /// when promoting a cold copy or healing a corrupt warm file.
    pub async fn write_payload_forced(&self, meta: &TileMeta, payload: &[u8]) -> TesseraResult<()> {
        let path = self.payload_path(meta);
        self.write_file_atomic(&path, payload).await?;
        self.tiles.insert(meta.tile_id, meta.clone());
        self.warm_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read a warm payload, verifying content on the way out.
    ///
    /// Returns `Ok(None)` when no warm file exists (the tile may be cold);
    /// `Corruption` when bytes are present but fail verification.
    pub async fn read_warm(&self, meta: &TileMeta) -> TesseraResult<Option<Vec<u8>>> {
        let path = self.payload_path(meta);
        let bytes = match self.read_file_retrying(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        self.verify(meta, &bytes)?;
        self.verified_reads.fetch_add(1, Ordering::Relaxed);
        Ok(Some(bytes))
    }

    /// Whether a warm file is present for this tile.
    pub async fn has_warm_payload(&self, meta: &TileMeta) -> bool {
        path_exists(&self.payload_path(meta)).await
    }

    /// Remove the warm payload file, keeping metadata. Eviction path.
    pub async fn remove_warm_payload(&self, meta: &TileMeta) -> TesseraResult<()> {
        match tokio::fs::remove_file(self.payload_path(meta)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Drop a tile entirely: metadata, usage, and any warm file.
    ///
    /// Reference checking happens above this layer; by the time this runs
    /// the tile must be unreachable from every snapshot.
    pub async fn unregister(&self, tile_id: &TileId) -> TesseraResult<()> {
        if let Some((_, meta)) = self.tiles.remove(tile_id) {
            self.usage.remove(tile_id);
            self.remove_warm_payload(&meta).await?;
        }
        Ok(())
    }

    /// Check payload bytes against the recorded checksum and the content
    /// address itself.
    pub fn verify(&self, meta: &TileMeta, payload: &[u8]) -> TesseraResult<()> {
        let actual = payload_digest(payload);
        if actual != meta.checksum {
            return Err(TesseraError::Corruption {
                tile_id: meta.tile_id,
                expected: meta.checksum.clone(),
                actual,
            });
        }
        let recomputed = TileId::compute(
            meta.stream,
            &meta.snapshot_id,
            meta.level,
            meta.x,
            meta.y,
            payload,
        );
        if recomputed != meta.tile_id {
            return Err(TesseraError::Corruption {
                tile_id: meta.tile_id,
                expected: meta.tile_id.to_hex(),
                actual: recomputed.to_hex(),
            });
        }
        Ok(())
    }

    /// Bump access telemetry for a tile.
    pub fn record_access(&self, tile_id: &TileId) {
        let now = Utc::now();
        self.usage
            .entry(*tile_id)
            .and_modify(|u| {
                u.access_count += 1;
                u.last_access = now;
            })
            .or_insert_with(|| TileUsage::first(now));
    }

    pub fn usage_of(&self, tile_id: &TileId) -> Option<TileUsage> {
        self.usage.get(tile_id).map(|u| u.clone())
    }

    /// Restore usage telemetry from the catalog.
    pub fn set_usage(&self, tile_id: TileId, usage: TileUsage) {
        self.usage.insert(tile_id, usage);
    }

    pub fn all_usage(&self) -> Vec<(TileId, TileUsage)> {
        self.usage
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            tiles: self.tiles.len(),
            warm_writes: self.warm_writes.load(Ordering::Relaxed),
            dedup_skips: self.dedup_skips.load(Ordering::Relaxed),
            verified_reads: self.verified_reads.load(Ordering::Relaxed),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Write bytes to a temp file then rename into place, with bounded
    /// retries around each step.
    async fn write_file_atomic(&self, path: &Path, payload: &[u8]) -> TesseraResult<()> {
        if let Some(parent) = path.parent() {
            self.retrying("create_dir", || tokio::fs::create_dir_all(parent))
                .await?;
        }
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        self.retrying("write", || tokio::fs::write(&tmp, payload))
            .await?;
        if let Err(err) = self.retrying("rename", || tokio::fs::rename(&tmp, path)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn read_file_retrying(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        self.retrying("read", || tokio::fs::read(path)).await
    }

    /// Run an I/O operation with bounded retries and jittered backoff.
    ///
    /// `NotFound` is definitive and returned immediately; everything else
    /// gets `retry_attempts` tries total.
    async fn retrying<F, Fut, T>(&self, op: &str, mut f: F) -> std::io::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::io::Result<T>>,
    {
        let attempts = self.retry_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == ErrorKind::NotFound => return Err(err),
                Err(err) => {
                    warn!(op, attempt, error = %err, "transient storage error");
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        let base = self.retry_base_delay.as_millis() as u64;
                        let backoff = base.saturating_mul(1 << attempt);
                        let jitter = rand::thread_rng().gen_range(0..=base.max(1));
                        tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ErrorKind::Other.into()))
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Store-level statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub tiles: usize,
    pub warm_writes: u64,
    pub dedup_skips: u64,
    pub verified_reads: u64,
}
