//! On-disk fine index: an append-only record log plus a recent buffer.
//!
//! Full-resolution tiles are too many to keep purely in RAM across
//! restarts, so every upsert is buffered and appended to `fine.idx` as a
//! length-prefixed bincode record on the next flush. Startup replays the
//! log; later records win and an empty-vector record is a tombstone. The
//! log is disposable: `rebuild` rewrites it from live entries only, and
//! losing it entirely never loses tiles, only search freshness until the
//! next rebuild.

use super::types::{sort_hits, SearchHit, Vector};
use crate::error::{TesseraError, TesseraResult};
use crate::types::TileId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const FINE_INDEX_FILE: &str = "fine.idx";

/// One log record. `data` empty means the tile was removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FineRecord {
    tile_id: TileId,
    data: Vec<f32>,
    tags: Vec<String>,
}

#[derive(Debug, Clone)]
struct FineEntry {
    vector: Vector,
    tags: Vec<String>,
}

/// Fine-tier vector index backed by an append-only log.
pub struct FineIndex {
    path: PathBuf,
    entries: DashMap<TileId, FineEntry>,
    pending: tokio::sync::Mutex<Vec<FineRecord>>,
}

impl FineIndex {
    /// Open the index, replaying any existing log. A truncated tail (torn
    /// write from a crash) is dropped with a warning rather than refused.
    pub async fn open(index_dir: impl AsRef<Path>) -> TesseraResult<Self> {
        let dir = index_dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(FINE_INDEX_FILE);
        let entries = DashMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut cursor = 0usize;
                let mut replayed = 0usize;
                while cursor + 4 <= bytes.len() {
                    let len = u32::from_le_bytes([
                        bytes[cursor],
                        bytes[cursor + 1],
                        bytes[cursor + 2],
                        bytes[cursor + 3],
                    ]) as usize;
                    let start = cursor + 4;
                    let Some(end) = start.checked_add(len).filter(|e| *e <= bytes.len()) else {
                        warn!(offset = cursor, "fine index log ends mid-record, dropping tail");
                        break;
                    };
                    match bincode::deserialize::<FineRecord>(&bytes[start..end]) {
                        Ok(record) => {
                            if record.data.is_empty() {
                                entries.remove(&record.tile_id);
                            } else {
                                entries.insert(
                                    record.tile_id,
                                    FineEntry {
                                        vector: Vector::new(record.data),
                                        tags: record.tags,
                                    },
                                );
                            }
                            replayed += 1;
                        }
                        Err(err) => {
                            warn!(offset = cursor, error = %err, "unreadable fine index record, dropping tail");
                            break;
                        }
                    }
                    cursor = end;
                }
                debug!(records = replayed, live = entries.len(), "fine index replayed");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(Self {
            path,
            entries,
            pending: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub async fn upsert(&self, tile_id: TileId, vector: Vector, tags: Vec<String>) {
        let record = FineRecord {
            tile_id,
            data: vector.as_slice().to_vec(),
            tags: tags.clone(),
        };
        self.entries.insert(tile_id, FineEntry { vector, tags });
        self.pending.lock().await.push(record);
    }

    pub async fn remove(&self, tile_id: &TileId) {
        if self.entries.remove(tile_id).is_none() {
            return;
        }
        self.pending.lock().await.push(FineRecord {
            tile_id: *tile_id,
            data: Vec::new(),
            tags: Vec::new(),
        });
    }

    pub fn get(&self, tile_id: &TileId) -> Option<Vector> {
        self.entries.get(tile_id).map(|e| e.vector.clone())
    }

    pub fn tags_of(&self, tile_id: &TileId) -> Option<Vec<String>> {
        self.entries.get(tile_id).map(|e| e.tags.clone())
    }

    pub fn contains(&self, tile_id: &TileId) -> bool {
        self.entries.contains_key(tile_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact scan over live entries, buffered writes included.
    pub fn search(
        &self,
        query: &Vector,
        top_k: usize,
        allowed: Option<&HashSet<TileId>>,
    ) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = Vec::new();
        for entry in self.entries.iter() {
            if let Some(allowed) = allowed {
                if !allowed.contains(entry.key()) {
                    continue;
                }
            }
            if let Some(score) = query.cosine_similarity(&entry.value().vector) {
                hits.push(SearchHit::new(*entry.key(), score));
            }
        }
        sort_hits(&mut hits);
        hits.truncate(top_k);
        hits
    }

    /// Append buffered records to the log. Returns how many were written.
    pub async fn flush(&self) -> TesseraResult<usize> {
        let drained: Vec<FineRecord> = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for record in &drained {
            let bytes = bincode::serialize(record)?;
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&bytes);
        }

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(&buf).await?;
            file.sync_data().await?;
            Ok::<(), TesseraError>(())
        }
        .await;

        if let Err(err) = result {
            // Put the records back so a later flush can retry them
            let mut pending = self.pending.lock().await;
            let mut restored = drained;
            restored.extend(std::mem::take(&mut *pending));
            *pending = restored;
            return Err(err);
        }
        debug!(records = drained.len(), "fine index flushed");
        Ok(drained.len())
    }

    /// Rewrite the log from live entries only, dropping superseded records
    /// and tombstones. Atomic via tmp + rename.
    pub async fn rebuild(&self) -> TesseraResult<usize> {
        // Anything still buffered is already in `entries`; the rewrite
        // subsumes it.
        self.pending.lock().await.clear();

        let mut buf = Vec::new();
        let mut count = 0usize;
        for entry in self.entries.iter() {
            let record = FineRecord {
                tile_id: *entry.key(),
                data: entry.value().vector.as_slice().to_vec(),
                tags: entry.value().tags.clone(),
            };
            let bytes = bincode::serialize(&record)?;
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&bytes);
            count += 1;
        }

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &buf).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!(records = count, "fine index rebuilt");
        Ok(count)
    }
}
