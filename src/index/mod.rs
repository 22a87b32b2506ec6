//! Semantic index over tiles: vector search plus lexical search.
//!
//! The index has two vector tiers split by pyramid level:
//! - coarse summary tiles live in an in-memory flat index, always hot
//! - full-resolution tiles go to an on-disk append-only fine index with a
//!   recent-write buffer, so freshness survives restarts
//!
//! plus a token inverted index over tags and log text. All of it is
//! derived data: the store and graph never depend on it, a flush failure
//! only degrades search until a later flush or rebuild succeeds, and
//! `by_id` reads bypass it entirely.
//!
//! # Example
//!
//! ```ignore
//! use tessera::index::{SemanticIndex, Vector};
//!
//! let index = SemanticIndex::open("/data/index", 2, 50).await?;
//! index.upsert(&meta, Some(Vector::new(vec![0.1, 0.2])), None).await;
//! let hits = index.search_fine(&goal, 16, None)?;
//! ```

mod coarse;
mod fine;
mod lexical;
mod types;

pub use coarse::{AnnIndex, FlatIndex};
pub use fine::FineIndex;
pub use lexical::LexicalIndex;
pub use types::{sort_hits, vector_from_f32_payload, SearchHit, Vector};

use crate::error::{TesseraError, TesseraResult};
use crate::types::{TileId, TileMeta};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Facade routing upserts and searches across the three index tiers.
pub struct SemanticIndex {
    coarse: FlatIndex,
    fine: FineIndex,
    lexical: LexicalIndex,
    coarse_cutoff: u8,
    rerank_top_n: usize,
    available: AtomicBool,
    last_error: Mutex<String>,
}

impl SemanticIndex {
    pub async fn open(
        index_dir: impl AsRef<Path>,
        coarse_cutoff: u8,
        rerank_top_n: usize,
    ) -> TesseraResult<Self> {
        let fine = FineIndex::open(index_dir).await?;
        Ok(Self {
            coarse: FlatIndex::new(),
            fine,
            lexical: LexicalIndex::new(),
            coarse_cutoff,
            rerank_top_n,
            available: AtomicBool::new(true),
            last_error: Mutex::new(String::new()),
        })
    }

    /// Route one tile into the tiers it belongs to. Lexical content is the
    /// tile's tags plus any log text.
    pub async fn upsert(&self, meta: &TileMeta, vector: Option<Vector>, text: Option<&str>) {
        if let Some(vector) = vector {
            if meta.level >= self.coarse_cutoff {
                self.coarse.add(meta.tile_id, vector);
            } else {
                self.fine
                    .upsert(meta.tile_id, vector, meta.tags.clone())
                    .await;
            }
        }

        let mut lexical_text = meta.tags.join(" ");
        if let Some(text) = text {
            if !lexical_text.is_empty() {
                lexical_text.push(' ');
            }
            lexical_text.push_str(text);
        }
        if !lexical_text.is_empty() {
            self.lexical.add(meta.tile_id, &lexical_text);
        }
    }

    pub async fn remove(&self, tile_id: &TileId) {
        self.coarse.remove(tile_id);
        self.fine.remove(tile_id).await;
        self.lexical.remove(tile_id);
    }

    /// Restore the RAM-resident tiers for one tile after a restart.
    ///
    /// Fine entries come back from their own log on `open`; coarse vectors
    /// and lexical postings live only in memory and are re-derived here.
    /// Nothing is appended to the fine log.
    pub fn reindex_tile(&self, meta: &TileMeta, vector: Option<Vector>, text: Option<&str>) {
        if let Some(vector) = vector {
            if meta.level >= self.coarse_cutoff {
                self.coarse.add(meta.tile_id, vector);
            }
        }
        let mut lexical_text = meta.tags.join(" ");
        if let Some(text) = text {
            if !lexical_text.is_empty() {
                lexical_text.push(' ');
            }
            lexical_text.push_str(text);
        }
        if !lexical_text.is_empty() {
            self.lexical.add(meta.tile_id, &lexical_text);
        }
    }

    /// Coarse tier search. RAM-resident, works even while the fine tier is
    /// degraded.
    pub fn search_coarse(
        &self,
        goal: &Vector,
        top_k: usize,
        allowed: Option<&HashSet<TileId>>,
    ) -> Vec<SearchHit> {
        self.coarse.search(goal, top_k, allowed)
    }

    pub fn search_fine(
        &self,
        goal: &Vector,
        top_k: usize,
        allowed: Option<&HashSet<TileId>>,
    ) -> TesseraResult<Vec<SearchHit>> {
        self.ensure_available()?;
        Ok(self.fine.search(goal, top_k, allowed))
    }

    pub fn search_lexical(
        &self,
        text: &str,
        top_k: usize,
        allowed: Option<&HashSet<TileId>>,
    ) -> Vec<SearchHit> {
        self.lexical.search(text, top_k, allowed)
    }

    /// Exact rescoring of the leading candidates: cosine against the stored
    /// vector, blended with lexical affinity when query text was given.
    pub fn rerank(
        &self,
        goal: Option<&Vector>,
        text: Option<&str>,
        mut hits: Vec<SearchHit>,
    ) -> Vec<SearchHit> {
        sort_hits(&mut hits);
        hits.truncate(self.rerank_top_n);
        let query_counts = text.map(|t| self.lexical.tokenize(t));

        for hit in hits.iter_mut() {
            let vec_score = goal
                .and_then(|g| self.vector_of(&hit.tile_id)?.cosine_similarity(g))
                .unwrap_or(hit.score);
            let lex_score = query_counts
                .as_ref()
                .map(|q| self.lexical.score_tile(&hit.tile_id, q))
                .unwrap_or(0.0);
            hit.score = if query_counts.is_some() {
                0.8 * vec_score + 0.2 * lex_score
            } else {
                vec_score
            };
        }
        sort_hits(&mut hits);
        hits
    }

    pub fn vector_of(&self, tile_id: &TileId) -> Option<Vector> {
        self.fine.get(tile_id).or_else(|| self.coarse.get(tile_id))
    }

    /// Flush buffered fine records. Failure marks the index degraded; the
    /// buffered records stay queued and a later success restores service.
    pub async fn flush(&self) -> TesseraResult<usize> {
        match self.fine.flush().await {
            Ok(n) => {
                self.available.store(true, Ordering::SeqCst);
                Ok(n)
            }
            Err(err) => {
                self.available.store(false, Ordering::SeqCst);
                if let Ok(mut guard) = self.last_error.lock() {
                    *guard = err.to_string();
                }
                warn!(error = %err, "fine index flush failed, search degraded");
                Err(err)
            }
        }
    }

    /// Rewrite the fine log from live entries. A successful rebuild also
    /// clears the degraded flag.
    pub async fn rebuild(&self) -> TesseraResult<usize> {
        let n = self.fine.rebuild().await?;
        self.available.store(true, Ordering::SeqCst);
        Ok(n)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Force the degraded state, e.g. when an operator takes the fine log
    /// offline for repair. `flush` or `rebuild` restore service.
    pub fn mark_degraded(&self, reason: impl Into<String>) {
        self.available.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = reason.into();
        }
    }

    fn ensure_available(&self) -> TesseraResult<()> {
        if self.is_available() {
            return Ok(());
        }
        let reason = self
            .last_error
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default();
        Err(TesseraError::IndexUnavailable {
            reason: if reason.is_empty() {
                "fine index degraded".to_string()
            } else {
                reason
            },
        })
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            coarse_entries: self.coarse.len(),
            fine_entries: self.fine.len(),
            lexical_docs: self.lexical.len(),
            available: self.is_available(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub coarse_entries: usize,
    pub fine_entries: usize,
    pub lexical_docs: usize,
    pub available: bool,
}
