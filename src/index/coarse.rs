//! In-memory ANN index for coarse summary tiles.
//!
//! Coarse levels are small (each level up shrinks the grid), so the whole
//! tier fits in RAM and a flat exact scan is fast enough. The trait leaves
//! room for an approximate backend if coarse tiers ever outgrow that.

use super::types::{sort_hits, SearchHit, Vector};
use crate::types::TileId;
use dashmap::DashMap;
use std::collections::HashSet;

/// An approximate nearest neighbor index over tile embeddings.
pub trait AnnIndex: Send + Sync {
    fn add(&self, tile_id: TileId, vector: Vector);

    fn remove(&self, tile_id: &TileId);

    /// Nearest neighbors to `query`, best-first. When `allowed` is given,
    /// only those tiles are considered.
    fn search(&self, query: &Vector, top_k: usize, allowed: Option<&HashSet<TileId>>)
        -> Vec<SearchHit>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

/// A flat (brute-force) index: exact k-NN by scanning every entry.
#[derive(Debug, Default)]
pub struct FlatIndex {
    vectors: DashMap<TileId, Vector>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self {
            vectors: DashMap::new(),
        }
    }

    pub fn get(&self, tile_id: &TileId) -> Option<Vector> {
        self.vectors.get(tile_id).map(|v| v.clone())
    }
}

impl AnnIndex for FlatIndex {
    fn add(&self, tile_id: TileId, vector: Vector) {
        self.vectors.insert(tile_id, vector);
    }

    fn remove(&self, tile_id: &TileId) {
        self.vectors.remove(tile_id);
    }

    fn search(
        &self,
        query: &Vector,
        top_k: usize,
        allowed: Option<&HashSet<TileId>>,
    ) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = Vec::new();
        for entry in self.vectors.iter() {
            if let Some(allowed) = allowed {
                if !allowed.contains(entry.key()) {
                    continue;
                }
            }
            if let Some(score) = query.cosine_similarity(entry.value()) {
                hits.push(SearchHit::new(*entry.key(), score));
            }
        }
        sort_hits(&mut hits);
        hits.truncate(top_k);
        hits
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn clear(&self) {
        self.vectors.clear();
    }
}
