//! Vector types and similarity math for the semantic index.

use crate::types::TileId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An embedding vector with a precomputed magnitude.
///
/// Vectors are stored as `f32` slices behind an `Arc` so index entries and
/// search results share one allocation.
#[derive(Debug, Clone)]
pub struct Vector {
    data: Arc<[f32]>,
    magnitude: f32,
}

impl Serialize for Vector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.data.iter())
    }
}

impl<'de> Deserialize<'de> for Vector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let data = Vec::<f32>::deserialize(deserializer)?;
        Ok(Vector::new(data))
    }
}

impl Vector {
    pub fn new(data: Vec<f32>) -> Self {
        let magnitude = data.iter().map(|&x| x * x).sum::<f32>().sqrt();
        Self {
            data: Arc::from(data.into_boxed_slice()),
            magnitude,
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn dimensions(&self) -> usize {
        self.data.len()
    }

    pub fn magnitude(&self) -> f32 {
        self.magnitude
    }

    pub fn is_compatible_with(&self, other: &Vector) -> bool {
        self.dimensions() == other.dimensions()
    }

    /// Cosine similarity in [-1, 1]. `None` when dimensions differ; zero
    /// vectors compare as 0.0 rather than NaN.
    pub fn cosine_similarity(&self, other: &Vector) -> Option<f32> {
        if !self.is_compatible_with(other) {
            return None;
        }
        if self.magnitude == 0.0 || other.magnitude == 0.0 {
            return Some(0.0);
        }
        let dot: f32 = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum();
        Some(dot / (self.magnitude * other.magnitude))
    }
}

impl PartialEq for Vector {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vector(dims={})", self.dimensions())
    }
}

/// One index match: a tile and how well it scored against the query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub tile_id: TileId,
    pub score: f32,
}

impl SearchHit {
    pub fn new(tile_id: TileId, score: f32) -> Self {
        Self { tile_id, score }
    }
}

/// Sort hits best-first with a stable id tie-break.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tile_id.cmp(&b.tile_id))
    });
}

/// Reinterpret a little-endian f32 payload as a vector. `None` when the
/// byte length is not a multiple of four or the payload is empty.
pub fn vector_from_f32_payload(payload: &[u8]) -> Option<Vector> {
    if payload.is_empty() || payload.len() % 4 != 0 {
        return None;
    }
    let data: Vec<f32> = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some(Vector::new(data))
}
