//! Lexical search over tile tags and log text.
//!
//! Tiles whose meaning lives in words rather than embeddings (tags on any
//! stream, the text of log tiles) get a token inverted index. Scoring is
//! cosine over token counts, which rewards shared vocabulary without
//! needing document frequency statistics.

use super::types::{sort_hits, SearchHit};
use crate::types::TileId;
use dashmap::DashMap;
use regex::Regex;
use std::collections::{HashMap, HashSet};

pub struct LexicalIndex {
    tokenizer: Regex,
    /// tile -> token counts
    docs: DashMap<TileId, HashMap<String, u32>>,
    /// token -> tiles containing it
    postings: DashMap<String, HashSet<TileId>>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self {
            // Lowercased word characters; apostrophes keep contractions whole
            tokenizer: Regex::new(r"[a-z0-9']+").expect("tokenizer pattern is valid"),
            docs: DashMap::new(),
            postings: DashMap::new(),
        }
    }

    pub fn tokenize(&self, text: &str) -> HashMap<String, u32> {
        let lowered = text.to_lowercase();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in self.tokenizer.find_iter(&lowered) {
            *counts.entry(token.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Index (or reindex) one tile's text.
    pub fn add(&self, tile_id: TileId, text: &str) {
        let counts = self.tokenize(text);
        if counts.is_empty() {
            self.remove(&tile_id);
            return;
        }
        self.remove(&tile_id);
        for token in counts.keys() {
            self.postings.entry(token.clone()).or_default().insert(tile_id);
        }
        self.docs.insert(tile_id, counts);
    }

    pub fn remove(&self, tile_id: &TileId) {
        let Some((_, counts)) = self.docs.remove(tile_id) else {
            return;
        };
        for token in counts.keys() {
            if let Some(mut posting) = self.postings.get_mut(token) {
                posting.remove(tile_id);
                if posting.is_empty() {
                    drop(posting);
                    self.postings.remove(token);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Score one indexed tile against already-tokenized query counts.
    pub fn score_tile(&self, tile_id: &TileId, query_counts: &HashMap<String, u32>) -> f32 {
        self.docs
            .get(tile_id)
            .map(|doc| cosine_counts(query_counts, doc.value()))
            .unwrap_or(0.0)
    }

    /// Tiles sharing vocabulary with `text`, best-first.
    pub fn search(
        &self,
        text: &str,
        top_k: usize,
        allowed: Option<&HashSet<TileId>>,
    ) -> Vec<SearchHit> {
        let query_counts = self.tokenize(text);
        if query_counts.is_empty() {
            return Vec::new();
        }

        // Union of postings keeps the scan proportional to matches, not to
        // the whole corpus
        let mut candidates: HashSet<TileId> = HashSet::new();
        for token in query_counts.keys() {
            if let Some(posting) = self.postings.get(token) {
                candidates.extend(posting.iter().copied());
            }
        }

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter(|id| allowed.map(|a| a.contains(id)).unwrap_or(true))
            .map(|id| SearchHit::new(id, self.score_tile(&id, &query_counts)))
            .filter(|h| h.score > 0.0)
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        hits
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_counts(a: &HashMap<String, u32>, b: &HashMap<String, u32>) -> f32 {
    let dot: f32 = a
        .iter()
        .filter_map(|(token, &ca)| b.get(token).map(|&cb| (ca * cb) as f32))
        .sum();
    if dot == 0.0 {
        return 0.0;
    }
    let mag_a: f32 = a.values().map(|&c| (c * c) as f32).sum::<f32>().sqrt();
    let mag_b: f32 = b.values().map(|&c| (c * c) as f32).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}
