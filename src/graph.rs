/// Snapshot DAG and tile resolution.
///
/// Snapshots form a directed acyclic graph kept as an id-indexed arena:
/// every node is addressed by its string id and holds the ids of its
/// parents, so there are no pointer cycles to manage and the whole graph
/// serializes directly into the catalog.
///
/// Each snapshot owns a sparse tile table mapping coordinates to delta
/// chains. Resolution walks the snapshot's lineage breadth-first and takes
/// the first chain found, so a child sees every parent tile it has not
/// overwritten. A chain is an ordered list of tile ids: a full base plane
/// followed by delta patches, applied oldest to newest.
///
/// Merging is three-way against the lowest common ancestor. Concurrent
/// edits to the same coordinate reconcile per the merge policy; anything
/// irreconcilable fails the whole merge with the exact conflicting
/// coordinates, and no partial merge state is ever committed.
use crate::error::{TesseraError, TesseraResult};
use crate::tier::TieringEngine;
use crate::types::{
    payload_digest, BBox, CreateSnapshot, Dtype, MergePolicy, NumericOp, Provenance, Snapshot,
    Stream, TileCoord, TileId, TileMeta,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Ordered tile ids for one coordinate: a full base plane first, then delta
/// patches oldest to newest. The last id is the chain head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileChain {
    pub tiles: Vec<TileId>,
}

impl TileChain {
    pub fn full(tile_id: TileId) -> Self {
        Self {
            tiles: vec![tile_id],
        }
    }

    /// The id resolution returns for this coordinate.
    pub fn head(&self) -> TileId {
        *self.tiles.last().expect("chains are never empty")
    }

    /// Number of deltas stacked on the base.
    pub fn depth(&self) -> usize {
        self.tiles.len().saturating_sub(1)
    }

    pub fn contains(&self, tile_id: &TileId) -> bool {
        self.tiles.contains(tile_id)
    }
}

type ChainKey = (String, TileCoord);

/// The snapshot DAG plus per-snapshot tile tables.
pub struct SnapshotGraph {
    nodes: DashMap<String, Snapshot>,
    children: DashMap<String, Vec<String>>,
    chains: DashMap<ChainKey, TileChain>,
    lamport: AtomicU64,
}

impl SnapshotGraph {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            children: DashMap::new(),
            chains: DashMap::new(),
            lamport: AtomicU64::new(0),
        }
    }

    /// Create a snapshot node. Parents must already exist; ids are taken
    /// exactly as given or generated when absent.
    pub fn create_snapshot(&self, req: CreateSnapshot) -> TesseraResult<Snapshot> {
        let snapshot_id = req
            .snapshot_id
            .unwrap_or_else(|| format!("snp-{}", uuid::Uuid::new_v4().simple()));
        if snapshot_id.is_empty() {
            return Err(TesseraError::InvalidInput {
                reason: "snapshot id must not be empty".to_string(),
            });
        }
        if self.nodes.contains_key(&snapshot_id) {
            return Err(TesseraError::SnapshotExists { snapshot_id });
        }
        for parent in &req.parents {
            if !self.nodes.contains_key(parent) {
                return Err(TesseraError::SnapshotNotFound {
                    snapshot_id: parent.clone(),
                });
            }
        }

        let mut provenance = req.provenance.unwrap_or_default();
        provenance.lamport = self.claim_lamport(provenance.lamport);

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            parents: req.parents,
            created_at: Utc::now(),
            tags: req.tags,
            provenance,
            merge_policy: req.merge_policy.unwrap_or(MergePolicy::LastWriterWins),
        };
        self.insert_node(snapshot.clone());
        debug!(snapshot_id, parents = ?snapshot.parents, "snapshot created");
        Ok(snapshot)
    }

    /// Insert a fully-formed snapshot (catalog load and merge commit path).
    pub fn insert_node(&self, snapshot: Snapshot) {
        self.lamport
            .fetch_max(snapshot.provenance.lamport, Ordering::SeqCst);
        for parent in &snapshot.parents {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(snapshot.snapshot_id.clone());
        }
        self.nodes.insert(snapshot.snapshot_id.clone(), snapshot);
    }

    pub fn get(&self, snapshot_id: &str) -> Option<Snapshot> {
        self.nodes.get(snapshot_id).map(|s| s.clone())
    }

    pub fn contains(&self, snapshot_id: &str) -> bool {
        self.nodes.contains_key(snapshot_id)
    }

    pub fn require(&self, snapshot_id: &str) -> TesseraResult<Snapshot> {
        self.get(snapshot_id)
            .ok_or_else(|| TesseraError::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            })
    }

    /// All snapshots, newest first.
    pub fn list(&self) -> Vec<Snapshot> {
        let mut all: Vec<Snapshot> = self.nodes.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ancestors breadth-first, closest parents first. Does not include the
    /// snapshot itself.
    pub fn ancestors(&self, snapshot_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();
        if let Some(node) = self.nodes.get(snapshot_id) {
            queue.extend(node.parents.iter().cloned());
        }
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.parents.iter().cloned());
            }
            order.push(id);
        }
        order
    }

    /// The snapshot itself followed by its ancestors in resolution order.
    pub fn lineage(&self, snapshot_id: &str) -> Vec<String> {
        let mut order = vec![snapshot_id.to_string()];
        order.extend(self.ancestors(snapshot_id));
        order
    }

    /// Lowest common ancestor of two snapshots: the shared ancestor with the
    /// smallest combined distance, ties broken lexicographically.
    pub fn common_ancestor(&self, a: &str, b: &str) -> Option<String> {
        let depths_a = self.depths_from(a);
        let depths_b = self.depths_from(b);
        depths_a
            .iter()
            .filter_map(|(id, da)| depths_b.get(id).map(|db| (id.clone(), da + db)))
            .min_by(|(id_x, dx), (id_y, dy)| dx.cmp(dy).then_with(|| id_x.cmp(id_y)))
            .map(|(id, _)| id)
    }

    fn depths_from(&self, start: &str) -> HashMap<String, usize> {
        let mut depths = HashMap::new();
        let mut queue = VecDeque::new();
        if self.nodes.contains_key(start) {
            queue.push_back((start.to_string(), 0usize));
        }
        while let Some((id, depth)) = queue.pop_front() {
            if depths.contains_key(&id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                for parent in &node.parents {
                    queue.push_back((parent.clone(), depth + 1));
                }
            }
            depths.insert(id, depth);
        }
        depths
    }

    /// Record a full plane at a coordinate, resetting any chain.
    pub fn record_full_tile(&self, snapshot_id: &str, coord: TileCoord, tile_id: TileId) {
        self.chains
            .insert((snapshot_id.to_string(), coord), TileChain::full(tile_id));
    }

    /// Record a delta on top of `base_chain`, returning the new chain depth.
    ///
    /// The base chain is whatever the coordinate resolved to before this
    /// write; a child snapshot extending a parent's chain copies the parent
    /// ids into its own table.
    pub fn record_delta_tile(
        &self,
        snapshot_id: &str,
        coord: TileCoord,
        base_chain: &TileChain,
        tile_id: TileId,
    ) -> usize {
        let mut tiles = base_chain.tiles.clone();
        tiles.push(tile_id);
        let depth = tiles.len() - 1;
        self.chains
            .insert((snapshot_id.to_string(), coord), TileChain { tiles });
        depth
    }

    /// Install a chain verbatim (catalog load, merge commit).
    pub fn record_chain(&self, snapshot_id: &str, coord: TileCoord, chain: TileChain) {
        self.chains.insert((snapshot_id.to_string(), coord), chain);
    }

    /// The chain this exact snapshot owns at a coordinate, ignoring lineage.
    pub fn chain_at(&self, snapshot_id: &str, coord: &TileCoord) -> Option<TileChain> {
        self.chains
            .get(&(snapshot_id.to_string(), *coord))
            .map(|c| c.clone())
    }

    /// Resolve a coordinate through the snapshot's lineage. Returns the
    /// owning snapshot and its chain, or `None` when never written.
    pub fn resolve(&self, snapshot_id: &str, coord: &TileCoord) -> Option<(String, TileChain)> {
        for id in self.lineage(snapshot_id) {
            if let Some(chain) = self.chains.get(&(id.clone(), *coord)) {
                return Some((id, chain.clone()));
            }
        }
        None
    }

    /// Every coordinate visible from a snapshot with its resolved chain and
    /// owning snapshot, optionally filtered by stream, level range
    /// (max, min) and a bounding box.
    pub fn visible_tiles(
        &self,
        snapshot_id: &str,
        stream: Option<Stream>,
        level_range: Option<(u8, u8)>,
        bbox: Option<BBox>,
    ) -> Vec<(TileCoord, TileChain, String)> {
        let mut first_seen: HashMap<TileCoord, (TileChain, String)> = HashMap::new();
        for id in self.lineage(snapshot_id) {
            for entry in self.chains.iter() {
                let (owner, coord) = entry.key();
                if owner != &id || first_seen.contains_key(coord) {
                    continue;
                }
                if let Some(s) = stream {
                    if coord.stream != s {
                        continue;
                    }
                }
                if let Some((max, min)) = level_range {
                    if coord.level < min || coord.level > max {
                        continue;
                    }
                }
                if let Some(b) = bbox {
                    if !b.contains(coord.x, coord.y) {
                        continue;
                    }
                }
                first_seen.insert(*coord, (entry.value().clone(), id.clone()));
            }
        }
        let mut out: Vec<(TileCoord, TileChain, String)> = first_seen
            .into_iter()
            .map(|(coord, (chain, owner))| (coord, chain, owner))
            .collect();
        out.sort_by_key(|(coord, _, _)| (coord.stream, coord.level, coord.x, coord.y));
        out
    }

    /// Whether any live snapshot's chain still contains this tile. Returns
    /// one referencing snapshot for the error message.
    pub fn referenced_by(&self, tile_id: &TileId) -> Option<String> {
        self.chains
            .iter()
            .find(|entry| entry.value().contains(tile_id))
            .map(|entry| entry.key().0.clone())
    }

    /// All chain entries (catalog save path).
    pub fn all_chains(&self) -> Vec<(String, TileCoord, TileChain)> {
        self.chains
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1, e.value().clone()))
            .collect()
    }

    /// Current lamport watermark, for catalog persistence.
    pub fn lamport(&self) -> u64 {
        self.lamport.load(Ordering::SeqCst)
    }

    /// Claim a lamport stamp that is strictly newer than everything seen.
    pub fn claim_lamport(&self, requested: u64) -> u64 {
        let next = self.lamport.fetch_add(1, Ordering::SeqCst) + 1;
        if requested > next {
            self.lamport.fetch_max(requested, Ordering::SeqCst);
            requested
        } else {
            next
        }
    }

    /// Three-way merge of two snapshots into a new child of both.
    ///
    /// Every coordinate changed on either side since the common ancestor is
    /// reconciled: one-sided changes carry over, concurrent identical writes
    /// collapse, and concurrent divergent writes go through `policy`. On any
    /// irreconcilable coordinate the merge fails with the full conflict
    /// list and commits nothing.
    pub async fn merge(
        &self,
        tier: &TieringEngine,
        a: &str,
        b: &str,
        policy: Option<MergePolicy>,
    ) -> TesseraResult<Snapshot> {
        let snap_a = self.require(a)?;
        let snap_b = self.require(b)?;
        let policy = policy.unwrap_or(snap_a.merge_policy);

        let base = self.common_ancestor(a, b);
        let changed = self.changed_since_base(a, b, base.as_deref());

        let merged_id = format!("snp-{}", uuid::Uuid::new_v4().simple());
        let mut decisions: Vec<(TileCoord, TileChain)> = Vec::new();
        let mut pending: Vec<(TileMeta, Vec<u8>)> = Vec::new();
        let mut conflicts: Vec<TileCoord> = Vec::new();

        for coord in changed {
            let head_a = self.resolve(a, &coord);
            let head_b = self.resolve(b, &coord);
            let head_base = base.as_deref().and_then(|id| self.resolve(id, &coord));

            let id_a = head_a.as_ref().map(|(_, c)| c.head());
            let id_b = head_b.as_ref().map(|(_, c)| c.head());
            let id_base = head_base.as_ref().map(|(_, c)| c.head());

            let changed_a = id_a != id_base;
            let changed_b = id_b != id_base;

            let decided = match (changed_a, changed_b) {
                (false, false) => continue,
                (true, false) => head_a.map(|(_, c)| c),
                (false, true) => head_b.map(|(_, c)| c),
                (true, true) if id_a == id_b => head_a.map(|(_, c)| c),
                (true, true) => {
                    match (head_a, head_b) {
                        (Some((owner_a, chain_a)), Some((owner_b, chain_b))) => {
                            match self
                                .reconcile(
                                    tier, &merged_id, &coord, policy, &owner_a, &chain_a,
                                    &owner_b, &chain_b,
                                )
                                .await?
                            {
                                Reconciled::Chain(chain) => Some(chain),
                                Reconciled::NewTile(meta, payload) => {
                                    let chain = TileChain::full(meta.tile_id);
                                    pending.push((meta, payload));
                                    Some(chain)
                                }
                                Reconciled::Conflict => {
                                    conflicts.push(coord);
                                    None
                                }
                            }
                        }
                        // One side deleted semantics do not exist; a missing
                        // head with a changed flag means the base was never
                        // written, so take whichever side has content.
                        (Some((_, chain)), None) | (None, Some((_, chain))) => Some(chain),
                        (None, None) => continue,
                    }
                }
            };

            if let Some(chain) = decided {
                decisions.push((coord, chain));
            }
        }

        if !conflicts.is_empty() {
            conflicts.sort_by_key(|c| (c.stream, c.level, c.x, c.y));
            tier.store()
                .metrics()
                .merge_conflicts
                .fetch_add(1, Ordering::Relaxed);
            return Err(TesseraError::Conflict { conflicts });
        }

        // Payloads first: orphaned content-addressed files are harmless if
        // the commit below never happens.
        for (meta, payload) in &pending {
            tier.store().write_payload(meta, payload).await?;
            tier.note_warm_insert(meta).await;
        }

        let merged = Snapshot {
            snapshot_id: merged_id.clone(),
            parents: vec![a.to_string(), b.to_string()],
            created_at: Utc::now(),
            tags: std::collections::BTreeMap::from([(
                "merge_of".to_string(),
                format!("{a}+{b}"),
            )]),
            provenance: Provenance {
                model: "merge".to_string(),
                code_rev: snap_a.provenance.code_rev.clone(),
                environment: None,
                seed: None,
                lamport: self.claim_lamport(
                    snap_a
                        .provenance
                        .lamport
                        .max(snap_b.provenance.lamport),
                ),
            },
            merge_policy: policy,
        };

        let decision_count = decisions.len();
        for (coord, chain) in decisions {
            self.record_chain(&merged_id, coord, chain);
        }
        // Node insert is the commit point: the merged id only resolves once
        // its chains are in place.
        self.insert_node(merged.clone());
        tier.store()
            .metrics()
            .merges
            .fetch_add(1, Ordering::Relaxed);
        info!(
            merged = merged_id,
            a, b, decisions = decision_count, "merge committed"
        );
        Ok(merged)
    }

    /// Coordinates with chain entries in either branch since the base,
    /// deterministic order.
    fn changed_since_base(&self, a: &str, b: &str, base: Option<&str>) -> Vec<TileCoord> {
        let base_lineage: HashSet<String> = base
            .map(|id| self.lineage(id).into_iter().collect())
            .unwrap_or_default();
        let mut branch_nodes: HashSet<String> = HashSet::new();
        for id in self.lineage(a).into_iter().chain(self.lineage(b)) {
            if !base_lineage.contains(&id) {
                branch_nodes.insert(id);
            }
        }
        let mut coords: Vec<TileCoord> = self
            .chains
            .iter()
            .filter(|e| branch_nodes.contains(&e.key().0))
            .map(|e| e.key().1)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        coords.sort_by_key(|c| (c.stream, c.level, c.x, c.y));
        coords
    }

    /// Resolve one divergent coordinate under a policy.
    #[allow(clippy::too_many_arguments)]
    async fn reconcile(
        &self,
        tier: &TieringEngine,
        merged_id: &str,
        coord: &TileCoord,
        policy: MergePolicy,
        owner_a: &str,
        chain_a: &TileChain,
        owner_b: &str,
        chain_b: &TileChain,
    ) -> TesseraResult<Reconciled> {
        match policy {
            MergePolicy::LastWriterWins => {
                let sa = self.require(owner_a)?;
                let sb = self.require(owner_b)?;
                let a_wins = match sa.provenance.lamport.cmp(&sb.provenance.lamport) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => match sa.created_at.cmp(&sb.created_at) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => sa.snapshot_id > sb.snapshot_id,
                    },
                };
                Ok(Reconciled::Chain(if a_wins {
                    chain_a.clone()
                } else {
                    chain_b.clone()
                }))
            }
            MergePolicy::NumericCombine { op } => {
                let meta_a = tier.store().meta(&chain_a.head()).ok_or(
                    TesseraError::TileIdUnknown {
                        tile_id: chain_a.head(),
                    },
                )?;
                let meta_b = tier.store().meta(&chain_b.head()).ok_or(
                    TesseraError::TileIdUnknown {
                        tile_id: chain_b.head(),
                    },
                )?;
                if meta_a.dtype != meta_b.dtype || meta_a.shape != meta_b.shape {
                    return Ok(Reconciled::Conflict);
                }
                let payload_a = tier.materialize(&chain_a.head()).await?;
                let payload_b = tier.materialize(&chain_b.head()).await?;
                match combine_numeric(&payload_a, &payload_b, meta_a.dtype, op) {
                    Some(combined) => {
                        Ok(self.new_full_tile(merged_id, coord, &meta_a, combined))
                    }
                    None => Ok(Reconciled::Conflict),
                }
            }
            MergePolicy::Structural => {
                let meta_a = tier.store().meta(&chain_a.head()).ok_or(
                    TesseraError::TileIdUnknown {
                        tile_id: chain_a.head(),
                    },
                )?;
                let payload_a = tier.materialize(&chain_a.head()).await?;
                let payload_b = tier.materialize(&chain_b.head()).await?;
                let base_text = match self
                    .common_ancestor(owner_a, owner_b)
                    .and_then(|id| self.resolve(&id, coord))
                {
                    Some((_, base_chain)) => {
                        let bytes = tier.materialize(&base_chain.head()).await?;
                        match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => return Ok(Reconciled::Conflict),
                        }
                    }
                    None => String::new(),
                };
                let (text_a, text_b) = match (
                    String::from_utf8(payload_a),
                    String::from_utf8(payload_b),
                ) {
                    (Ok(a), Ok(b)) => (a, b),
                    _ => return Ok(Reconciled::Conflict),
                };
                match three_way_lines(&base_text, &text_a, &text_b) {
                    Some(merged_text) => Ok(self.new_full_tile(
                        merged_id,
                        coord,
                        &meta_a,
                        merged_text.into_bytes(),
                    )),
                    None => Ok(Reconciled::Conflict),
                }
            }
        }
    }

    fn new_full_tile(
        &self,
        merged_id: &str,
        coord: &TileCoord,
        template: &TileMeta,
        payload: Vec<u8>,
    ) -> Reconciled {
        let tile_id = TileId::compute(
            coord.stream,
            merged_id,
            coord.level,
            coord.x,
            coord.y,
            &payload,
        );
        let meta = TileMeta {
            tile_id,
            stream: coord.stream,
            snapshot_id: merged_id.to_string(),
            level: coord.level,
            x: coord.x,
            y: coord.y,
            shape: template.shape,
            dtype: template.dtype,
            halo: template.halo,
            parent_tile_id: None,
            checksum: payload_digest(&payload),
            size_bytes: payload.len() as u64,
            tags: template.tags.clone(),
            created_at: Utc::now(),
        };
        Reconciled::NewTile(meta, payload)
    }
}

impl Default for SnapshotGraph {
    fn default() -> Self {
        Self::new()
    }
}

enum Reconciled {
    Chain(TileChain),
    NewTile(TileMeta, Vec<u8>),
    Conflict,
}

/// Element-wise combination of two equal-length numeric payloads. `None`
/// when the dtype cannot be combined or lengths disagree.
fn combine_numeric(a: &[u8], b: &[u8], dtype: Dtype, op: NumericOp) -> Option<Vec<u8>> {
    if a.len() != b.len() {
        return None;
    }
    match dtype {
        Dtype::F32 => {
            if a.len() % 4 != 0 {
                return None;
            }
            let mut out = Vec::with_capacity(a.len());
            for (ca, cb) in a.chunks_exact(4).zip(b.chunks_exact(4)) {
                let va = f32::from_le_bytes([ca[0], ca[1], ca[2], ca[3]]);
                let vb = f32::from_le_bytes([cb[0], cb[1], cb[2], cb[3]]);
                let v = match op {
                    NumericOp::Sum => va + vb,
                    NumericOp::Mean => (va + vb) / 2.0,
                    NumericOp::Max => va.max(vb),
                };
                out.extend_from_slice(&v.to_le_bytes());
            }
            Some(out)
        }
        Dtype::I8 => {
            let mut out = Vec::with_capacity(a.len());
            for (&ba, &bb) in a.iter().zip(b.iter()) {
                let va = ba as i8 as i16;
                let vb = bb as i8 as i16;
                let v = match op {
                    NumericOp::Sum => (va + vb).clamp(i8::MIN as i16, i8::MAX as i16),
                    NumericOp::Mean => (va + vb) / 2,
                    NumericOp::Max => va.max(vb),
                };
                out.push(v as i8 as u8);
            }
            Some(out)
        }
        Dtype::U8 => {
            let mut out = Vec::with_capacity(a.len());
            for (&ba, &bb) in a.iter().zip(b.iter()) {
                let va = ba as u16;
                let vb = bb as u16;
                let v = match op {
                    NumericOp::Sum => (va + vb).min(u8::MAX as u16),
                    NumericOp::Mean => (va + vb) / 2,
                    NumericOp::Max => va.max(vb),
                };
                out.push(v as u8);
            }
            Some(out)
        }
        // Half floats would need decoding we do not carry; JSON scenes have
        // no element-wise meaning.
        Dtype::F16 | Dtype::VectorJson => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LineEdit {
    old_start: usize,
    old_end: usize,
    new_lines: Vec<String>,
}

/// Line-oriented three-way merge. `None` when edits overlap.
fn three_way_lines(base: &str, ours: &str, theirs: &str) -> Option<String> {
    let base_lines: Vec<&str> = split_lines(base);
    let our_edits = line_edits(&base_lines, &split_lines(ours));
    let their_edits = line_edits(&base_lines, &split_lines(theirs));

    // Identical edits collapse; anything overlapping conflicts.
    let mut merged_edits: Vec<LineEdit> = our_edits.clone();
    for edit in their_edits {
        if merged_edits.contains(&edit) {
            continue;
        }
        for existing in &our_edits {
            if edits_conflict(existing, &edit) {
                return None;
            }
        }
        merged_edits.push(edit);
    }
    merged_edits.sort_by_key(|e| (e.old_start, e.old_end));

    let mut out = String::new();
    let mut cursor = 0usize;
    for edit in &merged_edits {
        for line in &base_lines[cursor..edit.old_start] {
            out.push_str(line);
        }
        for line in &edit.new_lines {
            out.push_str(line);
        }
        cursor = edit.old_end;
    }
    for line in &base_lines[cursor..] {
        out.push_str(line);
    }
    Some(out)
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn line_edits(base: &[&str], target: &[&str]) -> Vec<LineEdit> {
    use similar::DiffOp;
    let diff = similar::TextDiff::from_slices(base, target);
    let mut edits = Vec::new();
    for op in diff.ops() {
        match *op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete {
                old_index, old_len, ..
            } => edits.push(LineEdit {
                old_start: old_index,
                old_end: old_index + old_len,
                new_lines: Vec::new(),
            }),
            DiffOp::Insert {
                old_index,
                new_index,
                new_len,
            } => edits.push(LineEdit {
                old_start: old_index,
                old_end: old_index,
                new_lines: target[new_index..new_index + new_len]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            }),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => edits.push(LineEdit {
                old_start: old_index,
                old_end: old_index + old_len,
                new_lines: target[new_index..new_index + new_len]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            }),
        }
    }
    edits
}

fn edits_conflict(a: &LineEdit, b: &LineEdit) -> bool {
    // Interior overlap
    if a.old_start < b.old_end && b.old_start < a.old_end {
        return true;
    }
    // Divergent insertions at the same point
    if a.old_start == a.old_end && b.old_start == b.old_end && a.old_start == b.old_start {
        return a.new_lines != b.new_lines;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(ids: &[(&str, &[&str])]) -> SnapshotGraph {
        let graph = SnapshotGraph::new();
        for (id, parents) in ids {
            graph
                .create_snapshot(CreateSnapshot {
                    snapshot_id: Some(id.to_string()),
                    parents: parents.iter().map(|p| p.to_string()).collect(),
                    ..Default::default()
                })
                .unwrap();
        }
        graph
    }

    fn tid(n: u8) -> TileId {
        TileId::from_bytes([n; 32])
    }

    #[test]
    fn test_create_rejects_duplicates_and_missing_parents() {
        let graph = graph_with(&[("root", &[])]);
        assert!(matches!(
            graph.create_snapshot(CreateSnapshot {
                snapshot_id: Some("root".to_string()),
                ..Default::default()
            }),
            Err(TesseraError::SnapshotExists { .. })
        ));
        assert!(matches!(
            graph.create_snapshot(CreateSnapshot {
                snapshot_id: Some("child".to_string()),
                parents: vec!["ghost".to_string()],
                ..Default::default()
            }),
            Err(TesseraError::SnapshotNotFound { .. })
        ));
    }

    #[test]
    fn test_lamport_is_monotonic() {
        let graph = graph_with(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let la = graph.get("a").unwrap().provenance.lamport;
        let lb = graph.get("b").unwrap().provenance.lamport;
        let lc = graph.get("c").unwrap().provenance.lamport;
        assert!(la < lb && lb < lc);
    }

    #[test]
    fn test_ancestors_closest_first() {
        let graph = graph_with(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(graph.ancestors("c"), vec!["b".to_string(), "a".to_string()]);
        assert!(graph.ancestors("a").is_empty());
    }

    #[test]
    fn test_lca_diamond() {
        // a -> b, a -> c, (b, c) -> d
        let graph = graph_with(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert_eq!(graph.common_ancestor("b", "c").unwrap(), "a");
        assert_eq!(graph.common_ancestor("d", "b").unwrap(), "b");
        assert_eq!(graph.common_ancestor("a", "a").unwrap(), "a");
    }

    #[test]
    fn test_lca_disjoint_roots() {
        let graph = graph_with(&[("x", &[]), ("y", &[])]);
        assert!(graph.common_ancestor("x", "y").is_none());
    }

    #[test]
    fn test_resolution_walks_lineage() {
        let graph = graph_with(&[("parent", &[]), ("child", &["parent"])]);
        let coord = TileCoord::new(Stream::KvCache, 0, 1, 1);
        graph.record_full_tile("parent", coord, tid(1));

        // Child inherits
        let (owner, chain) = graph.resolve("child", &coord).unwrap();
        assert_eq!(owner, "parent");
        assert_eq!(chain.head(), tid(1));

        // Child overwrite shadows the parent
        graph.record_full_tile("child", coord, tid(2));
        let (owner, chain) = graph.resolve("child", &coord).unwrap();
        assert_eq!(owner, "child");
        assert_eq!(chain.head(), tid(2));

        // Parent still sees its own
        assert_eq!(graph.resolve("parent", &coord).unwrap().1.head(), tid(1));
    }

    #[test]
    fn test_delta_chain_depth() {
        let graph = graph_with(&[("s", &[])]);
        let coord = TileCoord::new(Stream::KvCache, 0, 0, 0);
        graph.record_full_tile("s", coord, tid(1));

        let base = graph.chain_at("s", &coord).unwrap();
        let depth = graph.record_delta_tile("s", coord, &base, tid(2));
        assert_eq!(depth, 1);

        let base = graph.chain_at("s", &coord).unwrap();
        let depth = graph.record_delta_tile("s", coord, &base, tid(3));
        assert_eq!(depth, 2);
        assert_eq!(base.head(), tid(2));
        assert_eq!(graph.chain_at("s", &coord).unwrap().tiles, vec![tid(1), tid(2), tid(3)]);
    }

    #[test]
    fn test_referenced_by_chain_membership() {
        let graph = graph_with(&[("s", &[])]);
        let coord = TileCoord::new(Stream::KvCache, 0, 0, 0);
        graph.record_full_tile("s", coord, tid(1));
        let base = graph.chain_at("s", &coord).unwrap();
        graph.record_delta_tile("s", coord, &base, tid(2));

        // Both the base and the delta are referenced while chained
        assert_eq!(graph.referenced_by(&tid(1)).unwrap(), "s");
        assert_eq!(graph.referenced_by(&tid(2)).unwrap(), "s");
        assert!(graph.referenced_by(&tid(9)).is_none());

        // A full rewrite drops the old chain
        graph.record_full_tile("s", coord, tid(3));
        assert!(graph.referenced_by(&tid(1)).is_none());
        assert!(graph.referenced_by(&tid(2)).is_none());
    }

    #[test]
    fn test_visible_tiles_filters() {
        let graph = graph_with(&[("p", &[]), ("c", &["p"])]);
        graph.record_full_tile("p", TileCoord::new(Stream::KvCache, 0, 0, 0), tid(1));
        graph.record_full_tile("p", TileCoord::new(Stream::KvCache, 2, 0, 0), tid(2));
        graph.record_full_tile("c", TileCoord::new(Stream::Skill, 0, 5, 5), tid(3));

        let all = graph.visible_tiles("c", None, None, None);
        assert_eq!(all.len(), 3);

        let kv_only = graph.visible_tiles("c", Some(Stream::KvCache), None, None);
        assert_eq!(kv_only.len(), 2);

        let coarse = graph.visible_tiles("c", Some(Stream::KvCache), Some((2, 1)), None);
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse[0].1.head(), tid(2));

        let boxed = graph.visible_tiles(
            "c",
            Some(Stream::Skill),
            None,
            Some(BBox::new(4, 4, 3, 3)),
        );
        assert_eq!(boxed.len(), 1);
        assert_eq!(boxed[0].1.head(), tid(3));
    }

    #[test]
    fn test_combine_numeric_f32() {
        let a: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let b: Vec<u8> = [3.0f32, 4.0].iter().flat_map(|v| v.to_le_bytes()).collect();

        let sum = combine_numeric(&a, &b, Dtype::F32, NumericOp::Sum).unwrap();
        let vals: Vec<f32> = sum
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(vals, vec![4.0, 6.0]);

        let mean = combine_numeric(&a, &b, Dtype::F32, NumericOp::Mean).unwrap();
        let vals: Vec<f32> = mean
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(vals, vec![2.0, 3.0]);
    }

    #[test]
    fn test_combine_numeric_u8_saturates() {
        let out = combine_numeric(&[250, 10], &[10, 10], Dtype::U8, NumericOp::Sum).unwrap();
        assert_eq!(out, vec![255, 20]);
        let out = combine_numeric(&[250, 10], &[10, 10], Dtype::U8, NumericOp::Max).unwrap();
        assert_eq!(out, vec![250, 10]);
    }

    #[test]
    fn test_combine_numeric_rejects_mismatch() {
        assert!(combine_numeric(&[0; 4], &[0; 8], Dtype::F32, NumericOp::Sum).is_none());
        assert!(combine_numeric(&[0; 3], &[0; 3], Dtype::F32, NumericOp::Sum).is_none());
        assert!(combine_numeric(&[0; 2], &[0; 2], Dtype::F16, NumericOp::Sum).is_none());
    }

    #[test]
    fn test_three_way_disjoint_edits_merge() {
        let base = "fn a() {}\nfn b() {}\nfn c() {}\n";
        let ours = "fn a() { log(); }\nfn b() {}\nfn c() {}\n";
        let theirs = "fn a() {}\nfn b() {}\nfn c() { retry(); }\n";

        let merged = three_way_lines(base, ours, theirs).unwrap();
        assert_eq!(merged, "fn a() { log(); }\nfn b() {}\nfn c() { retry(); }\n");
    }

    #[test]
    fn test_three_way_identical_edits_collapse() {
        let base = "one\ntwo\n";
        let both = "one\ntwo fixed\n";
        assert_eq!(three_way_lines(base, both, both).unwrap(), both);
    }

    #[test]
    fn test_three_way_overlap_conflicts() {
        let base = "line\n";
        let ours = "line ours\n";
        let theirs = "line theirs\n";
        assert!(three_way_lines(base, ours, theirs).is_none());
    }

    #[test]
    fn test_three_way_appends_from_empty_base() {
        // Divergent insertions at the same point conflict
        assert!(three_way_lines("", "ours\n", "theirs\n").is_none());
        // One-sided growth is fine
        assert_eq!(three_way_lines("", "ours\n", "").unwrap(), "ours\n");
    }
}
