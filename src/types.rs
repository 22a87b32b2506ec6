/// Common types used throughout Tessera.
///
/// This module defines the core data structures of the tile memory: streams,
/// tile coordinates and metadata, snapshots with provenance, merge policies,
/// prefetch hints, query plans, and replay traces. These types are designed to
/// be simple, immutable, and content-addressable where possible.
///
/// Tiles live in a resolution pyramid per stream: level 0 is full resolution,
/// higher levels are coarser aggregates. A tile's identity is a blake3 digest
/// over its coordinates and payload, so identical content at the same
/// coordinate always maps to the same id.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A named pyramid family within the store.
///
/// Each stream holds one multi-resolution tile pyramid per snapshot. The set
/// is closed so merge policies and planners can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    /// Attention key/value state, the default retrieval target
    KvCache,
    /// Embedding planes
    Embedding,
    /// Code-like skill definitions, merged structurally
    Skill,
    /// Append-mostly textual logs, searched lexically
    Log,
    /// Audit records, never merged
    Audit,
}

impl Stream {
    /// Canonical wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::KvCache => "kv_cache",
            Stream::Embedding => "embedding",
            Stream::Skill => "skill",
            Stream::Log => "log",
            Stream::Audit => "audit",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kv_cache" => Ok(Stream::KvCache),
            "embedding" => Ok(Stream::Embedding),
            "skill" => Ok(Stream::Skill),
            "log" => Ok(Stream::Log),
            "audit" => Ok(Stream::Audit),
            other => Err(format!("unknown stream '{other}'")),
        }
    }
}

/// Element type of a tile payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    #[serde(rename = "fp16")]
    F16,
    #[serde(rename = "fp32")]
    F32,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "uint8")]
    U8,
    /// JSON-encoded vector scene content, no fixed element size
    #[serde(rename = "vector/json")]
    VectorJson,
}

impl Dtype {
    /// Size of one element in bytes, `None` for variable-width payloads.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            Dtype::F16 => Some(2),
            Dtype::F32 => Some(4),
            Dtype::I8 | Dtype::U8 => Some(1),
            Dtype::VectorJson => None,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::F16 => "fp16",
            Dtype::F32 => "fp32",
            Dtype::I8 => "int8",
            Dtype::U8 => "uint8",
            Dtype::VectorJson => "vector/json",
        };
        f.write_str(name)
    }
}

/// Content-addressed tile identity: a blake3 digest over the tile's
/// coordinates and payload.
///
/// Rendered as lowercase hex everywhere (wire, logs, file names). The digest
/// input joins each field with a NUL byte so adjacent fields can never
/// collide by concatenation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId([u8; 32]);

impl TileId {
    /// Compute the id for a tile at the given coordinate with the given
    /// payload bytes (the stored bytes: a full plane or a delta patch).
    pub fn compute(
        stream: Stream,
        snapshot_id: &str,
        level: u8,
        x: i32,
        y: i32,
        payload: &[u8],
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(stream.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(snapshot_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(level.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(x.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(y.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(payload);
        TileId(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Construct from raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        TileId(bytes)
    }

    /// Full lowercase hex rendering (64 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex chars, used in payload file names.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TileId({})", self.short())
    }
}

impl FromStr for TileId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid tile id hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "tile id must be 32 bytes".to_string())?;
        Ok(TileId(arr))
    }
}

impl Serialize for TileId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TileId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TileId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Digest of a payload alone, used for ingest checksums and verify-on-read.
pub fn payload_digest(payload: &[u8]) -> String {
    blake3::hash(payload).to_hex().to_string()
}

/// Position of a tile within a stream's pyramid.
///
/// Level 0 is full resolution; each higher level halves the grid, so one tile
/// at level L covers a `2^L x 2^L` block of level-0 tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub stream: Stream,
    pub level: u8,
    pub x: i32,
    pub y: i32,
}

impl TileCoord {
    pub fn new(stream: Stream, level: u8, x: i32, y: i32) -> Self {
        Self { stream, level, x, y }
    }

    /// Region this tile covers when projected to a finer level.
    ///
    /// Returns `None` when `target` is coarser than this tile's level.
    pub fn project_to(&self, target: u8) -> Option<BBox> {
        if target > self.level {
            return None;
        }
        let factor = 1i64 << (self.level - target);
        Some(BBox {
            x: (self.x as i64 * factor) as i32,
            y: (self.y as i64 * factor) as i32,
            w: factor as u32,
            h: factor as u32,
        })
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/L{}/x{}/y{}", self.stream, self.level, self.x, self.y)
    }
}

/// Axis-aligned region in tile units at some pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl BBox {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Whether the tile coordinate `(x, y)` falls inside this region.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && y >= self.y
            && (x as i64) < self.x as i64 + self.w as i64
            && (y as i64) < self.y as i64 + self.h as i64
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// Grow the region by `margin` tiles on every side.
    pub fn expand(&self, margin: u32) -> BBox {
        BBox {
            x: self.x.saturating_sub(margin as i32),
            y: self.y.saturating_sub(margin as i32),
            w: self.w.saturating_add(margin * 2),
            h: self.h.saturating_add(margin * 2),
        }
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        let (ax2, ay2) = (self.x as i64 + self.w as i64, self.y as i64 + self.h as i64);
        let (bx2, by2) = (other.x as i64 + other.w as i64, other.y as i64 + other.h as i64);
        (self.x as i64) < bx2 && (other.x as i64) < ax2 && (self.y as i64) < by2 && (other.y as i64) < ay2
    }
}

/// Default halo (overlap margin) carried by every tile, in elements.
pub const DEFAULT_HALO: u32 = 16;

/// Metadata for one stored tile.
///
/// The payload itself lives in the warm tier (a content-addressed file) or a
/// cold packfile; metadata is kept in memory and persisted via the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileMeta {
    /// Content address of the stored bytes
    pub tile_id: TileId,
    pub stream: Stream,
    /// Snapshot this tile was written under
    pub snapshot_id: String,
    pub level: u8,
    pub x: i32,
    pub y: i32,
    /// Logical extent (height, width, channels)
    pub shape: (u32, u32, u32),
    pub dtype: Dtype,
    /// Overlap margin in elements shared with neighboring tiles
    #[serde(default = "default_halo")]
    pub halo: u32,
    /// When present, the stored bytes are a delta patch against this tile
    pub parent_tile_id: Option<TileId>,
    /// blake3 digest of the stored bytes, re-checked on every read
    pub checksum: String,
    pub size_bytes: u64,
    /// Free-form labels; the `critical` tag pins a tile in the warm tier
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

fn default_halo() -> u32 {
    DEFAULT_HALO
}

impl TileMeta {
    pub fn coord(&self) -> TileCoord {
        TileCoord::new(self.stream, self.level, self.x, self.y)
    }

    /// Whether the stored bytes are a delta patch rather than a full plane.
    pub fn is_delta(&self) -> bool {
        self.parent_tile_id.is_some()
    }

    pub fn is_critical(&self) -> bool {
        self.tags.iter().any(|t| t == "critical")
    }
}

/// A materialized tile: metadata plus full (delta-applied) payload bytes.
#[derive(Debug, Clone)]
pub struct Tile {
    pub meta: TileMeta,
    pub payload: Vec<u8>,
}

/// One tile submitted for ingest.
///
/// `payload` carries the full plane, or a delta patch when `delta_base` names
/// the tile it was computed against. An optional caller checksum is verified
/// before anything is written.
#[derive(Debug, Clone)]
pub struct TileRecord {
    pub stream: Stream,
    pub snapshot_id: String,
    pub level: u8,
    pub x: i32,
    pub y: i32,
    pub shape: (u32, u32, u32),
    pub dtype: Dtype,
    pub halo: u32,
    pub tags: Vec<String>,
    /// blake3 hex the caller computed over `payload`, if any
    pub checksum: Option<String>,
    /// Base tile this payload is a delta against
    pub delta_base: Option<TileId>,
    pub payload: Vec<u8>,
}

impl TileRecord {
    /// A full (non-delta) record with default halo and no tags.
    pub fn full(
        stream: Stream,
        snapshot_id: impl Into<String>,
        level: u8,
        x: i32,
        y: i32,
        shape: (u32, u32, u32),
        dtype: Dtype,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            stream,
            snapshot_id: snapshot_id.into(),
            level,
            x,
            y,
            shape,
            dtype,
            halo: DEFAULT_HALO,
            tags: Vec::new(),
            checksum: None,
            delta_base: None,
            payload,
        }
    }
}

/// Where a snapshot came from: enough to reproduce and to order writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    /// Producing model or component name
    pub model: String,
    /// Source revision of the producer
    pub code_rev: String,
    /// Optional environment description (driver, device, ...)
    pub environment: Option<String>,
    /// RNG seed the producer ran with
    pub seed: Option<u64>,
    /// Logical timestamp; last-writer-wins merges order by this, never by
    /// wall clock
    pub lamport: u64,
}

impl Provenance {
    pub fn new(model: impl Into<String>, code_rev: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            code_rev: code_rev.into(),
            environment: None,
            seed: None,
            lamport: 0,
        }
    }
}

impl Default for Provenance {
    fn default() -> Self {
        Provenance::new("unknown", "unknown")
    }
}

/// How concurrent edits to the same coordinate reconcile at merge time.
///
/// The set is closed and carried per merge call; every variant either
/// resolves deterministically or reports a `Conflict` naming the exact
/// coordinates it could not reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergePolicy {
    /// Winner is the side whose snapshot carries the higher lamport stamp
    LastWriterWins,
    /// Line-oriented three-way merge for text payloads (skill and log
    /// streams); overlapping edits conflict
    Structural,
    /// Element-wise numeric combination of equal-shape tiles
    NumericCombine { op: NumericOp },
}

/// Element-wise operation for `MergePolicy::NumericCombine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericOp {
    Sum,
    Mean,
    Max,
}

/// An immutable version of the whole memory: a node in the snapshot DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    /// Parent snapshots; two parents for merge commits
    pub parents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub provenance: Provenance,
    /// Default policy for merges where the caller does not pass one
    pub merge_policy: MergePolicy,
}

/// Parameters for creating a snapshot. Missing fields get generated or
/// defaulted values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshot {
    /// Caller-chosen id; generated (`snp-<uuid>`) when absent
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub provenance: Option<Provenance>,
    pub merge_policy: Option<MergePolicy>,
}

/// Advisory prefetch hint: regions likely needed soon.
///
/// Hints are fire-and-forget. `level_range` is ordered (coarsest, finest),
/// and `bboxes` are given in tile units at the finest level of the range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hint {
    pub query_id: String,
    pub snapshot_id: String,
    pub stream: Stream,
    /// (max_level, min_level), inclusive on both ends
    pub level_range: (u8, u8),
    pub bboxes: Vec<BBox>,
    /// How sure the issuer is that these regions will be read, in [0, 1]
    pub confidence: f32,
    pub issued_at: DateTime<Utc>,
}

impl Hint {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.issued_at)
    }
}

/// A retrieval request against one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Pre-computed goal embedding; the model that produced it lives in the
    /// caller
    #[serde(default)]
    pub goal: Vec<f32>,
    /// Optional lexical goal, used for tag and log search and for reranking
    pub text: Option<String>,
    pub snapshot_id: String,
    #[serde(default = "default_stream")]
    pub stream: Stream,
    /// Wall-clock budget. Zero is legal: the plan is served from the coarse
    /// in-memory level only and flagged partial.
    pub budget_ms: u64,
    #[serde(default = "default_max_tiles")]
    pub max_tiles: usize,
    /// (max_level, min_level) to consider, inclusive
    #[serde(default = "default_level_range")]
    pub level_range: (u8, u8),
}

fn default_stream() -> Stream {
    Stream::KvCache
}

fn default_max_tiles() -> usize {
    8
}

fn default_level_range() -> (u8, u8) {
    (2, 0)
}

/// Hard cap on tiles a single plan may return.
pub const MAX_TILES_CAP: usize = 32;

impl QueryRequest {
    pub fn new(goal: Vec<f32>, snapshot_id: impl Into<String>, budget_ms: u64) -> Self {
        Self {
            goal,
            text: None,
            snapshot_id: snapshot_id.into(),
            stream: Stream::KvCache,
            budget_ms,
            max_tiles: default_max_tiles(),
            level_range: default_level_range(),
        }
    }

    /// Validate shape constraints before any storage is touched.
    pub fn validate(&self) -> Result<(), String> {
        if self.goal.is_empty() && self.text.as_deref().map_or(true, str::is_empty) {
            return Err("query needs a goal vector or goal text".to_string());
        }
        if self.max_tiles == 0 || self.max_tiles > MAX_TILES_CAP {
            return Err(format!("max_tiles must be in 1..={MAX_TILES_CAP}"));
        }
        let (max, min) = self.level_range;
        if min > max {
            return Err(format!("level_range ({max}, {min}) has min above max"));
        }
        Ok(())
    }
}

/// One tile selected by the planner, with its ranking score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTile {
    pub tile_id: TileId,
    pub stream: Stream,
    /// Snapshot whose lineage the tile resolved through
    pub snapshot_id: String,
    pub level: u8,
    pub x: i32,
    pub y: i32,
    pub score: f32,
}

impl PlannedTile {
    pub fn coord(&self) -> TileCoord {
        TileCoord::new(self.stream, self.level, self.x, self.y)
    }
}

/// Whether a plan met its acceptance criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceptance {
    Accepted,
    /// Something was degraded; `partial_reason` on the plan says what
    Partial,
}

/// Why a plan came back partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    /// Budget ran out before acceptance criteria were met
    BudgetExpired,
    /// Budget remained but confidence and recall never reached threshold
    AcceptanceUnmet,
    /// Semantic index was unavailable; plan came from cache or a warm scan
    IndexDegraded,
}

/// The planner's answer: an ordered tile working set.
///
/// A partial plan is an explicit, first-class outcome, not an error. Callers
/// must check `acceptance` before treating the set as complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query_id: String,
    pub snapshot_id: String,
    pub stream: Stream,
    /// Selected tiles, best first
    pub tiles: Vec<PlannedTile>,
    pub acceptance: Acceptance,
    pub partial_reason: Option<PartialReason>,
    /// Planner's confidence in the selection, in [0, 1]
    pub confidence: f32,
    /// Estimated fraction of the relevant region covered, in [0, 1]
    pub recall_estimate: f32,
    pub budget_ms: u64,
    pub elapsed_ms: u64,
}

impl QueryPlan {
    pub fn tile_ids(&self) -> Vec<TileId> {
        self.tiles.iter().map(|t| t.tile_id).collect()
    }

    pub fn is_partial(&self) -> bool {
        self.acceptance == Acceptance::Partial
    }
}

/// One step of a recorded trace: an input, the tiles it consumed, and the
/// digest of the output it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub input: String,
    pub tile_ids: Vec<TileId>,
    /// blake3 hex over (seed, step index, input, tile payloads in order)
    pub output: String,
}

/// A recorded execution that replay can reproduce byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub snapshot_id: String,
    pub seed: u64,
    /// SHA-256 fingerprint of the recording environment
    pub fingerprint: String,
    pub steps: Vec<TraceStep>,
    pub created_at: DateTime<Utc>,
}

/// Access telemetry for one tile, persisted with the catalog and consulted
/// by the planner's hotness scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileUsage {
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
}

impl TileUsage {
    pub fn first(now: DateTime<Utc>) -> Self {
        Self {
            access_count: 1,
            last_access: now,
        }
    }
}
