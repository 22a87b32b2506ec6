//! # Tessera — Hierarchical Tile Memory
//!
//! **Tagline:** *"Coarse first. Fine on demand. Every byte accounted for."*
//!
//! Tessera is a content-addressed, multi-resolution tile store that gives you:
//! - **Git-like snapshots** - Immutable lineage with delta chains and merges
//! - **Tiered residency** - Hot tiles in warm CAS files, history in cold packs
//! - **Budgeted retrieval** - Coarse-to-fine query planning under strict
//!   tile and latency budgets
//! - **Deterministic replay** - Recorded traces re-execute byte-for-byte
//!
//! ## Quick Start
//!
//! ```ignore
//! use tessera::{CreateSnapshot, QueryRequest, Tessera, TileRecord};
//! use tessera::types::{Dtype, Stream};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Open a store (creates the data directory on first use)
//!     let db = Tessera::open_in("./tessera-data").await?;
//!
//!     // Snapshots name immutable views of the tile pyramid
//!     let snap = db.create_snapshot(CreateSnapshot::default()).await?;
//!
//!     // Write an embedding tile at the finest level
//!     let payload: Vec<u8> = 1.0f32.to_le_bytes().to_vec();
//!     db.ingest(vec![TileRecord::full(
//!         Stream::Embedding,
//!         &snap.snapshot_id,
//!         0,
//!         0,
//!         0,
//!         (1, 1, 1),
//!         Dtype::F32,
//!         payload,
//!     )])
//!     .await?;
//!
//!     // Retrieve: coarse orientation first, then refinement inside the
//!     // regions that matter, never exceeding the budget
//!     let plan = db
//!         .query(QueryRequest::new(vec![1.0], &snap.snapshot_id, 50))
//!         .await?;
//!     println!("{} tiles, acceptance {:?}", plan.tiles.len(), plan.acceptance);
//!
//!     db.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core API
//!
//! The Tessera API is deliberately small:
//!
//! - [`Tessera::open`] / [`Tessera::open_in`] - Open a store
//! - [`Tessera::ingest`] - Write full or delta tiles
//! - [`Tessera::query`] - Plan a budgeted coarse-to-fine retrieval
//! - [`Tessera::get_tile`] - Read one tile through snapshot lineage
//! - [`Tessera::prefetch`] - Submit advisory warm-up hints
//! - [`Tessera::record_trace`] / [`Tessera::replay_trace`] - Deterministic replay
//! - [`Tessera::merge`] - Merge two snapshots under a policy
//!
//! ## Architecture
//!
//! Tessera is built from seven cooperating subsystems:
//!
//! 1. **Tile store** (`store`) - Content-addressed payloads and metadata
//! 2. **Snapshot graph** (`graph`) - Lineage, delta chains, merges
//! 3. **Tiering engine** (`tier`) - Warm/cold residency, eviction, self-heal
//! 4. **Semantic index** (`index`) - Coarse, fine, and lexical search tiers
//! 5. **Query planner** (`planner`) - Budgeted coarse-to-fine plans
//! 6. **Prefetch scheduler** (`prefetch`) - Hint-driven warm-ups
//! 7. **Replay log** (`replay`) - Environment-pinned deterministic traces
//!
//! The store owns the bytes, the graph owns which bytes a snapshot sees,
//! and the tiers own where the bytes live. Everything above them consumes
//! those three contracts.
//!
//! ## Thread Safety
//!
//! All Tessera operations are thread-safe. Clone the handle cheaply and
//! share it across tasks:
//!
//! ```ignore
//! let db = Tessera::open_in("./tessera-data").await?;
//! let db_clone = db.clone(); // Cheap clone (Arc internally)
//!
//! tokio::spawn(async move {
//!     let _ = db_clone.query(req).await;
//! });
//! ```

// Internal modules
mod core;

// Storage and lineage
pub mod delta;
pub mod graph;
pub mod packfile;
pub mod store;
pub mod tier;

// Retrieval
pub mod index;
pub mod planner;
pub mod prefetch;

// Replay and persistence
pub mod catalog;
pub mod replay;

// Shared plumbing
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// HTTP API (requires http feature)
#[cfg(feature = "http")]
pub mod http;

// Public API exports
pub use crate::core::{SystemStatus, Tessera};
pub use config::TesseraConfig;
pub use error::{TesseraError, TesseraResult};

// Data model exports
pub use types::{
    Acceptance, BBox, CreateSnapshot, Dtype, Hint, MergePolicy, NumericOp, PartialReason,
    PlannedTile, Provenance, QueryPlan, QueryRequest, Snapshot, Stream, Tile, TileCoord, TileId,
    TileMeta, TileRecord, Trace, TraceStep,
};

// Subsystem exports for advanced use
pub use graph::{SnapshotGraph, TileChain};
pub use index::{IndexStats, SemanticIndex};
pub use metrics::{Metrics, MetricsSnapshot};
pub use planner::QueryPlanner;
pub use prefetch::{HintLog, PrefetchScheduler};
pub use replay::{EnvFingerprint, ReplayLog, ReplayReport};
pub use store::{StoreStats, TileStore};
pub use tier::{TierStats, TieringEngine};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::TesseraConfig;
    pub use crate::core::{SystemStatus, Tessera};
    pub use crate::error::{TesseraError, TesseraResult};
    pub use chrono::{DateTime, Utc};

    // Data model
    pub use crate::types::{
        Acceptance, BBox, CreateSnapshot, Dtype, Hint, MergePolicy, PartialReason, PlannedTile,
        QueryPlan, QueryRequest, Snapshot, Stream, Tile, TileCoord, TileId, TileMeta, TileRecord,
        Trace,
    };

    // Subsystems
    pub use crate::metrics::{Metrics, MetricsSnapshot};
    pub use crate::replay::{ReplayLog, ReplayReport};
    pub use crate::store::{StoreStats, TileStore};
    pub use crate::tier::{TierStats, TieringEngine};
}
