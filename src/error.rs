/// Error types for Tessera operations.
///
/// This module provides a comprehensive error hierarchy that covers all failure
/// modes in the tile store. All errors are well-typed and can be pattern-matched
/// for precise error handling.
///
/// Two distinctions matter throughout the crate:
/// - A missing tile (`TileNotFound`) is not the same as a damaged one
///   (`Corruption`). Corruption is detected by re-hashing payloads on read and
///   is never silently retried.
/// - An exhausted query budget is NOT an error. Planners return a partial
///   `QueryPlan` flagged as such; only unrecoverable dependency failures
///   surface here.
use crate::types::{TileCoord, TileId};
use thiserror::Error;

/// The main error type for Tessera operations.
///
/// All fallible operations in Tessera return `Result<T, TesseraError>`.
/// This provides a unified error handling interface across the entire API.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// Tile not found at the specified coordinate in any reachable snapshot
    #[error("Tile not found at {coord} for snapshot '{snapshot_id}'")]
    TileNotFound {
        /// The snapshot whose lineage was searched
        snapshot_id: String,
        /// The coordinate that was queried
        coord: TileCoord,
    },

    /// Tile id has no registered metadata
    #[error("Tile id {tile_id} is unknown")]
    TileIdUnknown {
        /// The id that was queried
        tile_id: TileId,
    },

    /// Snapshot does not exist in the graph
    #[error("Snapshot '{snapshot_id}' not found")]
    SnapshotNotFound {
        /// The snapshot id that was queried
        snapshot_id: String,
    },

    /// Snapshot id already taken
    #[error("Snapshot '{snapshot_id}' already exists")]
    SnapshotExists {
        /// The duplicate id
        snapshot_id: String,
    },

    /// Trace does not exist in the trace log
    #[error("Trace '{trace_id}' not found")]
    TraceNotFound {
        /// The trace id that was queried
        trace_id: String,
    },

    /// Stored payload no longer matches its content address.
    ///
    /// Raised by verify-on-read. Distinct from `TileNotFound`: the bytes are
    /// present but damaged. Never retried blindly; the tiering engine may
    /// re-fetch a cold copy and self-heal, otherwise this propagates.
    #[error("Corrupt payload for tile {tile_id}: expected digest {expected}, got {actual}")]
    Corruption {
        /// The tile whose payload failed verification
        tile_id: TileId,
        /// Digest recorded at ingest
        expected: String,
        /// Digest of the bytes actually read
        actual: String,
    },

    /// Caller-supplied checksum disagreed with the ingested payload
    #[error("Checksum mismatch on ingest: expected {expected}, got {actual}")]
    Integrity {
        /// Checksum the caller claimed
        expected: String,
        /// Checksum of the bytes received
        actual: String,
    },

    /// Tile is still referenced by at least one snapshot and cannot be deleted
    #[error("Tile {tile_id} is still referenced by snapshot '{snapshot_id}'")]
    Referenced {
        /// The tile that was to be deleted
        tile_id: TileId,
        /// One snapshot that still references it
        snapshot_id: String,
    },

    /// Merge could not reconcile concurrent edits.
    ///
    /// Lists the exact coordinates that conflict so callers can resolve or
    /// re-ingest them. No partial merge state is committed.
    #[error("Merge conflict on {} tile(s)", conflicts.len())]
    Conflict {
        /// Every coordinate both branches changed irreconcilably
        conflicts: Vec<TileCoord>,
    },

    /// Semantic index cannot serve searches right now.
    ///
    /// By-id tile access never depends on the index; only goal-directed
    /// search degrades. The planner falls back to cached plans or a
    /// brute-force scan over warm tiles.
    #[error("Semantic index unavailable: {reason}")]
    IndexUnavailable {
        /// What failed (fine index I/O, rebuild in progress, ...)
        reason: String,
    },

    /// Replay refused: the current environment does not match the trace
    #[error("Environment fingerprint mismatch: trace recorded {recorded}, current is {current}")]
    EnvironmentMismatch {
        /// Fingerprint stored in the trace
        recorded: String,
        /// Fingerprint of this process
        current: String,
    },

    /// Replay produced an output digest that differs from the recorded one
    #[error("Determinism failure at replay step {step}")]
    Determinism {
        /// Zero-based index of the diverging step
        step: usize,
    },

    /// Request failed validation before touching storage
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Description of the rejected input
        reason: String,
    },

    /// Catalog file exists but cannot be used
    #[error("Catalog error: {reason}")]
    Catalog {
        /// Version mismatch, truncation, or parse detail
        reason: String,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary encoding error in packfiles or the fine index
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Underlying storage I/O failed after retries were exhausted
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Result type alias for Tessera operations.
///
/// This is a convenience alias for `Result<T, TesseraError>` that makes
/// function signatures more concise throughout the codebase.
pub type TesseraResult<T> = Result<T, TesseraError>;

impl From<Box<bincode::ErrorKind>> for TesseraError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        TesseraError::Encoding(err.to_string())
    }
}
