//! HTTP API for Tessera.
//!
//! A RESTful interface over one [`Tessera`] handle. It enables remote
//! clients to:
//!
//! - Create, list, and merge snapshots
//! - Ingest full and delta tiles
//! - Run budgeted retrieval queries
//! - Submit prefetch hints
//! - Record and replay traces
//! - Monitor store status
//!
//! Payload bytes travel as lowercase hex; tile ids are their 64-char hex
//! digests.
//!
//! # Example
//!
//! ```ignore
//! use tessera::http::HttpServer;
//!
//! let db = Tessera::open_in("./tessera-data").await?;
//! let server = HttpServer::new(db);
//! server.bind("0.0.0.0:7421").await?;
//! ```
//!
//! # API Endpoints
//!
//! ## Snapshots
//! - `GET /api/v1/snapshots` - List snapshots
//! - `POST /api/v1/snapshots` - Create snapshot
//! - `GET /api/v1/snapshots/:id` - Get one snapshot
//! - `POST /api/v1/snapshots/:a/merge/:b` - Merge two snapshots
//!
//! ## Tiles
//! - `POST /api/v1/tiles` - Ingest a batch of tiles
//! - `GET /api/v1/tiles/:snapshot/:stream/:level/:x/:y` - Read one tile
//! - `DELETE /api/v1/tiles/:tile_id` - Delete an unreferenced tile
//!
//! ## Retrieval
//! - `POST /api/v1/query` - Plan a budgeted retrieval
//! - `POST /api/v1/prefetch` - Submit a prefetch hint (202)
//!
//! ## Replay
//! - `POST /api/v1/traces` - Record a trace
//! - `GET /api/v1/traces/:id` - Fetch a recorded trace
//! - `POST /api/v1/traces/:id/replay` - Replay and verify
//!
//! ## Status
//! - `GET /api/v1/status` - Store status

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::{SystemStatus, Tessera};
use crate::error::{TesseraError, TesseraResult};
use crate::replay::ReplayReport;
use crate::types::{
    BBox, CreateSnapshot, Dtype, Hint, MergePolicy, QueryPlan, QueryRequest, Snapshot, Stream,
    TileCoord, TileId, TileMeta, TileRecord, Trace, DEFAULT_HALO,
};

/// HTTP server for Tessera.
pub struct HttpServer {
    db: Tessera,
}

impl HttpServer {
    /// Create a new HTTP server over the given store handle.
    pub fn new(db: Tessera) -> Self {
        Self { db }
    }

    /// Start the HTTP server on the given address.
    ///
    /// # Example
    ///
    /// ```ignore
    /// server.bind("0.0.0.0:7421").await?;
    /// ```
    pub async fn bind(self, addr: &str) -> TesseraResult<()> {
        let addr: SocketAddr = addr.parse().map_err(|e| TesseraError::InvalidInput {
            reason: format!("invalid listen address: {e}"),
        })?;

        let app = router(self.db);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "http api listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// The Axum router with all routes, usable directly in tests.
pub fn router(db: Tessera) -> axum::Router {
    use axum::routing::{delete, get, post};
    use axum::Router;

    let db = Arc::new(db);
    Router::new()
        // Snapshots
        .route("/api/v1/snapshots", get(handle_list_snapshots))
        .route("/api/v1/snapshots", post(handle_create_snapshot))
        .route("/api/v1/snapshots/:id", get(handle_get_snapshot))
        .route("/api/v1/snapshots/:a/merge/:b", post(handle_merge))
        // Tiles
        .route("/api/v1/tiles", post(handle_ingest))
        .route(
            "/api/v1/tiles/:snapshot/:stream/:level/:x/:y",
            get(handle_get_tile),
        )
        .route("/api/v1/tiles/:tile_id", delete(handle_delete_tile))
        // Retrieval
        .route("/api/v1/query", post(handle_query))
        .route("/api/v1/prefetch", post(handle_prefetch))
        // Replay
        .route("/api/v1/traces", post(handle_record_trace))
        .route("/api/v1/traces/:id", get(handle_get_trace))
        .route("/api/v1/traces/:id/replay", post(handle_replay))
        // Status
        .route("/api/v1/status", get(handle_status))
        .with_state(db)
}

// State extractor type
use axum::extract::State;

/// Map the error taxonomy onto HTTP status codes.
fn error_status(err: &TesseraError) -> axum::http::StatusCode {
    use axum::http::StatusCode;
    match err {
        TesseraError::TileNotFound { .. }
        | TesseraError::TileIdUnknown { .. }
        | TesseraError::SnapshotNotFound { .. }
        | TesseraError::TraceNotFound { .. } => StatusCode::NOT_FOUND,
        TesseraError::SnapshotExists { .. }
        | TesseraError::Referenced { .. }
        | TesseraError::Conflict { .. }
        | TesseraError::EnvironmentMismatch { .. } => StatusCode::CONFLICT,
        TesseraError::InvalidInput { .. } | TesseraError::Integrity { .. } => {
            StatusCode::BAD_REQUEST
        }
        TesseraError::IndexUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// One tile in an ingest request. Payload bytes are hex-encoded.
#[derive(Debug, Deserialize)]
struct IngestTileDef {
    stream: Stream,
    snapshot_id: String,
    level: u8,
    x: i32,
    y: i32,
    shape: (u32, u32, u32),
    dtype: Dtype,
    #[serde(default = "default_halo")]
    halo: u32,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    delta_base: Option<TileId>,
    payload: String,
}

fn default_halo() -> u32 {
    DEFAULT_HALO
}

impl IngestTileDef {
    fn into_record(self) -> Result<TileRecord, axum::http::StatusCode> {
        let payload =
            hex::decode(&self.payload).map_err(|_| axum::http::StatusCode::BAD_REQUEST)?;
        Ok(TileRecord {
            stream: self.stream,
            snapshot_id: self.snapshot_id,
            level: self.level,
            x: self.x,
            y: self.y,
            shape: self.shape,
            dtype: self.dtype,
            halo: self.halo,
            tags: self.tags,
            checksum: self.checksum,
            delta_base: self.delta_base,
            payload,
        })
    }
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    tiles: Vec<IngestTileDef>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    tiles: Vec<TileMeta>,
}

/// Response for a single tile read. Payload bytes are hex-encoded.
#[derive(Debug, Serialize)]
struct TileResponse {
    meta: TileMeta,
    payload: String,
}

#[derive(Debug, Default, Deserialize)]
struct MergeRequest {
    #[serde(default)]
    policy: Option<MergePolicy>,
}

#[derive(Debug, Deserialize)]
struct PrefetchRequest {
    #[serde(default)]
    query_id: Option<String>,
    snapshot_id: String,
    stream: Stream,
    /// (max_level, min_level), inclusive on both ends
    level_range: (u8, u8),
    bboxes: Vec<BBox>,
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct TraceStepDef {
    input: String,
    tile_ids: Vec<TileId>,
}

#[derive(Debug, Deserialize)]
struct RecordTraceRequest {
    snapshot_id: String,
    #[serde(default)]
    seed: u64,
    steps: Vec<TraceStepDef>,
}

// Handler implementations

async fn handle_list_snapshots(State(db): State<Arc<Tessera>>) -> axum::Json<Vec<Snapshot>> {
    axum::Json(db.list_snapshots())
}

async fn handle_create_snapshot(
    State(db): State<Arc<Tessera>>,
    axum::Json(req): axum::Json<CreateSnapshot>,
) -> Result<axum::Json<Snapshot>, axum::http::StatusCode> {
    match db.create_snapshot(req).await {
        Ok(snapshot) => Ok(axum::Json(snapshot)),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_get_snapshot(
    State(db): State<Arc<Tessera>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<axum::Json<Snapshot>, axum::http::StatusCode> {
    match db.get_snapshot(&id) {
        Ok(snapshot) => Ok(axum::Json(snapshot)),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_merge(
    State(db): State<Arc<Tessera>>,
    axum::extract::Path((a, b)): axum::extract::Path<(String, String)>,
    axum::Json(req): axum::Json<MergeRequest>,
) -> Result<axum::Json<Snapshot>, axum::http::StatusCode> {
    match db.merge(&a, &b, req.policy).await {
        Ok(snapshot) => Ok(axum::Json(snapshot)),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_ingest(
    State(db): State<Arc<Tessera>>,
    axum::Json(req): axum::Json<IngestRequest>,
) -> Result<axum::Json<IngestResponse>, axum::http::StatusCode> {
    let mut records = Vec::with_capacity(req.tiles.len());
    for def in req.tiles {
        records.push(def.into_record()?);
    }
    match db.ingest(records).await {
        Ok(tiles) => Ok(axum::Json(IngestResponse { tiles })),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_get_tile(
    State(db): State<Arc<Tessera>>,
    axum::extract::Path((snapshot, stream, level, x, y)): axum::extract::Path<(
        String,
        String,
        u8,
        i32,
        i32,
    )>,
) -> Result<axum::Json<TileResponse>, axum::http::StatusCode> {
    let stream = Stream::from_str(&stream).map_err(|_| axum::http::StatusCode::BAD_REQUEST)?;
    let coord = TileCoord::new(stream, level, x, y);
    match db.get_tile(&snapshot, &coord).await {
        Ok(tile) => Ok(axum::Json(TileResponse {
            meta: tile.meta,
            payload: hex::encode(tile.payload),
        })),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_delete_tile(
    State(db): State<Arc<Tessera>>,
    axum::extract::Path(tile_id): axum::extract::Path<String>,
) -> Result<axum::http::StatusCode, axum::http::StatusCode> {
    let tile_id = TileId::from_str(&tile_id).map_err(|_| axum::http::StatusCode::BAD_REQUEST)?;
    match db.delete_tile(&tile_id).await {
        Ok(()) => Ok(axum::http::StatusCode::NO_CONTENT),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_query(
    State(db): State<Arc<Tessera>>,
    axum::Json(req): axum::Json<QueryRequest>,
) -> Result<axum::Json<QueryPlan>, axum::http::StatusCode> {
    match db.query(req).await {
        Ok(plan) => Ok(axum::Json(plan)),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_prefetch(
    State(db): State<Arc<Tessera>>,
    axum::Json(req): axum::Json<PrefetchRequest>,
) -> (axum::http::StatusCode, axum::Json<serde_json::Value>) {
    let hint = Hint {
        query_id: req
            .query_id
            .unwrap_or_else(|| format!("hint-{}", uuid::Uuid::new_v4().simple())),
        snapshot_id: req.snapshot_id,
        stream: req.stream,
        level_range: req.level_range,
        bboxes: req.bboxes,
        confidence: req.confidence,
        issued_at: Utc::now(),
    };
    let accepted = db.prefetch(hint);
    (
        axum::http::StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({ "accepted": accepted })),
    )
}

async fn handle_record_trace(
    State(db): State<Arc<Tessera>>,
    axum::Json(req): axum::Json<RecordTraceRequest>,
) -> Result<axum::Json<Trace>, axum::http::StatusCode> {
    let steps = req
        .steps
        .into_iter()
        .map(|s| (s.input, s.tile_ids))
        .collect();
    match db.record_trace(&req.snapshot_id, req.seed, steps).await {
        Ok(trace) => Ok(axum::Json(trace)),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_get_trace(
    State(db): State<Arc<Tessera>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<axum::Json<Trace>, axum::http::StatusCode> {
    match db.get_trace(&id) {
        Some(trace) => Ok(axum::Json(trace)),
        None => Err(axum::http::StatusCode::NOT_FOUND),
    }
}

async fn handle_replay(
    State(db): State<Arc<Tessera>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<axum::Json<ReplayReport>, axum::http::StatusCode> {
    match db.replay_trace(&id).await {
        Ok(report) => Ok(axum::Json(report)),
        Err(err) => Err(error_status(&err)),
    }
}

async fn handle_status(State(db): State<Arc<Tessera>>) -> axum::Json<SystemStatus> {
    axum::Json(db.status())
}
