/// Tessera CLI - Hierarchical Tile Memory Command Line Tool
///
/// This is the main CLI interface for Tessera, providing commands for
/// ingesting, querying and administering a tile store.
///
/// Usage:
///   tessera snapshot create [--parent <id>]   - Create a snapshot
///   tessera ingest <snapshot> <stream> <level> <x> <y> --file <path>
///   tessera get <snapshot> <stream> <level> <x> <y> [--out <path>]
///   tessera query <snapshot> --goal 0.1,0.2   - Plan a retrieval
///   tessera replay <trace-id>                 - Re-execute a trace
///   tessera status                            - Show store stats
///   tessera serve [--port <port>]             - Start the HTTP API
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tessera::{
    BBox, CreateSnapshot, Dtype, Hint, MergePolicy, NumericOp, QueryPlan, QueryRequest, Snapshot,
    Stream, Tessera, TileId, TileRecord,
};
use tokio::signal;

// ============================================================================
// HTTP Client for Remote Operations
// ============================================================================

/// HTTP client for remote Tessera operations.
struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    /// Create a new HTTP client.
    fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a snapshot on the remote server.
    async fn create_snapshot(&self, req: &CreateSnapshot) -> Result<Snapshot> {
        let url = format!("{}/api/v1/snapshots", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;
        let snapshot: Snapshot = response.error_for_status()?.json().await?;
        Ok(snapshot)
    }

    /// List snapshots on the remote server.
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let url = format!("{}/api/v1/snapshots", self.base_url);
        let response = self.client.get(&url).send().await?;
        let snapshots: Vec<Snapshot> = response.error_for_status()?.json().await?;
        Ok(snapshots)
    }

    /// Fetch one snapshot.
    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        let url = format!("{}/api/v1/snapshots/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Snapshot not found: {}", id);
        }

        let snapshot: Snapshot = response.error_for_status()?.json().await?;
        Ok(snapshot)
    }

    /// Merge two snapshots on the remote server.
    async fn merge(
        &self,
        ours: &str,
        theirs: &str,
        policy: Option<MergePolicy>,
    ) -> Result<Snapshot> {
        let url = format!("{}/api/v1/snapshots/{}/merge/{}", self.base_url, ours, theirs);
        let body = serde_json::json!({ "policy": policy });
        let response = self.client.post(&url).json(&body).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Snapshot not found: {} or {}", ours, theirs);
        }

        let merged: Snapshot = response.error_for_status()?.json().await?;
        Ok(merged)
    }

    /// Ingest a single tile.
    async fn ingest(&self, tile: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}/api/v1/tiles", self.base_url);
        let body = serde_json::json!({ "tiles": [tile] });
        let response = self.client.post(&url).json(&body).send().await?;
        let data: serde_json::Value = response.error_for_status()?.json().await?;
        Ok(data)
    }

    /// Read one tile by coordinate. Returns (meta, payload bytes).
    async fn get_tile(
        &self,
        snapshot: &str,
        stream: Stream,
        level: u8,
        x: i32,
        y: i32,
    ) -> Result<(serde_json::Value, Vec<u8>)> {
        let url = format!(
            "{}/api/v1/tiles/{}/{}/{}/{}/{}",
            self.base_url,
            snapshot,
            stream.as_str(),
            level,
            x,
            y
        );
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!(
                "Tile not found: {}/{} L{} ({}, {})",
                snapshot,
                stream.as_str(),
                level,
                x,
                y
            );
        }

        let data: serde_json::Value = response.error_for_status()?.json().await?;
        let hex_payload = data
            .get("payload")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let payload = hex::decode(hex_payload).context("Server returned malformed payload hex")?;
        let meta = data.get("meta").cloned().unwrap_or(serde_json::Value::Null);
        Ok((meta, payload))
    }

    /// Plan a query on the remote server.
    async fn query(&self, req: &QueryRequest) -> Result<QueryPlan> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Snapshot not found: {}", req.snapshot_id);
        }

        let plan: QueryPlan = response.error_for_status()?.json().await?;
        Ok(plan)
    }

    /// Submit a prefetch hint.
    async fn prefetch(&self, hint: serde_json::Value) -> Result<bool> {
        let url = format!("{}/api/v1/prefetch", self.base_url);
        let response = self.client.post(&url).json(&hint).send().await?;
        let data: serde_json::Value = response.error_for_status()?.json().await?;
        Ok(data
            .get("accepted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Replay a recorded trace.
    async fn replay(&self, trace_id: &str) -> Result<serde_json::Value> {
        let url = format!("{}/api/v1/traces/{}/replay", self.base_url, trace_id);
        let response = self.client.post(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Trace not found: {}", trace_id);
        }

        let report: serde_json::Value = response.error_for_status()?.json().await?;
        Ok(report)
    }

    /// Fetch server status.
    async fn status(&self) -> Result<serde_json::Value> {
        let url = format!("{}/api/v1/status", self.base_url);
        let response = self.client.get(&url).send().await?;
        let data: serde_json::Value = response.error_for_status()?.json().await?;
        Ok(data)
    }
}

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera - hierarchical tile memory", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the data directory (default: ~/.tessera)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Connect to a remote server instead of a local store
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage snapshots
    ///
    /// Examples:
    ///   tessera snapshot create --id run-42
    ///   tessera snapshot list
    ///   tessera snapshot merge run-42 run-43 --policy mean
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Ingest a tile payload into a snapshot
    ///
    /// Examples:
    ///   tessera ingest run-42 embedding 0 4 -2 --file tile.bin
    ///   tessera ingest run-42 kv_cache 1 0 0 --hex deadbeef --delta-base <tile-id>
    Ingest {
        /// Snapshot to write into
        snapshot: String,
        /// Stream name (kv_cache, embedding, skill, log, audit)
        stream: String,
        /// Pyramid level (0 = finest)
        level: u8,
        /// Tile x coordinate
        #[arg(allow_hyphen_values = true)]
        x: i32,
        /// Tile y coordinate
        #[arg(allow_hyphen_values = true)]
        y: i32,
        /// Read the payload from a file
        #[arg(long, conflicts_with = "hex")]
        file: Option<PathBuf>,
        /// Inline hex-encoded payload
        #[arg(long)]
        hex: Option<String>,
        /// Logical shape as HxWxC (default 1x1x1)
        #[arg(long, default_value = "1x1x1")]
        shape: String,
        /// Element dtype (fp16, fp32, int8, uint8)
        #[arg(long, default_value = "fp32")]
        dtype: String,
        /// Tag as key=value (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        /// Store as a delta against this base tile id
        #[arg(long)]
        delta_base: Option<String>,
    },

    /// Read a tile back by coordinate
    ///
    /// Examples:
    ///   tessera get run-42 embedding 0 4 -2
    ///   tessera get run-42 kv_cache 1 0 0 --out tile.bin
    Get {
        snapshot: String,
        stream: String,
        level: u8,
        #[arg(allow_hyphen_values = true)]
        x: i32,
        #[arg(allow_hyphen_values = true)]
        y: i32,
        /// Write the payload to a file instead of summarizing it
        #[arg(long)]
        out: Option<PathBuf>,
        /// Print full metadata
        #[arg(long)]
        verbose: bool,
    },

    /// Plan a retrieval over a snapshot
    ///
    /// Examples:
    ///   tessera query run-42 --goal 0.1,0.2,0.3
    ///   tessera query run-42 --text "login handler" --budget 100
    Query {
        /// Snapshot to search
        snapshot: String,
        /// Goal embedding as comma-separated floats
        #[arg(long)]
        goal: Option<String>,
        /// Lexical goal for tag and log search
        #[arg(long)]
        text: Option<String>,
        /// Wall-clock budget in milliseconds
        #[arg(long, default_value_t = 50)]
        budget: u64,
        /// Maximum tiles in the plan
        #[arg(long, default_value_t = 8)]
        max_tiles: usize,
        /// Stream to search (default kv_cache)
        #[arg(long, default_value = "kv_cache")]
        stream: String,
    },

    /// Hint the store that regions will be read soon
    ///
    /// Example:
    ///   tessera prefetch run-42 --stream embedding --bbox 0,0,4,4
    Prefetch {
        snapshot: String,
        #[arg(long, default_value = "kv_cache")]
        stream: String,
        /// Region as x,y,w,h in finest-level tile units (repeatable)
        #[arg(long)]
        bbox: Vec<String>,
        /// (max_level, min_level) as "max,min"
        #[arg(long, default_value = "2,0")]
        levels: String,
        /// Issuer confidence in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        confidence: f32,
    },

    /// Re-execute a recorded trace and verify determinism
    Replay {
        /// Trace id returned at record time
        trace_id: String,
    },

    /// Show store statistics
    Status,

    /// Rewrite cold packfiles, dropping dead tiles
    Compact,

    /// Start the HTTP API server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 7421)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Create a new snapshot
    Create {
        /// Caller-chosen id (generated when absent)
        #[arg(long)]
        id: Option<String>,
        /// Parent snapshot id (repeatable)
        #[arg(long)]
        parent: Vec<String>,
        /// Tag as key=value (repeatable)
        #[arg(long)]
        tag: Vec<String>,
    },
    /// List all snapshots
    List,
    /// Show one snapshot
    Show { id: String },
    /// Merge two snapshots into a new child
    Merge {
        ours: String,
        theirs: String,
        /// Merge policy: lww, structural, sum, mean or max
        #[arg(long)]
        policy: Option<String>,
    },
}

// ============================================================================
// Helpers
// ============================================================================

/// Default data directory: ~/.tessera
fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".tessera")
}

fn parse_stream(s: &str) -> Result<Stream> {
    s.parse::<Stream>()
        .map_err(|_| anyhow::anyhow!("Unknown stream '{}' (kv_cache, embedding, skill, log, audit)", s))
}

fn parse_dtype(s: &str) -> Result<Dtype> {
    match s {
        "fp16" => Ok(Dtype::F16),
        "fp32" => Ok(Dtype::F32),
        "int8" => Ok(Dtype::I8),
        "uint8" => Ok(Dtype::U8),
        other => anyhow::bail!("Unknown dtype '{}' (fp16, fp32, int8, uint8)", other),
    }
}

/// Parse "HxWxC" into a shape triple.
fn parse_shape(s: &str) -> Result<(u32, u32, u32)> {
    let parts: Vec<&str> = s.split('x').collect();
    if parts.len() != 3 {
        anyhow::bail!("Shape must be HxWxC, e.g. 256x256x3");
    }
    let h = parts[0].parse().context("Invalid shape height")?;
    let w = parts[1].parse().context("Invalid shape width")?;
    let c = parts[2].parse().context("Invalid shape channels")?;
    Ok((h, w, c))
}

/// Parse a comma-separated float list into a goal embedding.
fn parse_goal(s: &str) -> Result<Vec<f32>> {
    s.split(',')
        .map(|p| {
            p.trim()
                .parse::<f32>()
                .with_context(|| format!("Invalid goal component '{}'", p.trim()))
        })
        .collect()
}

/// Parse repeated "key=value" tag arguments.
fn parse_tags(raw: &[String]) -> Result<std::collections::BTreeMap<String, String>> {
    let mut tags = std::collections::BTreeMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("Tag must be key=value, got '{}'", entry))?;
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

fn parse_policy(s: &str) -> Result<MergePolicy> {
    match s {
        "lww" | "last-writer-wins" => Ok(MergePolicy::LastWriterWins),
        "structural" => Ok(MergePolicy::Structural),
        "sum" => Ok(MergePolicy::NumericCombine { op: NumericOp::Sum }),
        "mean" => Ok(MergePolicy::NumericCombine { op: NumericOp::Mean }),
        "max" => Ok(MergePolicy::NumericCombine { op: NumericOp::Max }),
        other => anyhow::bail!(
            "Unknown merge policy '{}' (lww, structural, sum, mean, max)",
            other
        ),
    }
}

/// Parse "x,y,w,h" into a bounding box.
fn parse_bbox(s: &str) -> Result<BBox> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 4 {
        anyhow::bail!("Bounding box must be x,y,w,h");
    }
    Ok(BBox::new(
        parts[0].trim().parse().context("Invalid bbox x")?,
        parts[1].trim().parse().context("Invalid bbox y")?,
        parts[2].trim().parse().context("Invalid bbox w")?,
        parts[3].trim().parse().context("Invalid bbox h")?,
    ))
}

/// Parse "max,min" into a level range.
fn parse_levels(s: &str) -> Result<(u8, u8)> {
    let (max, min) = s
        .split_once(',')
        .context("Level range must be max,min, e.g. 2,0")?;
    Ok((
        max.trim().parse().context("Invalid max level")?,
        min.trim().parse().context("Invalid min level")?,
    ))
}

/// Format a timestamp in a human-readable way.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Shorten a tile id to its leading hex for display.
fn short_id(id: &TileId) -> String {
    let full = id.to_string();
    full[..12.min(full.len())].to_string()
}

fn read_payload(file: Option<&PathBuf>, inline_hex: Option<&str>) -> Result<Vec<u8>> {
    match (file, inline_hex) {
        (Some(path), None) => std::fs::read(path)
            .with_context(|| format!("Failed to read payload file {}", path.display())),
        (None, Some(h)) => hex::decode(h).context("Invalid hex payload"),
        _ => anyhow::bail!("Provide the payload via exactly one of --file or --hex"),
    }
}

fn build_query(
    snapshot: String,
    goal: Option<&str>,
    text: Option<String>,
    budget: u64,
    max_tiles: usize,
    stream: &str,
) -> Result<QueryRequest> {
    let mut req = QueryRequest::new(
        goal.map(parse_goal).transpose()?.unwrap_or_default(),
        snapshot,
        budget,
    );
    req.text = text;
    req.max_tiles = max_tiles;
    req.stream = parse_stream(stream)?;
    Ok(req)
}

fn print_snapshot(snapshot: &Snapshot) {
    println!("  {} {}", "Id:".bright_white(), snapshot.snapshot_id.cyan());
    if !snapshot.parents.is_empty() {
        println!(
            "  {} {}",
            "Parents:".bright_white(),
            snapshot.parents.join(", ")
        );
    }
    println!(
        "  {} {}",
        "Created:".bright_white(),
        format_timestamp(&snapshot.created_at)
    );
    if !snapshot.tags.is_empty() {
        println!("  {}", "Tags:".bright_white());
        for (key, value) in &snapshot.tags {
            println!("    {} {}={}", "*".cyan(), key, value);
        }
    }
    println!(
        "  {} model={} code={} env={:?} seed={:?} lamport={}",
        "Provenance:".bright_black(),
        snapshot.provenance.model,
        snapshot.provenance.code_rev,
        snapshot.provenance.environment,
        snapshot.provenance.seed,
        snapshot.provenance.lamport
    );
}

fn print_plan(plan: &QueryPlan) {
    let verdict = match plan.partial_reason {
        Some(reason) => format!("partial: {:?}", reason).yellow(),
        None => "accepted".green(),
    };
    println!(
        "{} ({}, confidence {:.2}, recall {:.2}, {}ms of {}ms)",
        format!("Plan {}", plan.query_id).bold(),
        verdict,
        plan.confidence,
        plan.recall_estimate,
        plan.elapsed_ms,
        plan.budget_ms
    );
    println!();

    if plan.tiles.is_empty() {
        println!("  {}", "No tiles matched".yellow());
        return;
    }

    for tile in &plan.tiles {
        println!(
            "  {} {}  L{} ({:>4}, {:>4})  {}  score {:.2}",
            "*".cyan(),
            short_id(&tile.tile_id).bright_white(),
            tile.level,
            tile.x,
            tile.y,
            tile.stream.as_str().bright_black(),
            tile.score
        );
    }
}

// ============================================================================
// Remote Dispatch
// ============================================================================

/// Handle commands against a remote server via HTTP.
async fn handle_remote_command(command: &Commands, url: &str) -> Result<()> {
    let client = HttpClient::new(url.to_string());

    match command {
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Create { id, parent, tag } => {
                let req = CreateSnapshot {
                    snapshot_id: id.clone(),
                    parents: parent.clone(),
                    tags: parse_tags(tag)?,
                    ..Default::default()
                };
                let snapshot = client.create_snapshot(&req).await?;
                println!("{}", "OK".green().bold());
                print_snapshot(&snapshot);
                Ok(())
            }
            SnapshotCommands::List => {
                let snapshots = client.list_snapshots().await?;
                if snapshots.is_empty() {
                    println!("{}", "No snapshots".yellow());
                    return Ok(());
                }
                println!("{}", format!("Snapshots ({}):", snapshots.len()).bold());
                println!();
                for snapshot in snapshots {
                    println!(
                        "  {} {} {}",
                        "*".cyan(),
                        snapshot.snapshot_id.bright_white(),
                        format_timestamp(&snapshot.created_at).bright_black()
                    );
                }
                Ok(())
            }
            SnapshotCommands::Show { id } => {
                let snapshot = client.get_snapshot(id).await?;
                println!("{}", "Snapshot".bold().cyan());
                print_snapshot(&snapshot);
                Ok(())
            }
            SnapshotCommands::Merge { ours, theirs, policy } => {
                let policy = policy.as_deref().map(parse_policy).transpose()?;
                let merged = client.merge(ours, theirs, policy).await?;
                println!("{}", "Merged".green().bold());
                print_snapshot(&merged);
                Ok(())
            }
        },

        Commands::Ingest {
            snapshot,
            stream,
            level,
            x,
            y,
            file,
            hex: inline_hex,
            shape,
            dtype,
            tag,
            delta_base,
        } => {
            let payload = read_payload(file.as_ref(), inline_hex.as_deref())?;
            parse_stream(stream)?;
            parse_dtype(dtype)?;
            let shape = parse_shape(shape)?;
            let checksum = tessera::types::payload_digest(&payload);

            let tile = serde_json::json!({
                "stream": stream,
                "snapshot_id": snapshot,
                "level": level,
                "x": x,
                "y": y,
                "shape": shape,
                "dtype": dtype,
                "tags": parse_tags(tag)?,
                "checksum": checksum,
                "delta_base": delta_base,
                "payload": hex::encode(&payload),
            });
            let result = client.ingest(tile).await?;

            println!("{}", "OK".green().bold());
            if let Some(meta) = result
                .get("tiles")
                .and_then(|t| t.as_array())
                .and_then(|t| t.first())
            {
                let tile_id = meta.get("tile_id").and_then(|v| v.as_str()).unwrap_or("?");
                println!("  {} {}", "Tile:".bright_white(), tile_id.cyan());
                println!("  {} {} bytes", "Size:".bright_white(), payload.len());
            }
            Ok(())
        }

        Commands::Get {
            snapshot,
            stream,
            level,
            x,
            y,
            out,
            verbose,
        } => {
            let stream = parse_stream(stream)?;
            let (meta, payload) = client.get_tile(snapshot, stream, *level, *x, *y).await?;

            match out {
                Some(path) => {
                    std::fs::write(path, &payload)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!(
                        "{} {} bytes -> {}",
                        "OK".green().bold(),
                        payload.len(),
                        path.display()
                    );
                }
                None => {
                    println!("{} {} bytes", "OK".green().bold(), payload.len());
                    if *verbose {
                        println!("{}", serde_json::to_string_pretty(&meta)?.bright_black());
                    }
                }
            }
            Ok(())
        }

        Commands::Query {
            snapshot,
            goal,
            text,
            budget,
            max_tiles,
            stream,
        } => {
            let req = build_query(
                snapshot.clone(),
                goal.as_deref(),
                text.clone(),
                *budget,
                *max_tiles,
                stream,
            )?;
            let plan = client.query(&req).await?;
            print_plan(&plan);
            Ok(())
        }

        Commands::Prefetch {
            snapshot,
            stream,
            bbox,
            levels,
            confidence,
        } => {
            let bboxes = bbox.iter().map(|b| parse_bbox(b)).collect::<Result<Vec<_>>>()?;
            let hint = serde_json::json!({
                "snapshot_id": snapshot,
                "stream": parse_stream(stream)?,
                "level_range": parse_levels(levels)?,
                "bboxes": bboxes,
                "confidence": confidence,
            });
            if client.prefetch(hint).await? {
                println!("{}", "Hint accepted".green());
            } else {
                println!("{}", "Hint dropped (queue full or stale)".yellow());
            }
            Ok(())
        }

        Commands::Replay { trace_id } => {
            let report = client.replay(trace_id).await?;
            println!("{}", "Replay verified".green().bold());
            println!("{}", serde_json::to_string_pretty(&report)?.bright_black());
            Ok(())
        }

        Commands::Status => {
            let status = client.status().await?;
            println!("{}", "Server Status".bold().cyan());
            println!();
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }

        Commands::Compact => {
            println!("{}", "Compact is not available via the HTTP API".yellow());
            println!("  Run it locally against the data directory.");
            Ok(())
        }

        Commands::Serve { .. } => {
            println!("{}", "Cannot start HTTP server with --url flag".red());
            println!("  Remove --url to start a local server.");
            std::process::exit(1);
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle remote operations via HTTP
    if let Some(url) = &cli.url {
        return handle_remote_command(&cli.command, url).await;
    }

    // Determine data directory
    let db_path = cli.db_path.unwrap_or_else(default_db_path);

    // Handle serve command specially (HTTP API mode)
    if let Commands::Serve { bind, port } = &cli.command {
        return run_http_server(&db_path, bind, *port).await;
    }

    // Open the store for other commands
    let db = Tessera::open_in(&db_path)
        .await
        .context("Failed to open store")?;

    // Execute command - wrap in async block to ensure shutdown is called
    let result = async {
        match cli.command {
            Commands::Snapshot { command } => match command {
                SnapshotCommands::Create { id, parent, tag } => {
                    let snapshot = db
                        .create_snapshot(CreateSnapshot {
                            snapshot_id: id,
                            parents: parent,
                            tags: parse_tags(&tag)?,
                            ..Default::default()
                        })
                        .await
                        .context("Failed to create snapshot")?;

                    println!("{}", "OK".green().bold());
                    print_snapshot(&snapshot);
                    Ok(())
                }
                SnapshotCommands::List => {
                    let snapshots = db.list_snapshots();
                    if snapshots.is_empty() {
                        println!("{}", "No snapshots".yellow());
                        return Ok(());
                    }
                    println!("{}", format!("Snapshots ({}):", snapshots.len()).bold());
                    println!();
                    for snapshot in snapshots {
                        println!(
                            "  {} {} {}",
                            "*".cyan(),
                            snapshot.snapshot_id.bright_white(),
                            format_timestamp(&snapshot.created_at).bright_black()
                        );
                    }
                    Ok(())
                }
                SnapshotCommands::Show { id } => {
                    let snapshot = db
                        .get_snapshot(&id)
                        .with_context(|| format!("Snapshot not found: {}", id))?;
                    println!("{}", "Snapshot".bold().cyan());
                    print_snapshot(&snapshot);
                    Ok(())
                }
                SnapshotCommands::Merge { ours, theirs, policy } => {
                    let policy = policy.as_deref().map(parse_policy).transpose()?;
                    let merged = db
                        .merge(&ours, &theirs, policy)
                        .await
                        .context("Merge failed")?;
                    println!("{}", "Merged".green().bold());
                    print_snapshot(&merged);
                    Ok(())
                }
            },

            Commands::Ingest {
                snapshot,
                stream,
                level,
                x,
                y,
                file,
                hex: inline_hex,
                shape,
                dtype,
                tag,
                delta_base,
            } => {
                let payload = read_payload(file.as_ref(), inline_hex.as_deref())?;
                let mut record = TileRecord::full(
                    parse_stream(&stream)?,
                    snapshot,
                    level,
                    x,
                    y,
                    parse_shape(&shape)?,
                    parse_dtype(&dtype)?,
                    payload,
                );
                record.tags = tag;
                record.checksum = Some(tessera::types::payload_digest(&record.payload));
                record.delta_base = delta_base
                    .as_deref()
                    .map(|s| s.parse::<TileId>())
                    .transpose()
                    .map_err(|e| anyhow::anyhow!("Invalid delta base: {}", e))?;
                let size = record.payload.len();

                let metas = db.ingest(vec![record]).await.context("Ingest failed")?;

                println!("{}", "OK".green().bold());
                for meta in &metas {
                    println!("  {} {}", "Tile:".bright_white(), meta.tile_id.to_string().cyan());
                    println!("  {} {} bytes", "Size:".bright_white(), size);
                    if meta.parent_tile_id.is_some() {
                        println!(
                            "  {} delta of {}",
                            "Kind:".bright_white(),
                            short_id(meta.parent_tile_id.as_ref().unwrap())
                        );
                    }
                }
                Ok(())
            }

            Commands::Get {
                snapshot,
                stream,
                level,
                x,
                y,
                out,
                verbose,
            } => {
                let coord = tessera::TileCoord {
                    stream: parse_stream(&stream)?,
                    level,
                    x,
                    y,
                };
                let tile = db
                    .get_tile(&snapshot, &coord)
                    .await
                    .context("Failed to read tile")?;

                match out {
                    Some(path) => {
                        std::fs::write(&path, &tile.payload)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!(
                            "{} {} bytes -> {}",
                            "OK".green().bold(),
                            tile.payload.len(),
                            path.display()
                        );
                    }
                    None => {
                        println!("{} {} bytes", "OK".green().bold(), tile.payload.len());
                        println!(
                            "  {} {}",
                            "Tile:".bright_white(),
                            tile.meta.tile_id.to_string().cyan()
                        );
                        if verbose {
                            println!(
                                "{}",
                                serde_json::to_string_pretty(&tile.meta)?.bright_black()
                            );
                        }
                    }
                }
                Ok(())
            }

            Commands::Query {
                snapshot,
                goal,
                text,
                budget,
                max_tiles,
                stream,
            } => {
                let req = build_query(snapshot, goal.as_deref(), text, budget, max_tiles, &stream)?;
                let plan = db.query(req).await.context("Query failed")?;
                print_plan(&plan);
                Ok(())
            }

            Commands::Prefetch {
                snapshot,
                stream,
                bbox,
                levels,
                confidence,
            } => {
                let bboxes = bbox.iter().map(|b| parse_bbox(b)).collect::<Result<Vec<_>>>()?;
                let hint = Hint {
                    query_id: format!("hint-{}", uuid::Uuid::new_v4().simple()),
                    snapshot_id: snapshot,
                    stream: parse_stream(&stream)?,
                    level_range: parse_levels(&levels)?,
                    bboxes,
                    confidence,
                    issued_at: Utc::now(),
                };
                if db.prefetch(hint) {
                    println!("{}", "Hint accepted".green());
                } else {
                    println!("{}", "Hint dropped (queue full or stale)".yellow());
                }
                Ok(())
            }

            Commands::Replay { trace_id } => {
                let report = db.replay_trace(&trace_id).await.context("Replay failed")?;
                println!("{}", "Replay verified".green().bold());
                println!("  {} {}", "Trace:".bright_white(), report.trace_id.cyan());
                println!("  {} {}", "Snapshot:".bright_white(), report.snapshot_id);
                println!("  {} {}", "Steps:".bright_white(), report.steps);
                println!("  {} {}", "Tiles read:".bright_white(), report.tiles_read);
                Ok(())
            }

            Commands::Status => {
                let status = db.status();

                println!("{}", "Store Status".bold().cyan());
                println!();
                println!("  {} {}", "Tiles:".bright_white(), status.tiles);
                println!("  {} {}", "Snapshots:".bright_white(), status.snapshots);
                println!("  {} {}", "Traces:".bright_white(), status.traces);
                println!();
                println!(
                    "  {} {} tiles / {} bytes (capacity {})",
                    "Warm:".bright_white(),
                    status.tier.warm_tiles,
                    status.tier.warm_bytes,
                    status.tier.warm_capacity_bytes
                );
                println!(
                    "  {} {} tiles / {} bytes",
                    "Cold:".bright_white(),
                    status.tier.cold_tiles,
                    status.tier.cold_bytes
                );
                println!(
                    "  {} coarse {} / fine {} / lexical {}{}",
                    "Index:".bright_white(),
                    status.index.coarse_entries,
                    status.index.fine_entries,
                    status.index.lexical_docs,
                    if status.index.available {
                        String::new()
                    } else {
                        format!(" {}", "(degraded)".yellow())
                    }
                );
                println!();
                println!(
                    "  {} {:.1}% hit rate, {} queries ({} partial), {:.1}ms mean latency",
                    "Reads:".bright_white(),
                    status.metrics.hit_rate() * 100.0,
                    status.metrics.queries,
                    status.metrics.queries_partial,
                    status.metrics.mean_query_latency_ms()
                );
                println!(
                    "  {} {} evictions, {} promotions, {} self-heals, {} coalesced",
                    "Tiering:".bright_white(),
                    status.metrics.evictions,
                    status.metrics.promotions,
                    status.metrics.self_heals,
                    status.metrics.coalesced
                );
                println!();
                println!(
                    "  {} {}",
                    "Data dir:".bright_black(),
                    status.data_dir.display()
                );
                println!("  {} {}s", "Uptime:".bright_black(), status.uptime_secs);

                Ok(())
            }

            Commands::Compact => {
                let rewritten = db.compact().await.context("Compaction failed")?;
                println!(
                    "{} {} {} rewritten",
                    "OK".green().bold(),
                    rewritten,
                    if rewritten == 1 { "pack" } else { "packs" }
                );
                Ok(())
            }

            // Serve is handled above
            Commands::Serve { .. } => unreachable!(),
        }
    }
    .await;

    // Shutdown flushes the catalog and stops maintenance
    db.shutdown().await.ok();

    result
}

/// Run the HTTP API server
async fn run_http_server(db_path: &std::path::Path, bind: &str, port: u16) -> Result<()> {
    use tessera::http::HttpServer;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tessera=info")),
        )
        .init();

    let bind_addr = format!("{}:{}", bind, port);

    let db = Tessera::open_in(db_path)
        .await
        .context("Failed to open store")?;

    println!("{}", "Starting Tessera HTTP server...".bold().cyan());
    println!();
    println!("  {} {}", "Bind:".bright_white(), bind_addr);
    println!("  {} {}", "Data dir:".bright_white(), db_path.display());
    println!();
    println!("  {}", "Endpoints:".bright_black());
    println!("    GET    /api/v1/snapshots                    - List snapshots");
    println!("    POST   /api/v1/snapshots                    - Create snapshot");
    println!("    GET    /api/v1/snapshots/:id                - Show snapshot");
    println!("    POST   /api/v1/snapshots/:a/merge/:b        - Merge snapshots");
    println!("    POST   /api/v1/tiles                        - Ingest tiles");
    println!("    GET    /api/v1/tiles/:snap/:stream/:l/:x/:y - Read tile");
    println!("    DELETE /api/v1/tiles/:tile_id               - Delete tile");
    println!("    POST   /api/v1/query                        - Plan a retrieval");
    println!("    POST   /api/v1/prefetch                     - Submit a hint");
    println!("    POST   /api/v1/traces                       - Record a trace");
    println!("    GET    /api/v1/traces/:id                   - Show trace");
    println!("    POST   /api/v1/traces/:id/replay            - Replay trace");
    println!("    GET    /api/v1/status                       - Store status");
    println!();
    println!("{}", "Server is running. Press Ctrl+C to stop.".green());
    println!();

    let server = HttpServer::new(db.clone());

    // Handle Ctrl+C for graceful shutdown
    let shutdown = async {
        signal::ctrl_c().await.ok();
        println!();
        println!("{}", "Shutting down...".yellow());
    };

    tokio::select! {
        result = server.bind(&bind_addr) => {
            if let Err(e) = result {
                eprintln!("{} {}", "Server error:".red(), e);
            }
        }
        _ = shutdown => {}
    }

    db.shutdown().await.context("Failed to flush on shutdown")?;

    println!("{}", "Server stopped.".green());
    Ok(())
}
