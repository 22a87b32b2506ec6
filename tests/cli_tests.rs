/// CLI tests for the tessera binary.
///
/// Each invocation is a full process run against a temporary data
/// directory, so these also exercise open/shutdown persistence between
/// commands.
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tessera(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tessera").unwrap();
    cmd.args(["--db-path", dir.path().to_str().unwrap()]);
    cmd
}

// ============================================================================
// Global flags
// ============================================================================

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("tessera")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("hierarchical tile memory"))
        .stdout(predicate::str::contains("snapshot"))
        .stdout(predicate::str::contains("ingest"))
        .stdout(predicate::str::contains("query"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_version_flag() {
    Command::cargo_bin("tessera")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tessera"));
}

// ============================================================================
// Snapshots
// ============================================================================

#[test]
fn test_snapshot_create_list_show() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "base", "--tag", "run=alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"))
        .stdout(predicate::str::contains("base"));

    tessera(&dir)
        .args(["snapshot", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Snapshots (1)"))
        .stdout(predicate::str::contains("base"));

    tessera(&dir)
        .args(["snapshot", "show", "base"])
        .assert()
        .success()
        .stdout(predicate::str::contains("base"))
        .stdout(predicate::str::contains("run=alpha"));
}

#[test]
fn test_snapshot_show_unknown_fails() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["snapshot", "show", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_duplicate_snapshot_id_is_rejected() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "twice"])
        .assert()
        .success();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "twice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

// ============================================================================
// Ingest and read back
// ============================================================================

#[test]
fn test_ingest_and_get_round_trip() {
    let dir = TempDir::new().unwrap();
    let payload = dir.path().join("payload.bin");
    std::fs::write(&payload, [0xde, 0xad, 0xbe, 0xef]).unwrap();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "run-1"])
        .assert()
        .success();

    tessera(&dir)
        .args([
            "ingest",
            "run-1",
            "kv_cache",
            "0",
            "0",
            "0",
            "--shape",
            "1x4x1",
            "--dtype",
            "uint8",
        ])
        .arg("--file")
        .arg(&payload)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));

    tessera(&dir)
        .args(["get", "run-1", "kv_cache", "0", "0", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK 4 bytes"));

    let out = dir.path().join("out.bin");
    tessera(&dir)
        .args(["get", "run-1", "kv_cache", "0", "0", "0"])
        .arg("--out")
        .arg(&out)
        .assert()
        .success();
    assert_eq!(std::fs::read(&out).unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn test_ingest_hex_payload() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "run-2"])
        .assert()
        .success();

    // Negative coordinates must parse as values, not flags.
    tessera(&dir)
        .args([
            "ingest", "run-2", "kv_cache", "0", "-3", "-7", "--hex", "cafe", "--shape", "1x2x1",
            "--dtype", "uint8",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));

    tessera(&dir)
        .args(["get", "run-2", "kv_cache", "0", "-3", "-7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK 2 bytes"));
}

#[test]
fn test_ingest_into_unknown_snapshot_fails() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args([
            "ingest", "ghost", "kv_cache", "0", "0", "0", "--hex", "ff", "--shape", "1x1x1",
            "--dtype", "uint8",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_unknown_stream_is_rejected() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "run-3"])
        .assert()
        .success();

    tessera(&dir)
        .args(["ingest", "run-3", "bogus", "0", "0", "0", "--hex", "ff"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown stream"));
}

#[test]
fn test_get_missing_tile_fails() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "run-4"])
        .assert()
        .success();

    tessera(&dir)
        .args(["get", "run-4", "kv_cache", "0", "9", "9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read tile"));
}

// ============================================================================
// Query and status
// ============================================================================

#[test]
fn test_query_prints_a_plan() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "run-5"])
        .assert()
        .success();

    tessera(&dir)
        .args(["query", "run-5", "--goal", "0.5,0.5", "--budget", "100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Plan "));
}

#[test]
fn test_query_without_goal_fails() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["snapshot", "create", "--id", "run-6"])
        .assert()
        .success();

    tessera(&dir)
        .args(["query", "run-6"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid input"));
}

#[test]
fn test_status_on_fresh_store() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Store Status"))
        .stdout(predicate::str::contains("Tiles:"))
        .stdout(predicate::str::contains("Snapshots:"));
}

#[test]
fn test_replay_unknown_trace_fails() {
    let dir = TempDir::new().unwrap();

    tessera(&dir)
        .args(["replay", "nosuch"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
