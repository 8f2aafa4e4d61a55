//! CLI contract tests
//!
//! Runs the `replaykit` binary against temp fixtures and checks:
//! - `decode` prints one JSON object per annotated message
//! - decode failures exit non-zero with an actionable message
//! - `assets` drains a spool, writes a manifest and commits offsets
//! - bad configuration is rejected before any work is done

use assert_cmd::Command;
use predicates::prelude::*;
use replaykit_codec::{AssetCache, BatchMeta, ErrorEvent, Message, Timestamp};
use replaykit_core::queue::write_spool_record;
use tempfile::TempDir;

// =============================================================================
// Fixture helpers
// =============================================================================

fn replaykit() -> Command {
    let mut cmd = Command::cargo_bin("replaykit").expect("binary built");
    cmd.env_remove("RUST_LOG").env_remove("REPLAYKIT_CONFIG");
    cmd
}

fn encode(messages: &[Message]) -> Vec<u8> {
    let mut buf = Vec::new();
    for message in messages {
        message.encode(&mut buf).expect("encode");
    }
    buf
}

fn header(timestamp: i64) -> Message {
    Message::BatchMeta(BatchMeta {
        page_no: 0,
        first_index: 0,
        timestamp,
    })
}

fn asset(url: &str) -> Message {
    Message::AssetCache(AssetCache { url: url.into() })
}

// =============================================================================
// decode
// =============================================================================

#[test]
fn decode_prints_annotated_messages() {
    let dir = TempDir::new().unwrap();
    let batch = dir.path().join("batch.bin");
    std::fs::write(
        &batch,
        encode(&[
            header(100),
            Message::Timestamp(Timestamp { timestamp: 150 }),
            asset("a.js"),
        ]),
    )
    .unwrap();

    let output = replaykit()
        .args(["--log-level", "error", "decode"])
        .arg(&batch)
        .output()
        .unwrap();
    assert!(output.status.success());

    let lines: Vec<serde_json::Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let metas: Vec<(u64, i64)> = lines
        .iter()
        .map(|l| {
            (
                l["meta"]["index"].as_u64().unwrap(),
                l["meta"]["timestamp"].as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(metas, vec![(0, 100), (0, 150), (1, 150)]);
    assert_eq!(lines[2]["message"]["url"], "a.js");
}

#[test]
fn decode_honors_initial_timestamp() {
    let dir = TempDir::new().unwrap();
    let batch = dir.path().join("batch.bin");
    std::fs::write(&batch, encode(&[asset("x")])).unwrap();

    replaykit()
        .args(["--log-level", "error", "decode", "--initial-timestamp", "42"])
        .arg(&batch)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"timestamp\":42"));
}

#[test]
fn decode_reports_framing_violation() {
    let dir = TempDir::new().unwrap();
    let batch = dir.path().join("batch.bin");
    std::fs::write(&batch, encode(&[asset("a"), header(10)])).unwrap();

    replaykit()
        .args(["--log-level", "error", "decode"])
        .arg(&batch)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("batch header found at index 1"));
}

#[test]
fn decode_missing_file_fails() {
    replaykit()
        .args(["--log-level", "error", "decode", "/nonexistent/batch.bin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading /nonexistent/batch.bin"));
}

// =============================================================================
// assets
// =============================================================================

#[test]
fn assets_drains_spool_into_manifest() {
    let dir = TempDir::new().unwrap();
    let spool = dir.path().join("cache.spool");
    let manifest = dir.path().join("jobs.jsonl");
    let offsets = dir.path().join("cache.offset");

    let mut records = Vec::new();
    write_spool_record(
        &mut records,
        7,
        &encode(&[
            header(1),
            asset("https://cdn.example.com/site.css"),
            Message::ErrorEvent(ErrorEvent {
                source: "js_exception".into(),
                payload: r#"[{"fileName":"https://cdn.example.com/app.js?v=3"}]"#.into(),
                ..Default::default()
            }),
        ]),
    )
    .unwrap();
    write_spool_record(&mut records, 8, &encode(&[asset("https://cdn.example.com/site.css")]))
        .unwrap();
    std::fs::write(&spool, &records).unwrap();

    replaykit()
        .args(["--log-level", "error", "assets", "--spool"])
        .arg(&spool)
        .arg("--manifest")
        .arg(&manifest)
        .arg("--offset-file")
        .arg(&offsets)
        .assert()
        .success();

    let jobs: Vec<serde_json::Value> = std::fs::read_to_string(&manifest)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs[0]["session_id"], 7);
    assert!(jobs[1]["key"].as_str().unwrap().starts_with("js/"));
    assert_eq!(jobs[2]["session_id"], 8);
    assert_eq!(
        std::fs::read_to_string(&offsets).unwrap().trim(),
        records.len().to_string()
    );

    // a second run resumes at the end and plans nothing new
    replaykit()
        .args(["--log-level", "error", "assets", "--spool"])
        .arg(&spool)
        .arg("--manifest")
        .arg(&manifest)
        .arg("--offset-file")
        .arg(&offsets)
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&manifest).unwrap().lines().count(), 3);
}

#[test]
fn assets_reads_stdin() {
    let mut records = Vec::new();
    write_spool_record(&mut records, 1, &encode(&[asset("https://a/x.png")])).unwrap();

    replaykit()
        .args(["--log-level", "info", "--log-format", "json", "assets", "--spool", "-"])
        .write_stdin(records)
        .assert()
        .success()
        .stderr(predicate::str::contains("https://a/x.png"));
}

#[test]
fn assets_fails_on_corrupt_batch() {
    let dir = TempDir::new().unwrap();
    let spool = dir.path().join("cache.spool");
    let mut records = Vec::new();
    write_spool_record(&mut records, 3, &[99, 1, 2, 3]).unwrap();
    std::fs::write(&spool, &records).unwrap();

    replaykit()
        .args(["--log-level", "error", "assets", "--spool"])
        .arg(&spool)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("session 3"));
}

// =============================================================================
// configuration
// =============================================================================

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("replaykit.toml");
    std::fs::write(&config, "[cache]\ncapacity = 0\n").unwrap();

    replaykit()
        .arg("--config")
        .arg(&config)
        .args(["decode", "/dev/null"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cache.capacity"));
}

#[test]
fn unknown_log_format_is_a_usage_error() {
    replaykit()
        .args(["--log-format", "xml", "decode", "/dev/null"])
        .assert()
        .failure()
        .code(2);
}
