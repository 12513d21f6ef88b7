#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;
use tessera::{
    archive::{Archive, ArchiveOptions, ArchiveRecord},
    changes::{Change, ChangeStatus},
    types::{ChangeId, NodeId},
};

fn seed_archive(dir: &Path) -> tessera::Result<()> {
    let archive = Archive::open(
        dir,
        ArchiveOptions {
            flush_threshold: 1_000,
            max_segment_changes: 5,
            max_segment_bytes: 1 << 20,
        },
    )?;
    for id in 1..=12u64 {
        if id == 4 {
            archive.push(ArchiveRecord::Skipped(ChangeId(id)))?;
            continue;
        }
        let mut change = Change::new(ChangeId(id), NodeId(2), vec![id as u8, 0xAB]);
        change.status = ChangeStatus::Applied;
        archive.push(ArchiveRecord::Applied(change))?;
    }
    archive.flush()?;
    Ok(())
}

fn json_output(args: &[&str], extra: Option<&Path>) -> Value {
    let mut cmd = cargo_bin_cmd!("tessera");
    cmd.args(["--format", "json"]).args(args);
    if let Some(path) = extra {
        cmd.arg(path);
    }
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn archive_info_lists_segments() {
    let dir = TempDir::new().expect("tempdir");
    seed_archive(dir.path()).expect("seed archive");

    let json = json_output(&["archive-info", "--dir"], Some(dir.path()));
    assert_eq!(json["stats"]["first_id"], 1);
    assert_eq!(json["stats"]["last_id"], 12);
    let segments = json["segments"].as_array().expect("segments array");
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[1]["first_id"], 6);
    assert_eq!(segments[1]["last_id"], 10);
    assert_eq!(
        segments[0]["file"],
        "0000000000000001_0000000000000005.seg"
    );
}

#[test]
fn archive_dump_starts_at_requested_id() {
    let dir = TempDir::new().expect("tempdir");
    seed_archive(dir.path()).expect("seed archive");

    let json = json_output(&["archive-dump", "--from", "3", "--dir"], Some(dir.path()));
    let records = json.as_array().expect("record array");
    assert_eq!(records.len(), 10);
    assert_eq!(records[0]["id"], 3);
    assert_eq!(records[0]["payload_hex"], "03ab");
    assert_eq!(records[1]["kind"], "skipped");
    assert!(records[1]["payload_hex"].is_null());
    assert_eq!(records[9]["id"], 12);
}

#[test]
fn archive_dump_text_output() {
    let dir = TempDir::new().expect("tempdir");
    seed_archive(dir.path()).expect("seed archive");

    let output = cargo_bin_cmd!("tessera")
        .args(["archive-dump", "--dir"])
        .arg(dir.path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert_eq!(text.lines().count(), 12);
    assert!(text.lines().nth(3).is_some_and(|line| line.ends_with("skipped")));
}

#[test]
fn missing_archive_dir_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("tessera")
        .args(["archive-info", "--dir"])
        .arg(dir.path().join("absent"))
        .assert()
        .failure();
    assert!(!dir.path().join("absent").exists());
}

#[test]
fn lookup_prints_balanced_slots() {
    let json = json_output(&["lookup", "--nodes", "3", "--redundancy", "2"], None);
    assert_eq!(json["quorum"], 2);
    assert_eq!(
        json["slots"],
        serde_json::json!([[1, 2], [1, 3], [2, 3]])
    );

    let json = json_output(
        &["lookup", "--nodes", "5", "--redundancy", "3", "--key", "orders:42"],
        None,
    );
    let owners = json["slots"][0].as_array().expect("owners");
    assert_eq!(owners.len(), 3);
}

#[test]
fn lookup_rejects_excess_redundancy() {
    cargo_bin_cmd!("tessera")
        .args(["lookup", "--nodes", "2", "--redundancy", "3"])
        .assert()
        .failure();
}

#[test]
fn quorum_exit_code_reflects_result() {
    let json = json_output(&["quorum", "--nodes", "4", "--live", "3"], None);
    assert_eq!(json["required"], 3);
    assert_eq!(json["has_quorum"], true);

    cargo_bin_cmd!("tessera")
        .args(["quorum", "--nodes", "4", "--live", "2"])
        .assert()
        .code(2);
}

#[test]
fn check_config_validates_file() {
    let dir = TempDir::new().expect("tempdir");
    let good = dir.path().join("node.toml");
    fs::write(
        &good,
        r#"
node_id = 1
archive_dir = "/var/lib/tessera"
redundancy = 2
gap_timeout_ms = 10000

[[peers]]
id = 2

[[peers]]
id = 3
zone = 1
"#,
    )
    .expect("write config");
    let json = json_output(&["check-config"], Some(&good));
    assert_eq!(json["node_id"], 1);
    assert_eq!(json["gap_timeout_ms"], 10000);
    assert_eq!(json["missing_timeout_ms"], 6000);
    assert_eq!(json["peers"][1]["zone"], 1);

    let bad = dir.path().join("bad.toml");
    fs::write(&bad, "node_id = 1\nsync_part_size = 0\n").expect("write config");
    cargo_bin_cmd!("tessera")
        .arg("check-config")
        .arg(&bad)
        .assert()
        .failure();
}
