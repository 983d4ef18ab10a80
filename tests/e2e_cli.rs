//! CLI end-to-end tests
//!
//! Tests for the mediafork command-line interface.

mod common;

use assert_cmd::prelude::*;
use common::Fixtures;
use predicates::prelude::*;
use serial_test::serial;
use std::process::Command;

/// Get a command for the mediafork binary
#[allow(deprecated)]
fn mediafork_cmd() -> Command {
    Command::cargo_bin("mediafork").unwrap()
}

fn stdout_json(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("stdout is not JSON")
}

#[test]
fn test_cli_no_args_shows_help() {
    let mut cmd = mediafork_cmd();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_help_flag() {
    let mut cmd = mediafork_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("mediafork"))
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_version_flag() {
    let mut cmd = mediafork_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mediafork"));
}

#[test]
fn test_cli_toc_help() {
    let mut cmd = mediafork_cmd();
    cmd.args(["toc", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("table of contents"));
}

#[test]
fn test_cli_probe_nonexistent_file() {
    let mut cmd = mediafork_cmd();
    cmd.args(["probe", "/nonexistent/path/movie.mkv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
#[serial]
fn test_cli_probe_wav_in_process() {
    let fixtures = Fixtures::new();
    let wav = fixtures.stereo_wav("tone.wav", 4800);

    let mut cmd = mediafork_cmd();
    cmd.args(["--in-process", "probe", wav.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Format: wav"))
        .stdout(predicate::str::contains("Audio: 2ch 48000 Hz, 16 bit"))
        .stdout(predicate::str::contains("4800 samples"));
}

#[test]
#[serial]
fn test_cli_probe_json_through_a_worker() {
    let fixtures = Fixtures::new();
    let wav = fixtures.stereo_wav("tone.wav", 1000);

    let asset = stdout_json(mediafork_cmd().args(["probe", "--json", wav.to_str().unwrap()]));
    assert_eq!(asset["format"], "wav");
    assert_eq!(asset["channels"], 2);
    assert_eq!(asset["sample_rate"], 48000);
    assert_eq!(asset["audio_length"], 1000);
    assert_eq!(asset["video_data"], false);
}

#[test]
#[serial]
fn test_cli_probe_rejects_project_files() {
    let fixtures = Fixtures::new();
    let project = fixtures.path("edit.xml");
    std::fs::write(&project, "<?xml version=\"1.0\"?><EDL></EDL>").unwrap();

    let mut cmd = mediafork_cmd();
    cmd.args(["probe", project.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open"));
}

#[test]
#[serial]
fn test_cli_samples_statistics() {
    let fixtures = Fixtures::new();
    let wav = fixtures.stereo_wav("tone.wav", 2000);

    let left = stdout_json(mediafork_cmd().args([
        "samples",
        "--json",
        "--start",
        "1",
        "-n",
        "500",
        wav.to_str().unwrap(),
    ]));
    let level = 16384.0 / 32767.0;
    assert_eq!(left["start"], 1);
    assert_eq!(left["len"], 500);
    assert!((left["min"].as_f64().unwrap() - level).abs() < 1e-9);
    assert!((left["max"].as_f64().unwrap() - level).abs() < 1e-9);

    let right = stdout_json(mediafork_cmd().args([
        "--in-process",
        "samples",
        "--json",
        "--channel",
        "1",
        wav.to_str().unwrap(),
    ]));
    let level = 8192.0 / 32767.0;
    assert_eq!(right["len"], 2000);
    assert!((right["min"].as_f64().unwrap() + level).abs() < 1e-9);
    assert!((right["rms"].as_f64().unwrap() - level).abs() < 1e-9);
}

#[test]
#[serial]
fn test_cli_samples_bad_channel() {
    let fixtures = Fixtures::new();
    let wav = fixtures.stereo_wav("tone.wav", 100);

    let mut cmd = mediafork_cmd();
    cmd.args(["--in-process", "samples", "--channel", "5", wav.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("out of range"));
}

#[test]
#[serial]
fn test_cli_frame_roundtrips_a_still() {
    let fixtures = Fixtures::new();
    let card = fixtures.card_png("card.png", 8, 4);
    let output = fixtures.path("out.png");

    let mut cmd = mediafork_cmd();
    cmd.args([
        "frame",
        card.to_str().unwrap(),
        "--output",
        output.to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("8x4"));

    let original = image::open(&card).unwrap().to_rgba8();
    let written = image::open(&output).unwrap().to_rgba8();
    assert_eq!(original, written);
}

#[test]
#[serial]
fn test_cli_frame_needs_video() {
    let fixtures = Fixtures::new();
    let wav = fixtures.stereo_wav("tone.wav", 100);
    let output = fixtures.path("out.png");

    let mut cmd = mediafork_cmd();
    cmd.args([
        "--in-process",
        "frame",
        wav.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])
    .assert()
    .failure()
    .stderr(predicate::str::contains("has no video"));
    assert!(!output.exists());
}

#[test]
#[serial]
fn test_cli_toc_not_needed_for_wav() {
    let fixtures = Fixtures::new();
    let wav = fixtures.stereo_wav("tone.wav", 100);

    let mut cmd = mediafork_cmd();
    cmd.args(["--in-process", "toc", wav.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("need no table of contents"));
}

#[test]
fn test_cli_toc_check_without_sidecar() {
    let fixtures = Fixtures::new();
    let wav = fixtures.stereo_wav("tone.wav", 100);

    let mut cmd = mediafork_cmd();
    cmd.args(["toc", "--check", wav.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No table of contents"));
}

#[test]
fn test_cli_toc_check_rejects_garbage() {
    let fixtures = Fixtures::new();
    let wav = fixtures.stereo_wav("tone.wav", 100);
    std::fs::write(fixtures.path("tone.wav.toc"), b"not a table").unwrap();

    let mut cmd = mediafork_cmd();
    cmd.args(["toc", "--check", wav.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid table of contents"));
}

#[test]
fn test_cli_config_prints_defaults() {
    let prefs = stdout_json(mediafork_cmd().arg("config"));
    assert_eq!(prefs["seek"]["seek_threshold"], 16);
    assert_eq!(prefs["toc"]["enabled"], true);
    assert_eq!(prefs["isolation"]["enabled"], true);
}

#[test]
fn test_cli_config_merges_file_and_flags() {
    let fixtures = Fixtures::new();
    let file = fixtures.preferences(r#"{"seek": {"keyframe_rewind": 4}}"#);

    let prefs = stdout_json(mediafork_cmd().args([
        "--in-process",
        "--config",
        file.to_str().unwrap(),
        "config",
    ]));
    assert_eq!(prefs["seek"]["keyframe_rewind"], 4);
    assert_eq!(prefs["seek"]["vp9_keyframe_rewind"], 1);
    assert_eq!(prefs["isolation"]["enabled"], false);
}

#[test]
fn test_cli_config_strict_fails_on_warnings() {
    let fixtures = Fixtures::new();
    let file = fixtures.preferences(r#"{"processors": 0}"#);

    let mut cmd = mediafork_cmd();
    cmd.args(["--config", file.to_str().unwrap(), "config", "--strict"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("processors is 0"));
}
