// Smoke test for the bench binary: JSON on stdout, every backend reported.
use std::process::Command;

use serde_json::Value;

#[test]
fn bench_emits_json_for_every_backend() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work_dir = temp.path().join("bench");
    let output = Command::new(env!("CARGO_BIN_EXE_queuestore-bench"))
        .args([
            "--dir",
            work_dir.to_str().expect("utf-8 path"),
            "--messages",
            "250",
            "--payload-bytes",
            "32,700",
            "--seed",
            "7",
            "--format",
            "json",
        ])
        .output()
        .expect("run bench");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["bench"], "queuestore");
    assert_eq!(report["seed"], 7);
    let results = report["results"].as_array().expect("results");
    assert_eq!(results.len(), 3 * 2 * 3);
    for entry in results {
        assert_eq!(entry["messages"], 250, "{entry}");
    }
    assert!(!work_dir.exists());
}

#[test]
fn bench_rejects_invalid_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config_path = temp.path().join("store.json");
    std::fs::write(&config_path, r#"{"block_size": 8}"#).expect("write config");
    let output = Command::new(env!("CARGO_BIN_EXE_queuestore-bench"))
        .args(["--config", config_path.to_str().expect("utf-8 path")])
        .output()
        .expect("run bench");
    assert_eq!(output.status.code(), Some(2));
}
