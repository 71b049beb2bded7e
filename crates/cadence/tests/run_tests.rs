//! End-to-end tests for the `run` command against real processes.
#![cfg(unix)]

use std::io::Write;
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};

use cadence::runner::{self, RunOptions};
use cadence_scheduler::{ErrorKind, ExecutionRecord, Outcome};

fn jobs_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

fn read_report(dir: &TempDir) -> Vec<ExecutionRecord> {
    let raw = std::fs::read_to_string(dir.path().join("report.jsonl")).unwrap_or_default();
    raw.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_run_writes_json_lines_report() {
    let jobs = jobs_file(
        r#"[
            { "key": "ok", "command": "true" },
            { "key": "broken", "command": "sh", "args": ["-c", "exit 7"], "max_attempts": 1 },
            { "key": "missing", "command": "/nonexistent/cadence-binary" }
        ]"#,
    );
    let dir = TempDir::new().unwrap();
    let opts = RunOptions {
        jobs: jobs.path().to_path_buf(),
        report: Some(dir.path().join("report.jsonl")),
        ..Default::default()
    };

    runner::run(&opts, tokio::time::sleep(Duration::from_secs(2)))
        .await
        .unwrap();

    let records = read_report(&dir);
    let find = |key: &str| {
        records
            .iter()
            .find(|r| r.key == key)
            .unwrap_or_else(|| panic!("no record for {key}"))
    };

    assert_eq!(find("ok").outcome, Outcome::Ok);

    let broken = find("broken");
    assert_eq!(broken.outcome, Outcome::Error);
    assert_eq!(broken.error_kind, Some(ErrorKind::Transient));
    assert!(broken.error_detail.as_deref().unwrap().contains("exit code 7"));

    // Not retried: permanent
    let missing: Vec<_> = records.iter().filter(|r| r.key == "missing").collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].error_kind, Some(ErrorKind::Permanent));
}

#[tokio::test]
async fn test_command_timeout_is_recorded() {
    let jobs = jobs_file(
        r#"[{ "key": "slow", "command": "sleep", "args": ["30"], "timeout_secs": 1, "max_attempts": 1 }]"#,
    );
    let dir = TempDir::new().unwrap();
    let opts = RunOptions {
        jobs: jobs.path().to_path_buf(),
        report: Some(dir.path().join("report.jsonl")),
        ..Default::default()
    };

    runner::run(&opts, tokio::time::sleep(Duration::from_millis(2500)))
        .await
        .unwrap();

    let records = read_report(&dir);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_kind, Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn test_invalid_job_file_fails_before_running() {
    let jobs = jobs_file(r#"[{ "key": "a", "command": "true" }, { "key": "a", "command": "true" }]"#);
    let opts = RunOptions {
        jobs: jobs.path().to_path_buf(),
        ..Default::default()
    };

    let Err(err) = runner::prepare(&opts).await else {
        panic!("duplicate keys were accepted");
    };
    assert!(err.to_string().contains("duplicate job key"));
}
