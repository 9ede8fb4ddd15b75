use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn taskq(queue_dir: &Path, args: &[&str]) -> Output {
    taskq_with_stdin(queue_dir, args, None)
}

fn taskq_with_stdin(queue_dir: &Path, args: &[&str], stdin: Option<&[u8]>) -> Output {
    let home = queue_dir.parent().expect("queue dir has a parent");
    let mut child = Command::new(env!("CARGO_BIN_EXE_taskq"))
        .args(args)
        .arg("--queue-dir")
        .arg(queue_dir)
        // Keep the user's real ~/.config/taskq.yml out of the picture.
        .env("HOME", home)
        .env_remove("TASKQ_DIR")
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn taskq");
    if let Some(bytes) = stdin {
        child
            .stdin
            .take()
            .expect("stdin pipe")
            .write_all(bytes)
            .expect("write stdin");
    }
    child.wait_with_output().expect("wait for taskq")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim_end().to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success, got {:?}\nstdout: {}\nstderr: {}",
        output.status.code(),
        stdout(output),
        stderr(output)
    );
}

fn queue() -> (TempDir, std::path::PathBuf) {
    let temp = TempDir::new().expect("temp dir");
    let queue_dir = temp.path().join("queue");
    (temp, queue_dir)
}

#[test]
fn create_prints_a_generated_id_and_show_reads_it_back() {
    let (_temp, queue_dir) = queue();
    let created = taskq(
        &queue_dir,
        &[
            "create",
            "--type",
            "github_issue",
            "--priority",
            "2",
            "--description",
            "Fix login",
            "--completion-marker",
            "###DONE###",
            "--timeout",
            "600",
        ],
    );
    assert_success(&created);
    let id = stdout(&created);
    assert!(id.starts_with("github_issue-"), "unexpected id {id:?}");

    let shown = taskq(&queue_dir, &["show", &id]);
    assert_success(&shown);
    let text = stdout(&shown);
    assert!(text.contains("Status:      pending"));
    assert!(text.contains("Completion marker:  ###DONE###"));
    assert!(text.contains("Timeout:     600s"));

    assert!(queue_dir.join("tasks.json").is_file());
}

#[test]
fn next_is_empty_and_successful_on_an_empty_queue() {
    let (_temp, queue_dir) = queue();
    let output = taskq(&queue_dir, &["next"]);
    assert_success(&output);
    assert_eq!(stdout(&output), "");

    let json = taskq(&queue_dir, &["next", "--format", "json"]);
    assert_success(&json);
    let value: serde_json::Value = serde_json::from_str(&stdout(&json)).expect("json");
    assert!(value["id"].is_null());
}

#[test]
fn errors_map_to_exit_codes_and_json_payloads() {
    let (_temp, queue_dir) = queue();
    let missing = taskq(&queue_dir, &["show", "nope"]);
    assert_eq!(missing.status.code(), Some(3));
    assert!(stderr(&missing).contains("Task not found: nope"));

    let json = taskq(&queue_dir, &["remove", "nope", "--format", "json"]);
    assert_eq!(json.status.code(), Some(3));
    let value: serde_json::Value = serde_json::from_str(&stdout(&json)).expect("json error");
    assert_eq!(value["error"]["kind"], "not_found");

    let usage = taskq(&queue_dir, &["frobnicate"]);
    assert_eq!(usage.status.code(), Some(2));
}

#[test]
fn list_filters_sorts_and_limits() {
    let (_temp, queue_dir) = queue();
    for (id, priority) in [("p4", "4"), ("p2", "2"), ("p5", "5"), ("p1", "1"), ("p3", "3")] {
        assert_success(&taskq(
            &queue_dir,
            &["create", "--id", id, "--priority", priority],
        ));
    }

    let output = taskq(
        &queue_dir,
        &["list", "--priority", "1-3", "--format", "json"],
    );
    assert_success(&output);
    let tasks: Vec<serde_json::Value> = serde_json::from_str(&stdout(&output)).expect("json");
    let ids: Vec<&str> = tasks.iter().filter_map(|task| task["id"].as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);

    let limited = taskq(&queue_dir, &["list", "--priority", "1-3", "--limit", "2"]);
    assert_success(&limited);
    let text = stdout(&limited);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3, "header plus two rows: {text}");
    assert!(lines[1].starts_with("p1 "));
    assert!(lines[2].starts_with("p2 "));
}

#[test]
fn csv_export_and_stdin_import_round_trip() {
    let (_temp, queue_dir) = queue();
    assert_success(&taskq(
        &queue_dir,
        &["create", "--id", "a", "--description", "needs \"quotes\", commas"],
    ));

    let csv = taskq(&queue_dir, &["export", "--export-format", "csv"]);
    assert_success(&csv);
    let text = String::from_utf8_lossy(&csv.stdout).to_string();
    assert!(text.starts_with("id,status,priority,type,created,description\r\n"));
    assert!(text.contains("\"needs \"\"quotes\"\", commas\""));

    let json = taskq(&queue_dir, &["export"]);
    assert_success(&json);

    let (_other_temp, other_queue) = queue();
    let imported = taskq_with_stdin(
        &other_queue,
        &["import", "-", "--mode", "merge"],
        Some(&json.stdout),
    );
    assert_success(&imported);
    assert!(stdout(&imported).contains("1 inserted, 0 updated, 0 failed"));

    let bad = taskq_with_stdin(&other_queue, &["import", "-"], Some(b"{oops"));
    assert_eq!(bad.status.code(), Some(1));
}

#[test]
fn stats_and_lock_status_report_state() {
    let (_temp, queue_dir) = queue();
    assert_success(&taskq(&queue_dir, &["create", "--id", "x"]));
    assert_success(&taskq(&queue_dir, &["update-status", "x", "in_progress"]));

    let stats = taskq(&queue_dir, &["stats", "--format", "json"]);
    assert_success(&stats);
    let value: serde_json::Value = serde_json::from_str(&stdout(&stats)).expect("json");
    assert_eq!(value["counts"]["in_progress"], 1);
    assert_eq!(value["total"], 1);

    let lock = taskq(&queue_dir, &["lock", "status"]);
    assert_success(&lock);
    assert!(stdout(&lock).contains("unlocked"));
}

#[test]
fn abandoned_lock_is_reported_then_reclaimed() {
    let (_temp, queue_dir) = queue();
    let lock_dir = queue_dir.join("tasks.json.lock");
    fs::create_dir_all(&lock_dir).expect("lock dir");

    // A fresh marker without an owner record counts as held.
    let status = taskq(&queue_dir, &["lock", "status", "--format", "json"]);
    assert_success(&status);
    let value: serde_json::Value = serde_json::from_str(&stdout(&status)).expect("json");
    assert_eq!(value["state"], "held");
    assert!(value["owner"].is_null());

    let owner = serde_json::json!({
        "pid": i32::MAX,
        "hostname": "elsewhere.invalid",
        "acquired_at": "2000-01-01T00:00:00Z",
        "token": "abandoned",
    });
    fs::write(lock_dir.join("owner.json"), owner.to_string()).expect("owner");

    let status = taskq(&queue_dir, &["lock", "status"]);
    assert_success(&status);
    assert!(stdout(&status).contains("stale"), "got {}", stdout(&status));

    let created = taskq(&queue_dir, &["create", "--id", "after-crash"]);
    assert_success(&created);
    assert!(!lock_dir.exists());
}
