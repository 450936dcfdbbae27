use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kt_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kt");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("files")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/kt.sqlite"

[chunking]
chunk_size = 1000
chunk_overlap = 200

[retrieval]
final_limit = 12

[server]
bind = "127.0.0.1:0"
"#,
        root.display()
    );

    let config_path = root.join("config").join("kt.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kt(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kt_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kt binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn create_project(config_path: &Path, name: &str) -> String {
    let (stdout, stderr, success) = run_kt(config_path, &["project", "create", name]);
    assert!(success, "project create failed: stdout={}, stderr={}", stdout, stderr);
    stdout
        .split_whitespace()
        .nth(2)
        .expect("project create output should contain an id")
        .to_string()
}

#[test]
fn init_creates_database() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_kt(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn init_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success1) = run_kt(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_kt(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn project_create_and_list() {
    let (_tmp, config_path) = setup_test_env();
    run_kt(&config_path, &["init"]);

    let id = create_project(&config_path, "acme-docs");
    assert!(!id.is_empty());

    let (stdout, _, success) = run_kt(&config_path, &["project", "list"]);
    assert!(success);
    assert!(stdout.contains("acme-docs"));
    assert!(stdout.contains(&id));
}

#[test]
fn ingest_text_and_search() {
    let (tmp, config_path) = setup_test_env();
    run_kt(&config_path, &["init"]);
    let project_id = create_project(&config_path, "notes");

    let note_path = tmp.path().join("files").join("alpha.txt");
    fs::write(
        &note_path,
        "The quick brown fox jumps over the lazy dog. Rust programming notes about ownership and borrowing.",
    )
    .unwrap();

    let (stdout, stderr, success) = run_kt(
        &config_path,
        &["ingest", &project_id, "text", note_path.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("state=completed"));

    let (stdout, _, success) = run_kt(&config_path, &["search", &project_id, "ownership borrowing"]);
    assert!(success, "search failed: {}", stdout);
    assert!(stdout.contains("results"));
    assert!(stdout.contains("ownership"));
}

#[test]
fn ingest_idempotent_on_retry() {
    let (tmp, config_path) = setup_test_env();
    run_kt(&config_path, &["init"]);
    let project_id = create_project(&config_path, "retry-proj");

    let note_path = tmp.path().join("files").join("note.txt");
    fs::write(&note_path, "first version of the note").unwrap();

    let (stdout1, _, success1) = run_kt(
        &config_path,
        &["ingest", &project_id, "text", note_path.to_str().unwrap()],
    );
    assert!(success1);
    let id1 = stdout1
        .split_whitespace()
        .nth(2)
        .unwrap()
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '-')
        .to_string();

    fs::write(&note_path, "updated version of the note, now longer").unwrap();
    let (stdout2, _, success2) = run_kt(
        &config_path,
        &["ingest", &project_id, "text", note_path.to_str().unwrap()],
    );
    assert!(success2);
    assert!(
        stdout2.contains(&id1),
        "re-ingesting the same locator should reuse the document id, got: {}",
        stdout2
    );
}

#[test]
fn get_missing_document_reports_not_found() {
    let (_tmp, config_path) = setup_test_env();
    run_kt(&config_path, &["init"]);

    let (_, stderr, success) = run_kt(&config_path, &["get", "nonexistent-id"]);
    assert!(!success, "get with missing ID should fail");
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn search_empty_query_errors() {
    let (_tmp, config_path) = setup_test_env();
    run_kt(&config_path, &["init"]);
    let project_id = create_project(&config_path, "empty-query");

    let (_, stderr, success) = run_kt(&config_path, &["search", &project_id, ""]);
    assert!(!success, "empty query should be rejected");
    let _ = stderr;
}

#[test]
fn embed_pending_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env();
    run_kt(&config_path, &["init"]);

    let (_, stderr, success) = run_kt(&config_path, &["embed", "pending"]);
    assert!(!success, "embed pending should fail when provider disabled");
    assert!(stderr.contains("disabled"), "got: {}", stderr);
}

#[test]
fn embed_rebuild_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env();
    run_kt(&config_path, &["init"]);

    let (_, stderr, success) = run_kt(&config_path, &["embed", "rebuild"]);
    assert!(!success, "embed rebuild should fail when provider disabled");
    assert!(stderr.contains("disabled"), "got: {}", stderr);
}
