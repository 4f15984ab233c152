use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dix_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dix"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("backups.md"),
        "# Backups\n\nBackups run every night at two.\n\nRestores are tested on the first Monday of each month.",
    )
    .unwrap();
    fs::write(files_dir.join("empty.txt"), "").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/meta.sqlite"

[storage]
root = "{root}/indexes"

[chunking]
strategy = "paragraph"
chunk_size = 120
chunk_overlap = 0
min_chunk_size = 10

[retry]
initial_delay_ms = 1
max_delay_ms = 5
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docindex.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_dix(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dix_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dix binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn file(tmp: &TempDir, name: &str) -> String {
    tmp.path().join("files").join(name).display().to_string()
}

#[test]
fn test_init_creates_storage_and_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dix(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("indexes").is_dir());
    assert!(tmp.path().join("indexes/.tmp").is_dir());
    assert!(tmp.path().join("data/meta.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_dix(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_dix(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_build_then_query() {
    let (tmp, config_path) = setup_test_env();
    run_dix(&config_path, &["init"]);

    let (stdout, stderr, success) = run_dix(&config_path, &["build", &file(&tmp, "backups.md")]);
    assert!(success, "build failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Built index for document 1"));

    let (stdout, stderr, success) =
        run_dix(&config_path, &["query", "1", "When are restores tested?"]);
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("first Monday"));
}

#[test]
fn test_rebuild_without_overwrite_fails_with_hint() {
    let (tmp, config_path) = setup_test_env();
    let doc = file(&tmp, "backups.md");
    run_dix(&config_path, &["build", &doc]);

    let (_, stderr, success) = run_dix(&config_path, &["build", &doc]);
    assert!(!success);
    assert!(stderr.contains("already exists"), "stderr: {}", stderr);
    assert!(stderr.contains("--overwrite"));

    let (_, _, success) = run_dix(&config_path, &["build", &doc, "--overwrite"]);
    assert!(success);
}

#[test]
fn test_empty_document_is_rejected() {
    let (tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_dix(&config_path, &["build", &file(&tmp, "empty.txt")]);
    assert!(!success);
    assert!(stderr.contains("empty"), "stderr: {}", stderr);
}

#[test]
fn test_query_unknown_document_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_dix(&config_path, &["init"]);

    let (_, stderr, success) = run_dix(&config_path, &["query", "42", "anything?"]);
    assert!(!success);
    assert!(stderr.contains("42"), "stderr: {}", stderr);
}

#[test]
fn test_verify_detects_missing_primary_and_recover_fixes_it() {
    let (tmp, config_path) = setup_test_env();
    run_dix(&config_path, &["build", &file(&tmp, "backups.md")]);

    let (stdout, _, success) = run_dix(&config_path, &["verify", "1"]);
    assert!(success, "healthy index should verify: {}", stdout);
    assert!(stdout.contains("none"));

    let (stdout, _, _) = run_dix(&config_path, &["--json", "status", "1"]);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let index_path = PathBuf::from(status["index_path"].as_str().unwrap());
    fs::remove_file(index_path.join("vector_store.json")).unwrap();

    let (stdout, _, success) = run_dix(&config_path, &["verify", "1"]);
    assert!(!success);
    assert!(stdout.contains("critical"));
    assert!(stdout.contains("vector_store.json"));

    let (stdout, stderr, success) = run_dix(&config_path, &["recover", "1"]);
    assert!(success, "recover failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("rebuilt"));

    let (_, _, success) = run_dix(&config_path, &["verify", "1"]);
    assert!(success);
}

#[test]
fn test_cleanup_health_and_stats() {
    let (tmp, config_path) = setup_test_env();
    run_dix(&config_path, &["build", &file(&tmp, "backups.md")]);
    fs::create_dir_all(tmp.path().join("indexes/doc_77_0badf00d")).unwrap();

    let (stdout, _, success) = run_dix(&config_path, &["cleanup"]);
    assert!(success);
    assert!(stdout.contains("Removed 1 orphan"));
    assert!(!tmp.path().join("indexes/doc_77_0badf00d").exists());

    let (stdout, stderr, success) = run_dix(&config_path, &["health"]);
    assert!(success, "health failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Status: healthy"));

    let (stdout, _, success) = run_dix(&config_path, &["--json", "stats"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["documents"], 1);
    assert_eq!(stats["indexes"], 1);
    assert_eq!(stats["breakers"].as_array().unwrap().len(), 3);
}

#[test]
fn test_missing_config_fails() {
    let (_, stderr, success) = run_dix(Path::new("/nonexistent/docindex.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
