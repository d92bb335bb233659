use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn run_cli(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bookshelf-sync"))
        .current_dir(dir)
        .args(["--store", "data"])
        .args(args)
        .output()
        .expect("failed to launch bookshelf-sync")
}

fn seed(dir: &Path, collection: &str, body: &str) {
    let store = dir.join("data");
    std::fs::create_dir_all(&store).unwrap();
    std::fs::write(store.join(format!("{}.json", collection)), body).unwrap();
}

#[test]
fn test_successful_sync_exits_zero() {
    let dir = TempDir::new().unwrap();
    seed(dir.path(), "kobo", r#"[{"id": "k1", "title": "Dune", "authors": ["Frank Herbert"], "progress": 40}]"#);

    let output = run_cli(
        dir.path(),
        &["sync", "--source", "kobo", "--source-platform", "kobo", "--target", "kindle", "--target-platform", "kindle"],
    );
    assert!(output.status.success(), "stdout: {}", String::from_utf8_lossy(&output.stdout));
    assert!(dir.path().join("data").join("kindle.json").exists());
}

#[test]
fn test_failed_sync_exits_non_zero() {
    let dir = TempDir::new().unwrap();
    seed(dir.path(), "kobo", r#"[{"id": "k1", "title": "Dune"}]"#);

    let output = run_cli(
        dir.path(),
        &["sync", "--source", "kobo", "--source-platform", "kobo", "--target", "../escape", "--target-platform", "kindle"],
    );
    assert!(!output.status.success());
    assert!(!dir.path().join("escape.json").exists());
}

#[test]
fn test_failed_processing_exits_non_zero() {
    let dir = TempDir::new().unwrap();
    seed(dir.path(), "broken", "[{\"id\":");

    let output = run_cli(dir.path(), &["process", "--platform", "readmoo", "--collection", "broken"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Processing failed"));
}
