//! CLI integration tests driving the compiled `ragdock` binary.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn ragdock_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ragdock");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_path = config_dir.join("ragdock.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[db]
path = "{}/data/ragdock.sqlite"

[server]
bind = "127.0.0.1:0"
"#,
            root.display()
        ),
    )
    .unwrap();

    (tmp, config_path)
}

fn run(config: &PathBuf, args: &[&str]) -> std::process::Output {
    Command::new(ragdock_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run ragdock binary")
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();

    let output = run(&config, &["init"]);
    assert!(
        output.status.success(),
        "init failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let db_path = tmp.path().join("data").join("ragdock.sqlite");
    assert!(db_path.exists());

    // Idempotent
    let output = run(&config, &["init"]);
    assert!(output.status.success());
}

#[test]
fn test_user_add_prints_id_and_rejects_duplicates() {
    let (_tmp, config) = setup_test_env();
    assert!(run(&config, &["init"]).status.success());

    let output = run(&config, &["user", "add", "alice", "--role", "admin"]);
    assert!(
        output.status.success(),
        "user add failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("admin 'alice'"));

    let output = run(&config, &["user", "add", "alice"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));
}

#[test]
fn test_user_add_rejects_unknown_role() {
    let (_tmp, config) = setup_test_env();
    assert!(run(&config, &["init"]).status.success());

    let output = run(&config, &["user", "add", "bob", "--role", "superuser"]);
    assert!(!output.status.success());
}

#[test]
fn test_cache_stats_on_empty_database() {
    let (_tmp, config) = setup_test_env();
    assert!(run(&config, &["init"]).status.success());

    let output = run(&config, &["cache", "stats"]);
    assert!(
        output.status.success(),
        "cache stats failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Entries:   0"));
}
