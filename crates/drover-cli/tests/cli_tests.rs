use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let data_root = dir.join("data");
    fs::create_dir_all(&data_root).unwrap();
    let config_path = dir.join("config.toml");
    fs::write(
        &config_path,
        format!(
            r#"
data_root = "{}"
scheduler = "local"

[manager]
poll_interval_ms = 1
idle_budget_ms = 1
"#,
            data_root.display()
        ),
    )
    .unwrap();
    config_path
}

fn drover() -> Command {
    Command::cargo_bin("drover").unwrap()
}

#[test]
fn test_status_with_no_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    drover()
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded."));
}

#[test]
fn test_status_unknown_run_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    drover()
        .arg("--config")
        .arg(&config)
        .arg("status")
        .arg("deadbeef")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No run matches"));
}

#[test]
fn test_check_runs_on_empty_root() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    drover()
        .arg("--config")
        .arg(&config)
        .arg("check-runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("Checked 0 run(s)"));
}

#[test]
fn test_purge_sandboxes_with_nothing_to_do() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    drover()
        .arg("--config")
        .arg(&config)
        .arg("purge-sandboxes")
        .arg("--older-than-days")
        .arg("7")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sandboxes older than 7 day(s)."));
}

#[test]
fn test_manager_quit_idle_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    drover()
        .arg("--config")
        .arg(&config)
        .arg("manager")
        .arg("--quit-idle")
        .env("XDG_CACHE_HOME", dir.path().join("cache"))
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();
}

#[test]
fn test_missing_config_is_reported() {
    drover()
        .arg("--config")
        .arg("/nonexistent/drover.toml")
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration file not found"));
}
