use assert_cmd::Command;
use predicates::prelude::*;
use runner::{ContainerConfig, ContainerRecord, FileStore};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

struct Sandbox {
    storage: TempDir,
    config: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let sandbox = Self {
            storage: TempDir::new().unwrap(),
            config: TempDir::new().unwrap(),
        };
        FileStore::new(sandbox.storage.path())
            .insert(ContainerRecord {
                id: "9d1e7b".to_string(),
                name: "working-container".to_string(),
                rootfs: PathBuf::from("/var/lib/kiln/rootfs/9d1e7b"),
                config: ContainerConfig::default(),
                history: vec![],
            })
            .unwrap();
        sandbox
    }

    fn kilnctl(&self) -> Command {
        let mut cmd = Command::cargo_bin("kilnctl").unwrap();
        cmd.env_clear()
            .env("KILN_RUNTIME", "stub")
            .env("KILN_STORAGE_ROOT", self.storage.path())
            .env("KILN_CONFIG_DIR", self.config.path());
        cmd
    }

    fn history_json(&self) -> serde_json::Value {
        let output = self
            .kilnctl()
            .args(["history", "--json", "working-container"])
            .output()
            .unwrap();
        assert!(output.status.success());
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

#[test]
fn given_add_history_when_run_succeeds_then_history_shows_command() {
    let sandbox = Sandbox::new();

    sandbox
        .kilnctl()
        .args(["run", "--add-history", "working-container", "--", "echo", "hi"])
        .assert()
        .success();

    let history = sandbox.history_json();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["createdBy"], "/bin/sh -c echo hi");
    assert_eq!(history[0]["shell"], "/bin/sh -c");
}

#[test]
fn given_failing_command_when_run_then_exit_code_is_propagated_and_no_history() {
    let sandbox = Sandbox::new();

    sandbox
        .kilnctl()
        .env("KILN_STUB_EXIT_CODE", "3")
        .args(["run", "--add-history", "working-container", "false"])
        .assert()
        .code(3);

    assert_eq!(sandbox.history_json(), serde_json::json!([]));
}

#[test]
fn given_unknown_container_when_run_then_exit_125() {
    let sandbox = Sandbox::new();

    sandbox
        .kilnctl()
        .args(["run", "ghost", "true"])
        .assert()
        .code(125)
        .stderr(predicate::str::contains("container not found"));
}

#[test]
fn given_no_command_when_run_then_usage_error() {
    let sandbox = Sandbox::new();

    sandbox
        .kilnctl()
        .args(["run", "working-container", "--"])
        .assert()
        .code(125)
        .stderr(predicate::str::contains("command must be specified"));
}

#[test]
fn given_conflicting_network_flags_when_run_then_rejected() {
    let sandbox = Sandbox::new();

    sandbox
        .kilnctl()
        .args(["run", "--net", "host", "--network", "private", "working-container", "true"])
        .assert()
        .code(125)
        .stderr(predicate::str::contains("contradicts"));
}

#[test]
fn given_defaults_file_with_history_shell_when_run_then_it_is_recorded() {
    let sandbox = Sandbox::new();
    fs::write(
        sandbox.config.path().join("kiln.json"),
        r#"{ "defaultShell": ["/bin/ash", "-c"] }"#,
    )
    .unwrap();

    sandbox
        .kilnctl()
        .env("KILN_HISTORY", "1")
        .args(["run", "working-container", "ls", "-la"])
        .assert()
        .success();

    let history = sandbox.history_json();
    assert_eq!(history[0]["createdBy"], "/bin/ash -c ls -la");
}

#[test]
fn given_invalid_defaults_file_when_run_then_exit_125() {
    let sandbox = Sandbox::new();
    fs::write(sandbox.config.path().join("kiln.json"), r#"{ "shell": "bash" }"#).unwrap();

    sandbox
        .kilnctl()
        .args(["run", "working-container", "true"])
        .assert()
        .code(125)
        .stderr(predicate::str::contains("Failed to load defaults"));
}

#[test]
fn given_empty_history_when_history_then_message() {
    let sandbox = Sandbox::new();

    sandbox
        .kilnctl()
        .args(["history", "working-container"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No history recorded for working-container"));
}

#[test]
fn version_prints_package_version() {
    Command::cargo_bin("kilnctl")
        .unwrap()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
