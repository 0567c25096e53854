//! CLI argument parsing and no-container-found error paths (spec.md §6).
//! None of these require root or namespace support.

use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_craterun"))
}

#[test]
fn cli_help_works() {
    let output = bin().arg("--help").output().expect("failed to execute craterun --help");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("craterun"), "help output should mention craterun");
    for sub in ["create", "start", "run", "exec", "kill", "delete", "state", "list", "spec"] {
        assert!(stdout.contains(sub), "help output should list `{sub}`");
    }
}

#[test]
fn cli_create_requires_bundle() {
    let output = bin()
        .args(["create", "some-id"])
        .output()
        .expect("failed to execute craterun create");
    assert!(!output.status.success(), "create without a bundle arg should fail to parse");
}

#[test]
fn cli_exec_requires_a_command() {
    let output = bin()
        .args(["exec", "some-id"])
        .output()
        .expect("failed to execute craterun exec");
    assert!(!output.status.success(), "exec without a trailing command should fail to parse");
}

#[test]
fn cli_list_empty_state_root() {
    let tmp = tempfile::tempdir().unwrap();
    let output = bin()
        .args(["--root", tmp.path().to_str().unwrap(), "list"])
        .output()
        .expect("failed to execute craterun list");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ID"), "list should still print a header");
}

#[test]
fn cli_list_json_empty_is_empty_array() {
    let tmp = tempfile::tempdir().unwrap();
    let output = bin()
        .args(["--root", tmp.path().to_str().unwrap(), "list", "-f", "json"])
        .output()
        .expect("failed to execute craterun list -f json");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).expect("list -f json should emit valid JSON");
    assert_eq!(value.as_array().map(|a| a.len()), Some(0));
}

#[test]
fn cli_state_nonexistent_id_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let output = bin()
        .args(["--root", tmp.path().to_str().unwrap(), "state", "deadbeef"])
        .output()
        .expect("failed to execute craterun state");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("no container found"),
        "should report no container found, got: {stderr}"
    );
}

#[test]
fn cli_delete_nonexistent_id_is_a_no_op() {
    // spec.md §4.1/§8: "Missing-container delete is a no-op" / "Delete(id)
    // followed by Delete(id) both return without error."
    let tmp = tempfile::tempdir().unwrap();
    let output = bin()
        .args(["--root", tmp.path().to_str().unwrap(), "delete", "deadbeef"])
        .output()
        .expect("failed to execute craterun delete");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn cli_kill_nonexistent_id_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let output = bin()
        .args(["--root", tmp.path().to_str().unwrap(), "kill", "deadbeef", "TERM"])
        .output()
        .expect("failed to execute craterun kill");

    assert!(!output.status.success());
}

#[test]
fn cli_spec_writes_config_json() {
    let tmp = tempfile::tempdir().unwrap();
    let output = bin()
        .arg("spec")
        .current_dir(tmp.path())
        .output()
        .expect("failed to execute craterun spec");

    assert!(output.status.success());
    let config_path = tmp.path().join("config.json");
    assert!(config_path.exists(), "spec should write config.json in the cwd");

    let data = std::fs::read_to_string(&config_path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(value["ociVersion"], "1.0.2");
    assert_eq!(value["root"]["path"], "rootfs");
}

#[test]
fn cli_spec_rootless_adds_user_namespace() {
    let tmp = tempfile::tempdir().unwrap();
    let output = bin()
        .args(["spec", "--rootless"])
        .current_dir(tmp.path())
        .output()
        .expect("failed to execute craterun spec --rootless");

    assert!(output.status.success());
    let data = std::fs::read_to_string(tmp.path().join("config.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&data).unwrap();
    let namespaces = value["linux"]["namespaces"].as_array().unwrap();
    assert!(namespaces.iter().any(|ns| ns["type"] == "user"));
    assert!(!value["linux"]["uidMappings"].as_array().unwrap().is_empty());
}
