//! CLI integration tests

use std::process::{Command, Output};

fn fleetctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fleetctl"))
        .args(args)
        .env_remove("FLEET_API_URL")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = fleetctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(
        stdout.contains("GPU Fleet Control Plane"),
        "Should show app name"
    );
    assert!(stdout.contains("nodes"), "Should show nodes command");
    assert!(stdout.contains("health"), "Should show health command");
    assert!(stdout.contains("alerts"), "Should show alerts command");
    assert!(stdout.contains("allocate"), "Should show allocate command");
    assert!(stdout.contains("release"), "Should show release command");
    assert!(stdout.contains("allocations"), "Should show allocations command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = fleetctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("fleetctl"), "Should show binary name");
}

#[test]
fn test_nodes_subcommands() {
    let output = fleetctl(&["nodes", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Nodes help should succeed");
    for cmd in [
        "list",
        "show",
        "provision",
        "drain",
        "maintenance",
        "ready",
        "offline",
        "decommission",
    ] {
        assert!(stdout.contains(cmd), "Should show {} subcommand", cmd);
    }
}

#[test]
fn test_nodes_provision_help() {
    let output = fleetctl(&["nodes", "provision", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Provision help should succeed");
    assert!(stdout.contains("--hostname"), "Should show hostname option");
    assert!(stdout.contains("--address"), "Should show address option");
    assert!(
        stdout.contains("--instance-type"),
        "Should show instance-type option"
    );
    assert!(stdout.contains("--gpu-count"), "Should show gpu-count option");
    assert!(stdout.contains("--region"), "Should show region option");
    assert!(stdout.contains("--tag"), "Should show tag option");
}

#[test]
fn test_nodes_decommission_help() {
    let output = fleetctl(&["nodes", "decommission", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Decommission help should succeed");
    assert!(stdout.contains("--force"), "Should show force option");
    assert!(stdout.contains("--yes"), "Should show yes option");
}

#[test]
fn test_allocate_help() {
    let output = fleetctl(&["allocate", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Allocate help should succeed");
    assert!(stdout.contains("--job"), "Should show job option");
    assert!(stdout.contains("--gpus"), "Should show gpus option");
    assert!(stdout.contains("--min-vram"), "Should show min-vram option");
    assert!(stdout.contains("--priority"), "Should show priority option");
}

/// Test format option
#[test]
fn test_format_option() {
    let output = fleetctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("table"), "Should show table format");
    assert!(stdout.contains("json"), "Should show json format");
}

/// Test api-url option
#[test]
fn test_api_url_option() {
    let output = fleetctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--api-url"), "Should show api-url option");
    assert!(stdout.contains("FLEET_API_URL"), "Should show env var");
}

#[test]
fn test_invalid_priority() {
    let output = fleetctl(&["allocate", "--job", "train", "--gpus", "2", "--priority", "urgent"]);
    assert!(!output.status.success(), "Unknown priority should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("urgent"), "Should name the rejected value");
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = fleetctl(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}

/// Test missing required argument error handling
#[test]
fn test_missing_argument() {
    let output = fleetctl(&["release"]);
    assert!(!output.status.success(), "Missing argument should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

#[test]
fn test_unreachable_server_fails() {
    let output = fleetctl(&["--api-url", "http://127.0.0.1:1", "health"]);
    assert!(!output.status.success(), "Unreachable server should fail");
}
