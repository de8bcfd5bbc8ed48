//! Integration tests for `agentipc serve`, `send` and `check`.

use serial_test::serial;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn agentipc(home: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_agentipc"));
    cmd.arg("--config")
        .arg(home.path().join("ipc.json"))
        .arg("--socket-dir")
        .arg(home.path().join("ipc"))
        .env_remove("RUST_LOG");
    cmd
}

fn start_serve(home: &TempDir, names: &[&str]) -> Child {
    let mut cmd = agentipc(home);
    cmd.arg("serve");
    for name in names {
        cmd.args(["--name", name]);
    }
    cmd.stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to start agent")
}

fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        thread::sleep(Duration::from_millis(20));
    }
}

fn send(home: &TempDir, name: &str, payload: &str) -> Output {
    agentipc(home)
        .args(["send", name, payload])
        .output()
        .expect("Failed to run send")
}

fn wait_for_exit(child: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            assert!(status.success(), "agent exited with {status}");
            return;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("agent did not stop");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
#[serial]
fn test_serve_send_shutdown() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join("ipc");
    let mut agent = start_serve(&home, &["alpha", "beta"]);

    wait_for_socket(&dir.join("sock-control"));
    assert!(dir.join("sock-alpha").exists());
    assert!(dir.join("sock-beta").exists());

    let output = send(&home, "alpha", "hello");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");

    let output = send(&home, "control", "ping");
    assert_eq!(String::from_utf8_lossy(&output.stdout), "pong\n");

    // The reply can lose the race against the shutdown it triggers
    let output = send(&home, "control", "shutdown");
    assert!(output.status.success());

    wait_for_exit(&mut agent);
    assert!(!dir.exists(), "socket directory removed on shutdown");
}

#[test]
#[serial]
fn test_send_json_without_agent_fails() {
    let home = tempfile::tempdir().unwrap();

    let output = agentipc(&home)
        .args(["--json", "send", "alpha", "hello"])
        .output()
        .expect("Failed to run send");
    assert!(!output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["ok"], false);
    assert_eq!(json["server"], "alpha");
    assert!(json["error"].is_string());
}

#[test]
#[serial]
fn test_check_json() {
    let home = tempfile::tempdir().unwrap();

    let output = agentipc(&home)
        .args(["--json", "check"])
        .output()
        .expect("Failed to run check");
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["exists"], false);
    assert_eq!(json["secure"], true);
    assert_eq!(json["dir_mode"], "owner");
}

#[test]
#[serial]
fn test_config_save_round_trip() {
    let home = tempfile::tempdir().unwrap();

    let output = agentipc(&home)
        .args(["config", "--save"])
        .output()
        .expect("Failed to run config");
    assert!(output.status.success());

    let written = std::fs::read_to_string(home.path().join("ipc.json")).unwrap();
    assert!(written.contains(r#""type": "unix-socket""#));
    assert!(written.contains("socket-dir"));
}
