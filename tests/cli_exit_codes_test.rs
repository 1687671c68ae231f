//! The command-line tool: output on stdout, one exit code per error kind.

mod common;

use std::process::Output;
use std::time::Duration;

use nurdctrl::model::{HardwareFault, RegisterScope};
use nurdctrl::server::MockController;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::process::Command;

async fn nurdctrl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_nurdctrl"))
        .args(args)
        .env("NURDCTRL_LOGGING__LEVEL", "error")
        .env("NURDCTRL_CLIENT__READ_TIMEOUT_MS", "2000")
        .output()
        .await
        .expect("run nurdctrl")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_commands_exit_zero() {
    let server = common::start(MockController::demo()).await;
    let host = server.local_addr().to_string();

    let out = nurdctrl(&["list-crates", &host]).await;
    assert_eq!(out.status.code(), Some(0));
    let text = stdout(&out);
    assert!(text.starts_with("Crate[0] = main\n"));
    assert!(text.contains("Crate[2] = scaler\n"));

    let out = nurdctrl(&["crate-info", &host, "1"]).await;
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("GSI_TRIDI"));

    let out = nurdctrl(&["dump-config", &host, "crate.2", "--flat"]).await;
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("crate.2.acvt = "));

    let out = nurdctrl(&["--json", "dump-registers", &host, "0", "0", "firmware"]).await;
    assert_eq!(out.status.code(), Some(0));
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["readings"][0]["name"], "firmware");
    assert_eq!(json["readings"][0]["values"][0], 0x0a05);

    let out = nurdctrl(&["module-access", &host, "2", "0", "0x1108:16:0x3", "0x1108:16"]).await;
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("-> 0x0003"));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_error_kinds_map_to_exit_codes() {
    let mock = MockController::demo();
    let server = common::start(mock.clone()).await;
    let host = server.local_addr().to_string();

    let out = nurdctrl(&["crate-info", &host, "99"]).await;
    assert_eq!(out.status.code(), Some(4));
    assert!(out.stdout.is_empty());

    let out = nurdctrl(&["dump-registers", &host, "0", "0", "BADREG"]).await;
    assert_eq!(out.status.code(), Some(5));

    mock.inject_fault(0, RegisterScope::Crate, "dead_time", HardwareFault::BusError)
        .await;
    let out = nurdctrl(&["dump-registers", &host, "0", "global"]).await;
    assert_eq!(out.status.code(), Some(6));

    let closed = format!("127.0.0.1:{}", common::closed_port().await);
    let out = nurdctrl(&["list-crates", &closed]).await;
    assert_eq!(out.status.code(), Some(2));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_protocol_failure_exit_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    });

    let out = nurdctrl(&["ping", &host]).await;
    assert_eq!(out.status.code(), Some(3));
}

#[tokio::test]
async fn test_usage_errors_exit_64() {
    let out = nurdctrl(&["dump-registers", "localhost", "zero"]).await;
    assert_eq!(out.status.code(), Some(64));

    let out = nurdctrl(&["list-crates", "http://daq01"]).await;
    assert_eq!(out.status.code(), Some(64));

    let out = nurdctrl(&["--config", "/nonexistent/nurdctrl.toml", "list-crates", "daq01"]).await;
    assert_eq!(out.status.code(), Some(64));

    let out = nurdctrl(&["--help"]).await;
    assert_eq!(out.status.code(), Some(0));
}
