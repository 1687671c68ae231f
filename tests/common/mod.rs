//! Shared fixtures: an in-process control server on an ephemeral port.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nurdctrl::server::{ControlServer, Controller, MockController, ServerConfig, ServerHandle};
use nurdctrl::{ClientConfig, ControllerAddress, CtrlClient};
use tokio::net::TcpListener;

/// Spawns a server for `mock` on 127.0.0.1.
pub async fn start(mock: MockController) -> ServerHandle {
    let controller: Arc<dyn Controller> = Arc::new(mock);
    ControlServer::bind("127.0.0.1:0", controller, ServerConfig::default())
        .await
        .expect("bind control server")
        .spawn()
        .expect("spawn control server")
}

/// Address a client should dial for `handle`.
pub fn address_of(handle: &ServerHandle) -> ControllerAddress {
    ControllerAddress::parse(&handle.local_addr().to_string()).expect("loopback address")
}

/// Connected client with short deadlines.
pub async fn connect(handle: &ServerHandle) -> CtrlClient {
    CtrlClient::connect_to(&address_of(handle), ClientConfig::fast())
        .await
        .expect("connect to control server")
}

/// Waits until the server tracks exactly `expected` sessions.
pub async fn wait_for_sessions(handle: &ServerHandle, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let count = handle.sessions().session_count().await;
        if count == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {expected} sessions, server still has {count}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let port = listener.local_addr().expect("probe address").port();
    drop(listener);
    port
}
