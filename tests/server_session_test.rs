//! Connection lifetime on the server side, concurrent clients and the
//! blocking facade.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nurdctrl::server::{ControlServer, Controller, MockController, ServerConfig};
use nurdctrl::{
    BlockingCtrlClient, ClientConfig, ConnectionState, CtrlClient, ErrorKind, RegisterTarget,
};

#[tokio::test]
async fn test_close_releases_session() {
    let server = common::start(MockController::demo()).await;

    let mut client = common::connect(&server).await;
    common::wait_for_sessions(&server, 1).await;
    let sessions = server.sessions().sessions().await;
    assert_eq!(sessions[0].requests, 1);

    client.list_crates().await.unwrap();
    client.close().await;
    assert_eq!(client.state(), &ConnectionState::Disconnected);
    common::wait_for_sessions(&server, 0).await;

    // Closing twice is harmless.
    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_dropped_client_releases_session() {
    let server = common::start(MockController::demo()).await;

    let client = common::connect(&server).await;
    common::wait_for_sessions(&server, 1).await;
    drop(client);
    common::wait_for_sessions(&server, 0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_error_paths_release_session() {
    let mock = MockController::demo();
    let server = common::start(mock.clone()).await;
    let mut client = common::connect(&server).await;

    mock.set_response_delay(Duration::from_millis(300)).await;
    let _ = tokio::time::timeout(Duration::from_millis(20), client.list_crates()).await;
    assert!(client.list_crates().await.is_err());
    assert!(!client.is_connected());

    // The controller may still be busy with the abandoned request; once it
    // notices the hang-up the session goes away.
    mock.set_response_delay(Duration::ZERO).await;
    common::wait_for_sessions(&server, 0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_connections_are_closed() {
    let controller: Arc<dyn Controller> = Arc::new(MockController::demo());
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(150),
        cleanup_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let server = ControlServer::bind("127.0.0.1:0", controller, config)
        .await
        .unwrap()
        .spawn()
        .unwrap();

    let mut client = common::connect(&server).await;
    common::wait_for_sessions(&server, 1).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    common::wait_for_sessions(&server, 0).await;

    let err = client.list_crates().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(!client.is_connected());

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let server = common::start(MockController::demo()).await;
    let address = common::address_of(&server);
    let mut client = common::connect(&server).await;
    let sessions = server.sessions().clone();

    server.shutdown().await;
    // Connection tasks wind down on their own after the accept loop.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while sessions.session_count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = client.list_crates().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);

    let mut late = CtrlClient::new(ClientConfig::fast());
    let err = late.connect(&address).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn test_concurrent_clients_are_independent() {
    let server = common::start(MockController::demo()).await;
    let address = common::address_of(&server);

    let runs = (0..8u8).map(|i| {
        let address = address.clone();
        async move {
            let mut client = CtrlClient::connect_to(&address, ClientConfig::fast())
                .await
                .unwrap();
            let crates = client.list_crates().await.unwrap();
            let info = client.crate_info(i % 3).await.unwrap();
            let dump = client
                .dump_registers(RegisterTarget::global(2))
                .await
                .unwrap();
            let snapshot = client.dump_config(Some("crate.0")).await.unwrap();
            client.close().await;
            (crates, info.index, dump, snapshot.keys().count())
        }
    });
    let results = join_all(runs).await;

    let (crates, _, dump, keys) = &results[0];
    for (i, result) in results.iter().enumerate() {
        assert_eq!(&result.0, crates);
        assert_eq!(result.1, (i % 3) as u8);
        assert_eq!(&result.2, dump);
        assert_eq!(&result.3, keys);
    }
    common::wait_for_sessions(&server, 0).await;

    server.shutdown().await;
}

#[test]
fn test_blocking_client() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = runtime.block_on(common::start(MockController::demo()));
    let address = common::address_of(&server);

    let mut client = BlockingCtrlClient::new(ClientConfig::fast()).unwrap();
    assert_eq!(client.state(), &ConnectionState::Disconnected);
    client.connect(&address).unwrap();
    assert!(client.state().is_connected());

    assert_eq!(client.ping().unwrap().name, "demo");
    let crates = client.list_crates().unwrap();
    assert_eq!(crates.len(), 3);
    let info = client.crate_info(crates[2].index).unwrap();
    assert_eq!(info.label, "scaler");
    let dump = client
        .dump_registers(RegisterTarget::module(0, 0))
        .unwrap();
    assert_eq!(dump.get("firmware").unwrap().value(), Some(0x0a05));
    assert!(!client.dump_config(None).unwrap().is_empty());

    let err = client.crate_info(42).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    client.close();
    assert_eq!(client.state(), &ConnectionState::Disconnected);
    runtime.block_on(async {
        common::wait_for_sessions(&server, 0).await;
        server.shutdown().await;
    });
}
