//! Controller side of the control protocol.
//!
//! [`ControlServer`] accepts TCP connections and answers requests from a
//! shared [`Controller`]. Each connection gets its own task and session; a
//! request is answered completely before the next one on the same
//! connection is read.

pub mod controller;
pub mod mock;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::model::{ModuleAccessRequest, RegisterRequest};
use crate::network::codec::{DecodeError, EncodeError, WireDecode, WireEncode, WireReader};
use crate::network::frame::{read_frame, write_frame, FrameError, PROTOCOL_VERSION};
use crate::network::protocol::{
    pong_payload, version_payload, ControlRequest, ControlResponse, RequestType, ResponseStatus,
};
use crate::network::DEFAULT_MAX_FRAME_BYTES;
use crate::snapshot::{tree_depth, ConfigSnapshot, MAX_CONFIG_DEPTH};

pub use controller::{Controller, ControllerError};
pub use mock::MockController;
pub use session::{Session, SessionManager};

/// Server limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// A connection without requests for this long is closed.
    pub idle_timeout: Duration,
    /// Sending one response frame.
    pub write_timeout: Duration,
    /// Largest request body accepted.
    pub max_frame_bytes: u32,
    /// How often idle sessions are swept.
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

/// TCP front end for a [`Controller`].
pub struct ControlServer {
    listener: TcpListener,
    controller: Arc<dyn Controller>,
    sessions: SessionManager,
    config: ServerConfig,
}

impl ControlServer {
    /// Binds the listener. Use port 0 for an ephemeral port.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        controller: Arc<dyn Controller>,
        config: ServerConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Control server for '{}' listening on {}",
            controller.name(),
            listener.local_addr()?
        );
        Ok(Self {
            listener,
            controller,
            sessions: SessionManager::new(),
            config,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Session table shared with the connection tasks.
    #[must_use]
    pub fn sessions(&self) -> SessionManager {
        self.sessions.clone()
    }

    /// Runs the accept loop on a background task.
    pub fn spawn(self) -> std::io::Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let sessions = self.sessions.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(ServerHandle {
            local_addr,
            sessions,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Accept loop; returns once `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut cleanup_interval = interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer)) => {
                            let connection = Connection {
                                controller: Arc::clone(&self.controller),
                                sessions: self.sessions.clone(),
                                config: self.config.clone(),
                                shutdown: shutdown.clone(),
                            };
                            tokio::spawn(connection.serve(socket, peer));
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }

                _ = cleanup_interval.tick() => {
                    let removed = self.sessions.cleanup_expired_sessions().await;
                    if removed > 0 {
                        debug!("Expired {} idle sessions", removed);
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle to a spawned [`ControlServer`].
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    sessions: SessionManager,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session table.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Stops accepting, closes every connection and waits for the loop.
    pub async fn shutdown(self) {
        // Receivers only vanish once everything already stopped.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Control server task ended abnormally: {}", e);
        }
    }
}

struct Connection {
    controller: Arc<dyn Controller>,
    sessions: SessionManager,
    config: ServerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn serve(mut self, mut socket: TcpStream, peer: SocketAddr) {
        let session = self
            .sessions
            .create_session(peer, self.config.idle_timeout)
            .await;
        let span = info_span!("session", id = %session.id, %peer);

        async {
            info!("Client connected");
            self.request_loop(&mut socket, &session).await;
            self.sessions.remove_session(&session.id).await;
            info!("Client session closed");
        }
        .instrument(span)
        .await;
    }

    async fn request_loop(&mut self, socket: &mut TcpStream, session: &Session) {
        loop {
            let read = tokio::select! {
                _ = self.shutdown.changed() => break,
                read = timeout(
                    self.config.idle_timeout,
                    read_frame(socket, self.config.max_frame_bytes),
                ) => read,
            };

            let body = match read {
                Err(_) => {
                    info!("Idle timeout");
                    break;
                }
                Ok(Ok(None)) => {
                    debug!("Client disconnected");
                    break;
                }
                Ok(Ok(Some(body))) => body,
                Ok(Err(FrameError::UnsupportedVersion(version))) => {
                    warn!("Client speaks protocol version {}", version);
                    let reply = ControlResponse::new(
                        0,
                        ResponseStatus::VersionMismatch,
                        version_payload(PROTOCOL_VERSION),
                    );
                    self.send(socket, &reply).await;
                    break;
                }
                Ok(Err(e)) => {
                    warn!("Dropping connection: {}", e);
                    break;
                }
            };

            if !self.sessions.touch(&session.id).await {
                info!("Session expired");
                break;
            }

            let response = match ControlRequest::decode(&body) {
                Ok(request) => dispatch(self.controller.as_ref(), request).await,
                Err(e) => {
                    warn!("Failed to decode request: {}", e);
                    ControlResponse::error(
                        ControlRequest::peek_request_id(&body),
                        ResponseStatus::InvalidRequest,
                        format!("Failed to decode request: {e}"),
                    )
                }
            };

            if !self.send(socket, &response).await {
                break;
            }
        }
    }

    async fn send(&self, socket: &mut TcpStream, response: &ControlResponse) -> bool {
        match timeout(self.config.write_timeout, write_frame(socket, &response.encode())).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Failed to write response: {}", e);
                false
            }
            Err(_) => {
                error!("Timed out writing response");
                false
            }
        }
    }
}

enum Failure {
    Decode(DecodeError),
    Encode(EncodeError),
    Controller(ControllerError),
}

impl From<DecodeError> for Failure {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<EncodeError> for Failure {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<ControllerError> for Failure {
    fn from(value: ControllerError) -> Self {
        Self::Controller(value)
    }
}

/// Answers one request.
pub async fn dispatch(controller: &dyn Controller, request: ControlRequest) -> ControlResponse {
    let request_id = request.request_id;
    let kind = request.request_type.name();
    debug!(request_id, kind, "Handling request");

    match handle(controller, request).await {
        Ok(payload) => ControlResponse::success(request_id, payload),
        Err(Failure::Decode(e)) => {
            warn!(request_id, kind, "Malformed arguments: {}", e);
            ControlResponse::error(
                request_id,
                ResponseStatus::InvalidRequest,
                format!("malformed {kind} arguments: {e}"),
            )
        }
        Err(Failure::Encode(e)) => {
            warn!(request_id, kind, "Reply does not fit the wire format: {}", e);
            ControlResponse::error(
                request_id,
                ResponseStatus::InvalidRequest,
                format!("cannot encode {kind} reply: {e}"),
            )
        }
        Err(Failure::Controller(e)) => {
            debug!(request_id, kind, "Request failed: {}", e);
            let mut response = ControlResponse::error(request_id, e.status(), e.to_string());
            if let ControllerError::Hardware { fault, .. } = &e {
                match fault.to_bytes() {
                    Ok(payload) => response.payload = payload,
                    Err(e) => warn!(request_id, "Cannot encode hardware fault: {}", e),
                }
            }
            response
        }
    }
}

async fn handle(controller: &dyn Controller, request: ControlRequest) -> Result<Bytes, Failure> {
    let payload = request.payload;
    match request.request_type {
        RequestType::Ping => {
            WireReader::new(&payload).finish()?;
            Ok(pong_payload(&controller.name(), PROTOCOL_VERSION)?)
        }
        RequestType::ListCrates => {
            WireReader::new(&payload).finish()?;
            Ok(controller.crates().await?.to_bytes()?)
        }
        RequestType::CrateInfo => {
            let mut r = WireReader::new(&payload);
            let index = r.u8("crate index")?;
            r.finish()?;
            Ok(controller.crate_info(index).await?.to_bytes()?)
        }
        RequestType::ReadRegisters => {
            let args = RegisterRequest::from_bytes(&payload)?;
            Ok(controller.read_registers(&args).await?.to_bytes()?)
        }
        RequestType::ConfigDump => {
            let prefix = Option::<String>::from_bytes(&payload)?;
            // One copy of the whole tree, taken in one step.
            let tree = controller.config_tree().await?;
            if tree_depth(&tree) > MAX_CONFIG_DEPTH {
                return Err(EncodeError::TooDeep.into());
            }
            Ok(ConfigSnapshot::capture(Utc::now(), prefix, tree).to_bytes()?)
        }
        RequestType::ModuleAccess => {
            let args = ModuleAccessRequest::from_bytes(&payload)?;
            Ok(controller.module_access(&args).await?.to_bytes()?)
        }
    }
}
