//! Control client for a readout controller.
//!
//! A [`CtrlClient`] owns at most one TCP connection and runs at most one
//! request on it at a time:
//!
//! ```text
//! Disconnected ──connect()──> Connected
//!      ▲                          │
//!      │        close() / drop / I/O error / protocol error / timeout
//!      └──────────────────────────┘
//! ```
//!
//! Controller-reported failures (unknown crate, unknown register, hardware
//! fault) leave the connection usable. Everything else closes it.
//!
//! # Example
//!
//! ```no_run
//! use nurdctrl::client::{ClientConfig, CtrlClient};
//! use nurdctrl::client::address::ControllerAddress;
//!
//! # async fn run() -> nurdctrl::error::CtrlResult<()> {
//! let mut client = CtrlClient::new(ClientConfig::default());
//! client.connect(&ControllerAddress::parse("daq-vme01")?).await?;
//! for summary in client.list_crates().await? {
//!     let info = client.crate_info(summary.index).await?;
//!     println!("{info}");
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod blocking;

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{CtrlError, CtrlResult};
use crate::model::{
    AccessOp, CrateIndex, CrateInfo, CrateSummary, HardwareFault, ModuleAccessRequest,
    RegisterDump, RegisterRequest, RegisterSelection, RegisterTarget,
};
use crate::network::codec::{WireDecode, WireEncode};
use crate::network::frame::{read_frame, write_frame, FrameError, PROTOCOL_VERSION};
use crate::network::protocol::{self, ControlRequest, ControlResponse, RequestType, ResponseStatus};
use crate::network::DEFAULT_MAX_FRAME_BYTES;
use crate::snapshot::ConfigSnapshot;

use address::ControllerAddress;

/// Timeouts and limits for one client.
///
/// Every network step has a finite deadline; none of them can be disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Name resolution plus TCP connect.
    pub connect_timeout: Duration,
    /// Sending one request frame.
    pub write_timeout: Duration,
    /// Waiting for one complete response frame.
    pub read_timeout: Duration,
    /// Largest response body accepted.
    pub max_frame_bytes: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    /// Short deadlines for controllers on the local host.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Connection state of a [`CtrlClient`].
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,

    /// Connected and handshaken.
    Connected {
        /// Address as given by the caller.
        address: ControllerAddress,
        /// Resolved socket address.
        peer: SocketAddr,
        /// Time when connection was established
        connected_at: Instant,
    },
}

impl ConnectionState {
    /// Returns true if connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Returns a short status label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connected { .. } => "Connected",
        }
    }
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        // Compare variants without comparing Instant fields
        match (self, other) {
            (Self::Disconnected, Self::Disconnected) => true,
            (Self::Connected { peer: a, .. }, Self::Connected { peer: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// What the controller reported during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerInfo {
    /// Controller name.
    pub name: String,
    /// Protocol version it speaks.
    pub protocol_version: u16,
}

/// Asynchronous control client.
///
/// Every operation takes `&mut self`, so one connection never carries two
/// requests at once. Use one client per task for parallel queries.
#[derive(Debug)]
pub struct CtrlClient {
    config: ClientConfig,
    state: ConnectionState,
    stream: Option<TcpStream>,
    controller: Option<ControllerInfo>,
    next_request_id: u32,
    /// Set while a request is on the wire; survives a dropped future.
    in_flight: Option<u32>,
}

impl CtrlClient {
    /// A disconnected client.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            stream: None,
            controller: None,
            next_request_id: 1,
            in_flight: None,
        }
    }

    /// Creates a client and connects it.
    pub async fn connect_to(address: &ControllerAddress, config: ClientConfig) -> CtrlResult<Self> {
        let mut client = Self::new(config);
        client.connect(address).await?;
        Ok(client)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Returns true if connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Handshake result of the current connection.
    #[must_use]
    pub fn controller(&self) -> Option<&ControllerInfo> {
        self.controller.as_ref()
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolves `address`, connects, and checks the protocol version.
    ///
    /// An existing connection is closed first. On failure the client is
    /// left `Disconnected` with nothing allocated.
    #[instrument(skip(self, address), fields(controller = %address))]
    pub async fn connect(&mut self, address: &ControllerAddress) -> CtrlResult<()> {
        if self.stream.is_some() {
            self.close().await;
        }

        let (stream, peer) = self.open(address).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }
        self.stream = Some(stream);
        self.in_flight = None;
        self.state = ConnectionState::Connected {
            address: address.clone(),
            peer,
            connected_at: Instant::now(),
        };

        let controller = match self.ping().await {
            Ok(controller) => controller,
            Err(e) => {
                // Whatever the controller answered, the handshake failed.
                self.close().await;
                return Err(e);
            }
        };
        info!(
            peer = %peer,
            name = %controller.name,
            "connected to controller"
        );
        Ok(())
    }

    async fn open(&self, address: &ControllerAddress) -> CtrlResult<(TcpStream, SocketAddr)> {
        let deadline = self.config.connect_timeout;
        let resolved = match timeout(deadline, lookup_host((address.host(), address.port()))).await {
            Err(_) => {
                return Err(CtrlError::Timeout {
                    stage: "resolving host",
                    after: deadline,
                })
            }
            Ok(Err(e)) => {
                debug!("lookup of {} failed: {e}", address.host());
                return Err(CtrlError::Unresolved(address.host().to_string()));
            }
            Ok(Ok(addrs)) => addrs.collect::<Vec<_>>(),
        };
        if resolved.is_empty() {
            return Err(CtrlError::Unresolved(address.host().to_string()));
        }

        let mut last_error = None;
        for peer in resolved {
            match timeout(deadline, TcpStream::connect(peer)).await {
                Ok(Ok(stream)) => return Ok((stream, peer)),
                Ok(Err(e)) => {
                    debug!(%peer, "connect failed: {e}");
                    last_error = Some(CtrlError::io(format!("connecting to {address}"), e));
                }
                Err(_) => {
                    debug!(%peer, "connect timed out");
                    last_error = Some(CtrlError::Timeout {
                        stage: "connecting",
                        after: deadline,
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CtrlError::Unresolved(address.host().to_string())))
    }

    /// Shuts the connection down. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("shutdown failed: {e}");
            }
            info!("connection closed");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.stream = None;
        self.controller = None;
        self.in_flight = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Liveness and version check.
    #[instrument(skip(self))]
    pub async fn ping(&mut self) -> CtrlResult<ControllerInfo> {
        let body = self.exchange(RequestType::Ping, Bytes::new()).await;
        let decoded = body.and_then(|b| protocol::decode_pong(&b).map_err(CtrlError::from));
        let (protocol_version, name) = self.settle(decoded)?;
        if protocol_version != PROTOCOL_VERSION {
            return self.protocol_failure(format!(
                "controller '{name}' speaks protocol version {protocol_version}, this client speaks {PROTOCOL_VERSION}"
            ));
        }
        let info = ControllerInfo {
            name,
            protocol_version,
        };
        self.controller = Some(info.clone());
        Ok(info)
    }

    /// Enumerates the crates the controller currently manages.
    #[instrument(skip(self))]
    pub async fn list_crates(&mut self) -> CtrlResult<Vec<CrateSummary>> {
        self.call(RequestType::ListCrates, Bytes::new()).await
    }

    /// Detailed description of one crate.
    #[instrument(skip(self))]
    pub async fn crate_info(&mut self, index: CrateIndex) -> CtrlResult<CrateInfo> {
        let info: CrateInfo = self
            .call(RequestType::CrateInfo, Bytes::copy_from_slice(&[index]))
            .await?;
        if info.index != index {
            return self.protocol_failure(format!(
                "asked for crate {index}, controller described crate {}",
                info.index
            ));
        }
        Ok(info)
    }

    /// Point-in-time dump of the configuration tree.
    ///
    /// With a prefix, only entries whose flattened key starts with it are
    /// returned, together with their enclosing blocks.
    #[instrument(skip(self))]
    pub async fn dump_config(&mut self, prefix: Option<&str>) -> CtrlResult<ConfigSnapshot> {
        let prefix = prefix.filter(|p| !p.is_empty()).map(str::to_owned);
        self.call(RequestType::ConfigDump, prefix.to_bytes()?).await
    }

    /// Reads the selected registers of one crate, module or sub-module.
    #[instrument(skip(self, request), fields(target = %request.target, selection = %request.selection))]
    pub async fn read_registers(&mut self, request: &RegisterRequest) -> CtrlResult<RegisterDump> {
        let dump: RegisterDump = self
            .call(RequestType::ReadRegisters, request.to_bytes()?)
            .await?;
        if dump.target != request.target {
            return self.protocol_failure(format!(
                "asked for {}, controller answered for {}",
                request.target, dump.target
            ));
        }
        if dump.is_empty() && request.selection != RegisterSelection::All {
            return self.protocol_failure(format!(
                "controller returned no value for register {}",
                request.selection
            ));
        }
        Ok(dump)
    }

    /// Reads every register of the target.
    pub async fn dump_registers(&mut self, target: RegisterTarget) -> CtrlResult<RegisterDump> {
        self.read_registers(&RegisterRequest {
            target,
            selection: RegisterSelection::All,
        })
        .await
    }

    /// Raw reads and writes; returns one value per read, in request order.
    #[instrument(skip(self, request), fields(target = %request.target, count = request.accesses.len()))]
    pub async fn module_access(&mut self, request: &ModuleAccessRequest) -> CtrlResult<Vec<u32>> {
        let values: Vec<u32> = self
            .call(RequestType::ModuleAccess, request.to_bytes()?)
            .await?;
        let reads = request
            .accesses
            .iter()
            .filter(|a| a.op == AccessOp::Read)
            .count();
        if values.len() != reads {
            return self.protocol_failure(format!(
                "expected {reads} read values, controller returned {}",
                values.len()
            ));
        }
        Ok(values)
    }

    async fn call<T: WireDecode>(&mut self, request_type: RequestType, payload: Bytes) -> CtrlResult<T> {
        let body = self.exchange(request_type, payload).await;
        let decoded = body.and_then(|b| T::from_bytes(&b).map_err(CtrlError::from));
        self.settle(decoded)
    }

    /// Closes the connection if `result` is a connection or protocol error.
    fn settle<T>(&mut self, result: CtrlResult<T>) -> CtrlResult<T> {
        if let Err(e) = &result {
            if e.closes_connection() && self.stream.is_some() {
                warn!(kind = e.kind().label(), "closing connection: {e}");
                self.reset();
            }
        }
        result
    }

    fn protocol_failure<T>(&mut self, message: String) -> CtrlResult<T> {
        self.settle(Err(CtrlError::Protocol(message)))
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    /// One request/response round trip, mapped to the controller's verdict.
    async fn exchange(&mut self, request_type: RequestType, payload: Bytes) -> CtrlResult<Bytes> {
        if let Some(abandoned) = self.in_flight {
            return Err(CtrlError::Protocol(format!(
                "request {abandoned} was abandoned before its response arrived"
            )));
        }
        if self.stream.is_none() {
            return Err(CtrlError::NotConnected);
        }

        let request = ControlRequest::new(self.next_id(), request_type, payload);
        self.in_flight = Some(request.request_id);
        debug!(
            request_id = request.request_id,
            kind = request_type.name(),
            "sending request"
        );

        let config = &self.config;
        let Some(stream) = self.stream.as_mut() else {
            return Err(CtrlError::NotConnected);
        };
        let response = round_trip(stream, config, &request).await?;
        self.in_flight = None;

        debug!(
            request_id = response.request_id,
            status = ?response.status,
            bytes = response.payload.len(),
            "response received"
        );
        into_payload(request_type, response)
    }
}

async fn round_trip(
    stream: &mut TcpStream,
    config: &ClientConfig,
    request: &ControlRequest,
) -> CtrlResult<ControlResponse> {
    match timeout(config.write_timeout, write_frame(stream, &request.encode())).await {
        Err(_) => {
            return Err(CtrlError::Timeout {
                stage: "sending request",
                after: config.write_timeout,
            })
        }
        Ok(Err(FrameError::Io(e))) => return Err(CtrlError::io("sending request", e)),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(())) => {}
    }

    let body = match timeout(config.read_timeout, read_frame(stream, config.max_frame_bytes)).await {
        Err(_) => {
            return Err(CtrlError::Timeout {
                stage: "waiting for response",
                after: config.read_timeout,
            })
        }
        Ok(Ok(Some(body))) => body,
        Ok(Ok(None)) => {
            return Err(CtrlError::io(
                "waiting for response",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "controller closed the connection",
                ),
            ))
        }
        Ok(Err(e)) => return Err(e.into()),
    };

    let response = ControlResponse::decode(&body)?;
    if response.request_id != request.request_id {
        return Err(CtrlError::Protocol(format!(
            "response to request {} arrived for request {}",
            response.request_id, request.request_id
        )));
    }
    Ok(response)
}

fn into_payload(request_type: RequestType, response: ControlResponse) -> CtrlResult<Bytes> {
    let message = response.error_message;
    match response.status {
        ResponseStatus::Success => Ok(response.payload),
        ResponseStatus::NotFound => Err(CtrlError::NotFound(message)),
        ResponseStatus::RegisterError => Err(CtrlError::Register(message)),
        ResponseStatus::HardwareError => {
            let fault = HardwareFault::from_bytes(&response.payload)?;
            Err(CtrlError::Hardware { fault, message })
        }
        ResponseStatus::InvalidRequest => Err(CtrlError::Protocol(format!(
            "controller rejected {} request: {message}",
            request_type.name()
        ))),
        ResponseStatus::VersionMismatch => {
            let theirs = match response.payload.as_ref() {
                [lo, hi] => u16::from_le_bytes([*lo, *hi]).to_string(),
                _ => "unknown".to_string(),
            };
            Err(CtrlError::Protocol(format!(
                "controller speaks protocol version {theirs}, this client speaks {PROTOCOL_VERSION}"
            )))
        }
    }
}
