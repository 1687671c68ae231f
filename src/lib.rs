//! # nurdctrl
//!
//! Control client for a running nurdlib readout controller.
//!
//! A controller process listens on a TCP port and answers read-only
//! introspection requests: which crates exist, what each crate contains, the
//! configuration it is currently running with, and the live values of module
//! registers. This crate speaks that protocol from the client side and ships a
//! small in-process server with a mock controller for testing.
//!
//! ## Crate Structure
//!
//! - **`client`**: [`CtrlClient`], the async connection state machine, plus a
//!   blocking facade and controller address parsing.
//! - **`config`**: Layered settings (defaults, TOML file, `NURDCTRL_*`
//!   environment) loaded with `figment`.
//! - **`error`**: [`CtrlError`] and the [`ErrorKind`] taxonomy the CLI maps to
//!   exit codes.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`model`**: Crates, modules, register shapes and readings.
//! - **`network`**: Framing, the binary codec and request/response envelopes.
//! - **`server`**: The controller side: [`server::Controller`] trait, the TCP
//!   server and [`server::MockController`].
//! - **`snapshot`**: Configuration snapshot tree and prefix filtering.
//!
//! ## Example
//!
//! ```no_run
//! use nurdctrl::{ClientConfig, ControllerAddress, CtrlClient};
//!
//! # async fn run() -> nurdctrl::CtrlResult<()> {
//! let address: ControllerAddress = "daq01:23546".parse()?;
//! let mut client = CtrlClient::connect_to(&address, ClientConfig::default()).await?;
//! for summary in client.list_crates().await? {
//!     print!("{summary}");
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod network;
pub mod server;
pub mod snapshot;

pub use client::address::ControllerAddress;
pub use client::blocking::BlockingCtrlClient;
pub use client::{ClientConfig, ConnectionState, ControllerInfo, CtrlClient};
pub use error::{CtrlError, CtrlResult, ErrorKind};
pub use model::{
    CrateIndex, CrateInfo, CrateSummary, ModuleIndex, RegisterDump, RegisterRequest,
    RegisterScope, RegisterSelection, RegisterTarget,
};
pub use snapshot::ConfigSnapshot;
