//! Synchronous facade over [`CtrlClient`].
//!
//! Runs the async client on a private current-thread runtime. Must not be
//! used from inside another tokio runtime.

use tokio::runtime::{Builder, Runtime};

use super::address::ControllerAddress;
use super::{ClientConfig, ConnectionState, ControllerInfo, CtrlClient};
use crate::error::{CtrlError, CtrlResult};
use crate::model::{
    CrateIndex, CrateInfo, CrateSummary, ModuleAccessRequest, RegisterDump, RegisterRequest,
    RegisterTarget,
};
use crate::snapshot::ConfigSnapshot;

/// Blocking control client.
#[derive(Debug)]
pub struct BlockingCtrlClient {
    // Dropped before the runtime it is registered with.
    inner: CtrlClient,
    runtime: Runtime,
}

impl BlockingCtrlClient {
    /// A disconnected client with its own runtime.
    pub fn new(config: ClientConfig) -> CtrlResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CtrlError::io("starting the client runtime", e))?;
        Ok(Self {
            inner: CtrlClient::new(config),
            runtime,
        })
    }

    /// See [`CtrlClient::connect`].
    pub fn connect(&mut self, address: &ControllerAddress) -> CtrlResult<()> {
        self.runtime.block_on(self.inner.connect(address))
    }

    /// See [`CtrlClient::close`].
    pub fn close(&mut self) {
        self.runtime.block_on(self.inner.close());
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ConnectionState {
        self.inner.state()
    }

    /// See [`CtrlClient::ping`].
    pub fn ping(&mut self) -> CtrlResult<ControllerInfo> {
        self.runtime.block_on(self.inner.ping())
    }

    /// See [`CtrlClient::list_crates`].
    pub fn list_crates(&mut self) -> CtrlResult<Vec<CrateSummary>> {
        self.runtime.block_on(self.inner.list_crates())
    }

    /// See [`CtrlClient::crate_info`].
    pub fn crate_info(&mut self, index: CrateIndex) -> CtrlResult<CrateInfo> {
        self.runtime.block_on(self.inner.crate_info(index))
    }

    /// See [`CtrlClient::dump_config`].
    pub fn dump_config(&mut self, prefix: Option<&str>) -> CtrlResult<ConfigSnapshot> {
        self.runtime.block_on(self.inner.dump_config(prefix))
    }

    /// See [`CtrlClient::read_registers`].
    pub fn read_registers(&mut self, request: &RegisterRequest) -> CtrlResult<RegisterDump> {
        self.runtime.block_on(self.inner.read_registers(request))
    }

    /// See [`CtrlClient::dump_registers`].
    pub fn dump_registers(&mut self, target: RegisterTarget) -> CtrlResult<RegisterDump> {
        self.runtime.block_on(self.inner.dump_registers(target))
    }

    /// See [`CtrlClient::module_access`].
    pub fn module_access(&mut self, request: &ModuleAccessRequest) -> CtrlResult<Vec<u32>> {
        self.runtime.block_on(self.inner.module_access(request))
    }

    /// The wrapped async client.
    #[must_use]
    pub fn get_ref(&self) -> &CtrlClient {
        &self.inner
    }
}
