//! In-memory controller for tests and demos.
//!
//! `MockController` holds crates, register memory and a configuration tree
//! behind one async lock, so every request sees a single consistent state.
//! It can also misbehave on demand:
//!
//! - per-register hardware faults ([`MockController::inject_fault`])
//! - crates disappearing at run time ([`MockController::remove_crate`])
//! - configuration changes applied in one step ([`MockController::mutate_config`])
//! - slow answers ([`MockController::set_response_delay`])
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = MockController::demo();
//! let server = ControlServer::bind("127.0.0.1:0", Arc::new(mock.clone()), ServerConfig::default())
//!     .await?
//!     .spawn()?;
//! ```

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use super::controller::{select_registers, Controller, ControllerError};
use crate::model::{
    AccessOp, CrateIndex, CrateInfo, CrateStatus, CrateSummary, HardwareFault, ModuleAccessRequest,
    ModuleInfo, RegisterDump, RegisterReading, RegisterRequest, RegisterScope, RegisterShape,
    SubModuleInfo,
};
use crate::snapshot::{ConfigNode, ScalarValue};

type MemoryKey = (CrateIndex, RegisterScope);
type FaultKey = (CrateIndex, RegisterScope, String);

#[derive(Debug, Default)]
struct MockState {
    crates: BTreeMap<CrateIndex, CrateInfo>,
    memory: HashMap<MemoryKey, HashMap<u32, u32>>,
    faults: HashMap<FaultKey, HardwareFault>,
    config: Vec<ConfigNode>,
}

impl MockState {
    fn crate_info(&self, index: CrateIndex) -> Result<&CrateInfo, ControllerError> {
        self.crates
            .get(&index)
            .ok_or_else(|| ControllerError::no_crate(index))
    }

    fn check_fault(
        &self,
        crate_index: CrateIndex,
        scope: RegisterScope,
        shape: &RegisterShape,
    ) -> Result<(), ControllerError> {
        let key = (crate_index, scope, shape.name.to_ascii_lowercase());
        match self.faults.get(&key) {
            Some(fault) => Err(ControllerError::Hardware {
                fault: *fault,
                message: format!(
                    "{fault} accessing {} (0x{:04x}) in crate {crate_index} {scope}",
                    shape.name, shape.offset
                ),
            }),
            None => Ok(()),
        }
    }

    fn seed(&mut self, info: &CrateInfo) {
        let mut scopes: Vec<(RegisterScope, &[RegisterShape], u32)> =
            vec![(RegisterScope::Crate, info.global_registers.as_slice(), 0)];
        for module in &info.modules {
            scopes.push((
                RegisterScope::module(module.index),
                module.registers.as_slice(),
                module.base_address,
            ));
            for sub in &module.submodules {
                scopes.push((
                    RegisterScope::Module {
                        index: module.index,
                        submodule: Some(sub.index),
                    },
                    sub.registers.as_slice(),
                    module.base_address,
                ));
            }
        }
        for (scope, shapes, base) in scopes {
            let memory = self.memory.entry((info.index, scope)).or_default();
            for shape in shapes {
                for i in 0..shape.element_count() {
                    let offset = shape.element_offset(i);
                    memory
                        .entry(offset)
                        .or_insert_with(|| seed_value(base, offset) & shape.mask());
                }
            }
        }
    }
}

/// Deterministic power-on pattern.
fn seed_value(base: u32, offset: u32) -> u32 {
    (base ^ offset).wrapping_mul(0x9e37_79b9).rotate_left(7)
}

/// Builder for [`MockController`].
#[derive(Debug)]
pub struct MockControllerBuilder {
    name: String,
    state: MockState,
    response_delay: Duration,
}

impl MockControllerBuilder {
    /// Adds a crate; its registers start with a deterministic pattern.
    #[must_use]
    pub fn with_crate(mut self, info: CrateInfo) -> Self {
        self.state.seed(&info);
        self.state.crates.insert(info.index, info);
        self
    }

    /// Replaces the configuration tree.
    #[must_use]
    pub fn with_config(mut self, tree: Vec<ConfigNode>) -> Self {
        self.state.config = tree;
        self
    }

    /// Presets one register element.
    #[must_use]
    pub fn with_register_value(
        mut self,
        crate_index: CrateIndex,
        scope: RegisterScope,
        offset: u32,
        value: u32,
    ) -> Self {
        self.state
            .memory
            .entry((crate_index, scope))
            .or_default()
            .insert(offset, value);
        self
    }

    /// Makes every register access on `name` fail.
    #[must_use]
    pub fn with_fault(
        mut self,
        crate_index: CrateIndex,
        scope: RegisterScope,
        name: &str,
        fault: HardwareFault,
    ) -> Self {
        self.state
            .faults
            .insert((crate_index, scope, name.to_ascii_lowercase()), fault);
        self
    }

    /// Delays every answer.
    #[must_use]
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Finishes the controller.
    #[must_use]
    pub fn build(self) -> MockController {
        MockController {
            name: self.name,
            state: Arc::new(RwLock::new(self.state)),
            response_delay: Arc::new(RwLock::new(self.response_delay)),
            requests: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Mock readout controller.
///
/// Clones share state, so a test can keep one clone to poke at while the
/// server owns another.
#[derive(Debug, Clone)]
pub struct MockController {
    name: String,
    state: Arc<RwLock<MockState>>,
    response_delay: Arc<RwLock<Duration>>,
    requests: Arc<AtomicU64>,
}

impl MockController {
    /// Starts an empty controller.
    pub fn builder(name: impl Into<String>) -> MockControllerBuilder {
        MockControllerBuilder {
            name: name.into(),
            state: MockState::default(),
            response_delay: Duration::ZERO,
        }
    }

    /// Three crates: a VME crate with two digitizers, a TAMEX TDC crate with
    /// front-end cards, and a scaler crate. Configuration mirrors the layout.
    #[must_use]
    pub fn demo() -> Self {
        let crates = demo_crates();
        let config = config_for(&crates);
        let mut builder = Self::builder("demo").with_config(config);
        for info in crates {
            builder = builder.with_crate(info);
        }
        builder
            .with_register_value(0, RegisterScope::module(0), 0x1000, 0x0a05)
            .with_register_value(0, RegisterScope::module(1), 0x1000, 0x0104)
            .build()
    }

    /// Requests served so far.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Changes the answer delay.
    pub async fn set_response_delay(&self, delay: Duration) {
        *self.response_delay.write().await = delay;
    }

    /// Hot-unplugs a crate.
    pub async fn remove_crate(&self, index: CrateIndex) -> Option<CrateInfo> {
        let mut state = self.state.write().await;
        state.memory.retain(|(c, _), _| *c != index);
        state.crates.remove(&index)
    }

    /// Plugs a crate (back) in.
    pub async fn insert_crate(&self, info: CrateInfo) {
        let mut state = self.state.write().await;
        state.seed(&info);
        state.crates.insert(info.index, info);
    }

    /// Makes accesses to one register fail until cleared.
    pub async fn inject_fault(
        &self,
        crate_index: CrateIndex,
        scope: RegisterScope,
        name: &str,
        fault: HardwareFault,
    ) {
        self.state
            .write()
            .await
            .faults
            .insert((crate_index, scope, name.to_ascii_lowercase()), fault);
    }

    /// Removes every injected fault.
    pub async fn clear_faults(&self) {
        self.state.write().await.faults.clear();
    }

    /// Applies `f` to the configuration tree in one step.
    pub async fn mutate_config<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<ConfigNode>) + Send,
    {
        f(&mut self.state.write().await.config);
    }

    /// Current value of one register element.
    pub async fn register_value(
        &self,
        crate_index: CrateIndex,
        scope: RegisterScope,
        offset: u32,
    ) -> Option<u32> {
        self.state
            .read()
            .await
            .memory
            .get(&(crate_index, scope))
            .and_then(|m| m.get(&offset).copied())
    }

    async fn begin(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.response_delay.read().await;
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl Controller for MockController {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn crates(&self) -> Result<Vec<CrateSummary>, ControllerError> {
        self.begin().await;
        let state = self.state.read().await;
        Ok(state.crates.values().map(CrateInfo::summary).collect())
    }

    async fn crate_info(&self, index: CrateIndex) -> Result<CrateInfo, ControllerError> {
        self.begin().await;
        let state = self.state.read().await;
        state.crate_info(index).cloned()
    }

    async fn config_tree(&self) -> Result<Vec<ConfigNode>, ControllerError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let tree = self.state.read().await.config.clone();
        // The delay comes after the copy: changes made while the answer is
        // on its way must not show up in it.
        let delay = *self.response_delay.read().await;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        Ok(tree)
    }

    async fn read_registers(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegisterDump, ControllerError> {
        self.begin().await;
        let state = self.state.read().await;
        let target = request.target;
        let info = state.crate_info(target.crate_index)?;
        let shapes = select_registers(info, request)?;
        let memory = state.memory.get(&(target.crate_index, target.scope));

        let mut readings = Vec::with_capacity(shapes.len());
        for shape in shapes {
            state.check_fault(target.crate_index, target.scope, &shape)?;
            let values = (0..shape.element_count())
                .map(|i| {
                    let offset = shape.element_offset(i);
                    memory.and_then(|m| m.get(&offset)).copied().unwrap_or(0) & shape.mask()
                })
                .collect();
            readings.push(RegisterReading {
                name: shape.name,
                offset: shape.offset,
                bits: shape.bits,
                values,
            });
        }
        Ok(RegisterDump { target, readings })
    }

    async fn module_access(&self, request: &ModuleAccessRequest) -> Result<Vec<u32>, ControllerError> {
        self.begin().await;
        let mut state = self.state.write().await;
        let target = request.target;
        let RegisterScope::Module { index, .. } = target.scope else {
            return Err(ControllerError::Register(
                "raw access needs a module, not the crate registers".into(),
            ));
        };
        let scope = RegisterScope::module(index);
        let module = state
            .crate_info(target.crate_index)?
            .module(index)
            .ok_or_else(|| {
                ControllerError::NotFound(format!(
                    "crate {} has no module {index}",
                    target.crate_index
                ))
            })?;

        // Validate the whole batch before touching memory.
        let mut resolved = Vec::with_capacity(request.accesses.len());
        for access in &request.accesses {
            let shape = module
                .registers
                .iter()
                .find(|s| s.access_width() == access.width && s.element_at(access.offset).is_some())
                .ok_or_else(|| {
                    ControllerError::Register(format!(
                        "{} has no {}-bit register at 0x{:04x}",
                        module.kind,
                        access.width.bits(),
                        access.offset
                    ))
                })?;
            state.check_fault(target.crate_index, scope, shape)?;
            resolved.push((*access, shape.mask()));
        }

        let memory = state.memory.entry((target.crate_index, scope)).or_default();
        let mut values = Vec::new();
        for (access, mask) in resolved {
            match access.op {
                AccessOp::Read => {
                    values.push(memory.get(&access.offset).copied().unwrap_or(0) & mask);
                }
                AccessOp::Write(value) => {
                    memory.insert(access.offset, value & mask);
                }
            }
        }
        Ok(values)
    }
}

fn demo_crates() -> Vec<CrateInfo> {
    let main = CrateInfo {
        index: 0,
        label: "main".into(),
        status: CrateStatus {
            event_max_override: 0,
            dead_time_release: true,
            acvt_ns: 500,
            shadow_buf_bytes: 0,
            shadow_max_bytes: 0x0010_0000,
        },
        global_registers: vec![
            RegisterShape::new("trigger_mask", 0x0, 16),
            RegisterShape::new("dead_time", 0x4, 32),
        ],
        modules: vec![
            ModuleInfo {
                index: 0,
                kind: "CAEN_V775".into(),
                base_address: 0x0001_0000,
                registers: vec![
                    RegisterShape::new("firmware", 0x1000, 16),
                    RegisterShape::new("bit_set2", 0x1032, 16),
                    RegisterShape::new("crate_sel", 0x103c, 8),
                    RegisterShape::array("threshold", 0x1080, 9, 32),
                ],
                submodules: vec![],
            },
            ModuleInfo {
                index: 1,
                kind: "CAEN_V1190".into(),
                base_address: 0x0002_0000,
                registers: vec![
                    RegisterShape::new("firmware", 0x1000, 16),
                    RegisterShape::new("status", 0x1002, 16),
                    RegisterShape::new("almost_full", 0x1022, 16),
                    RegisterShape::new("event_fifo", 0x1038, 32),
                ],
                submodules: vec![],
            },
        ],
    };

    let tamex_card = |index: u8| SubModuleInfo {
        index,
        kind: "TAMEX4".into(),
        registers: vec![
            RegisterShape::new("trigger_window", 0x10, 32),
            RegisterShape::array("threshold", 0x40, 16, 16),
        ],
    };
    let tdc = CrateInfo {
        index: 1,
        label: "tdc".into(),
        status: CrateStatus {
            acvt_ns: 2000,
            shadow_max_bytes: 0x0040_0000,
            ..CrateStatus::default()
        },
        global_registers: vec![],
        modules: vec![ModuleInfo {
            index: 0,
            kind: "GSI_TRIDI".into(),
            base_address: 0x0300_0000,
            registers: vec![
                RegisterShape::new("control", 0x0, 32),
                RegisterShape::new("status", 0x4, 32),
            ],
            submodules: (0..3).map(tamex_card).collect(),
        }],
    };

    let scaler = CrateInfo {
        index: 2,
        label: "scaler".into(),
        status: CrateStatus::default(),
        global_registers: vec![RegisterShape::new("trigger_mask", 0x0, 16)],
        modules: vec![ModuleInfo {
            index: 0,
            kind: "CAEN_V830".into(),
            base_address: 0x0040_0000,
            registers: vec![
                RegisterShape::array("counter", 0x1000, 32, 32),
                RegisterShape::new("control", 0x1108, 16),
            ],
            submodules: vec![],
        }],
    };

    vec![main, tdc, scaler]
}

fn config_for(crates: &[CrateInfo]) -> Vec<ConfigNode> {
    let mut tree = vec![ConfigNode::scalar("log_level", [ScalarValue::keyword("info")])];
    for info in crates {
        let mut children = vec![
            ConfigNode::scalar(
                "acvt",
                [ScalarValue::Integer {
                    value: i32::from(info.status.acvt_ns),
                    unit: "ns".into(),
                }],
            ),
            ConfigNode::scalar(
                "dt_release",
                [ScalarValue::keyword(if info.status.dead_time_release {
                    "true"
                } else {
                    "false"
                })],
            ),
        ];
        for module in &info.modules {
            let mut module_children = vec![ConfigNode::scalar(
                "threshold",
                std::iter::repeat(ScalarValue::int(0x10)).take(16),
            )];
            module_children.push(
                ConfigNode::scalar(
                    "gate_width",
                    [ScalarValue::Double {
                        value: 1.5,
                        unit: "us".into(),
                    }],
                )
                .untouched(),
            );
            for sub in &module.submodules {
                module_children.push(ConfigNode::block(
                    sub.kind.clone(),
                    [ScalarValue::int(i32::from(sub.index))],
                    vec![ConfigNode::scalar(
                        "channel_enable",
                        [ScalarValue::Range { first: 0, last: 31 }],
                    )],
                ));
            }
            children.push(ConfigNode::block(
                module.kind.clone(),
                [ScalarValue::Integer {
                    value: module.base_address as i32,
                    unit: String::new(),
                }],
                module_children,
            ));
        }
        tree.push(ConfigNode::block(
            "CRATE",
            [ScalarValue::string(info.label.clone())],
            children,
        ));
    }
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessWidth, ModuleAccess, RegisterSelection, RegisterTarget};

    fn all(target: RegisterTarget) -> RegisterRequest {
        RegisterRequest {
            target,
            selection: RegisterSelection::All,
        }
    }

    #[tokio::test]
    async fn test_demo_topology() {
        let mock = MockController::demo();
        let crates = mock.crates().await.unwrap();
        assert_eq!(crates.len(), 3);
        assert_eq!(crates[1].modules[0].submodules.len(), 3);
        assert_eq!(mock.request_count(), 1);

        let tree = mock.config_tree().await.unwrap();
        assert_eq!(tree.len(), 4);
    }

    #[tokio::test]
    async fn test_register_reads_follow_memory() {
        let mock = MockController::demo();
        let dump = mock
            .read_registers(&all(RegisterTarget::module(0, 0)))
            .await
            .unwrap();
        assert_eq!(dump.get("firmware").unwrap().value(), Some(0x0a05));
        assert_eq!(dump.get("threshold").unwrap().values.len(), 32);
        assert!(dump
            .get("threshold")
            .unwrap()
            .values
            .iter()
            .all(|v| *v < 0x200));

        let again = mock
            .read_registers(&all(RegisterTarget::module(0, 0)))
            .await
            .unwrap();
        assert_eq!(dump, again);
    }

    #[tokio::test]
    async fn test_faults_and_unplug() {
        let mock = MockController::demo();
        mock.inject_fault(0, RegisterScope::module(1), "STATUS", HardwareFault::BusError)
            .await;
        let err = mock
            .read_registers(&all(RegisterTarget::module(0, 1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Hardware {
                fault: HardwareFault::BusError,
                ..
            }
        ));

        mock.clear_faults().await;
        assert!(mock
            .read_registers(&all(RegisterTarget::module(0, 1)))
            .await
            .is_ok());

        let removed = mock.remove_crate(2).await.unwrap();
        assert_eq!(removed.label, "scaler");
        assert_eq!(
            mock.crate_info(2).await.unwrap_err(),
            ControllerError::no_crate(2)
        );
        mock.insert_crate(removed).await;
        assert!(mock.crate_info(2).await.is_ok());
    }

    #[tokio::test]
    async fn test_module_access_checks_declared_registers() {
        let mock = MockController::demo();
        let target = RegisterTarget::module(2, 0);
        let request = ModuleAccessRequest {
            target,
            accesses: vec![
                ModuleAccess::write(0x1108, AccessWidth::Bits16, 0x1_0003),
                ModuleAccess::read(0x1108, AccessWidth::Bits16),
                ModuleAccess::read(0x1004, AccessWidth::Bits32),
            ],
        };
        let values = mock.module_access(&request).await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], 0x0003);
        assert_eq!(
            mock.register_value(2, RegisterScope::module(0), 0x1108).await,
            Some(0x0003)
        );

        let wrong_width = ModuleAccessRequest {
            target,
            accesses: vec![ModuleAccess::read(0x1108, AccessWidth::Bits32)],
        };
        assert!(matches!(
            mock.module_access(&wrong_width).await,
            Err(ControllerError::Register(_))
        ));
    }

    #[tokio::test]
    async fn test_config_mutation_is_atomic() {
        let mock = MockController::demo();
        mock.mutate_config(|tree| {
            for node in tree.iter_mut() {
                node.visit_mut(&mut |n| n.touched = false);
            }
        })
        .await;
        let tree = mock.config_tree().await.unwrap();
        assert!(tree.iter().all(|n| !n.touched));
    }
}
