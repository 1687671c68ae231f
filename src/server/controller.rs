//! The controller seam.
//!
//! A [`Controller`] is whatever owns the crates: the readout process itself
//! or the in-memory [`MockController`](super::mock::MockController). The
//! [`ControlServer`](super::ControlServer) only translates between frames
//! and these calls.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    CrateIndex, CrateInfo, CrateSummary, HardwareFault, ModuleAccessRequest, RegisterDump,
    RegisterRequest, RegisterSelection, RegisterShape,
};
use crate::network::protocol::ResponseStatus;
use crate::snapshot::ConfigNode;

/// Failures a controller reports back to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Unknown crate, module or sub-module.
    #[error("{0}")]
    NotFound(String),

    /// The module has no such register, or the access is not declared.
    #[error("{0}")]
    Register(String),

    /// The hardware access failed.
    #[error("{message}")]
    Hardware {
        /// Fault class.
        fault: HardwareFault,
        /// Detail for the operator.
        message: String,
    },

    /// The controller does not implement the operation.
    #[error("{0}")]
    Unsupported(String),
}

impl ControllerError {
    /// Wire status for this error.
    #[must_use]
    pub fn status(&self) -> ResponseStatus {
        match self {
            Self::NotFound(_) => ResponseStatus::NotFound,
            Self::Register(_) => ResponseStatus::RegisterError,
            Self::Hardware { .. } => ResponseStatus::HardwareError,
            Self::Unsupported(_) => ResponseStatus::InvalidRequest,
        }
    }

    /// Unknown crate.
    #[must_use]
    pub fn no_crate(index: CrateIndex) -> Self {
        Self::NotFound(format!("no crate with index {index}"))
    }
}

/// Something that manages readout crates.
///
/// Implementations must be safe to call from many connections at once.
/// Each call must observe one consistent state: in particular
/// [`Controller::config_tree`] must return the whole tree as of a single
/// instant, never a mix of before and after a concurrent change.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Name reported in the handshake.
    fn name(&self) -> String;

    /// Crates currently managed, in index order.
    async fn crates(&self) -> Result<Vec<CrateSummary>, ControllerError>;

    /// Full description of one crate.
    async fn crate_info(&self, index: CrateIndex) -> Result<CrateInfo, ControllerError>;

    /// Copy of the complete configuration tree.
    async fn config_tree(&self) -> Result<Vec<ConfigNode>, ControllerError>;

    /// Live register values.
    async fn read_registers(&self, request: &RegisterRequest)
        -> Result<RegisterDump, ControllerError>;

    /// Raw module access.
    async fn module_access(&self, request: &ModuleAccessRequest) -> Result<Vec<u32>, ControllerError> {
        Err(ControllerError::Unsupported(format!(
            "raw module access is not available on {}",
            request.target
        )))
    }
}

/// Resolves a register request against a crate description.
///
/// Returns the selected shapes in declared order. An unknown module or
/// sub-module is [`ControllerError::NotFound`], a selection that matches
/// nothing is [`ControllerError::Register`].
pub fn select_registers(
    info: &CrateInfo,
    request: &RegisterRequest,
) -> Result<Vec<RegisterShape>, ControllerError> {
    let scope = &request.target.scope;
    let shapes = info.registers(scope).ok_or_else(|| {
        ControllerError::NotFound(format!("crate {} has no {scope}", info.index))
    })?;
    let selected: Vec<RegisterShape> = shapes
        .iter()
        .filter(|shape| request.selection.matches(shape))
        .cloned()
        .collect();
    if selected.is_empty() && request.selection != RegisterSelection::All {
        return Err(ControllerError::Register(format!(
            "{} of crate {} has no {}",
            scope, info.index, request.selection
        )));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CrateStatus, ModuleInfo, RegisterScope, RegisterTarget, SubModuleInfo,
    };

    fn info() -> CrateInfo {
        CrateInfo {
            index: 1,
            label: "tdc".into(),
            status: CrateStatus::default(),
            global_registers: vec![],
            modules: vec![ModuleInfo {
                index: 0,
                kind: "GSI_TAMEX".into(),
                base_address: 0,
                registers: vec![
                    RegisterShape::new("control", 0x0, 32),
                    RegisterShape::new("status", 0x4, 32),
                ],
                submodules: vec![SubModuleInfo {
                    index: 0,
                    kind: "TAMEX4".into(),
                    registers: vec![RegisterShape::new("trigger_window", 0x10, 32)],
                }],
            }],
        }
    }

    fn request(scope: RegisterScope, selection: RegisterSelection) -> RegisterRequest {
        RegisterRequest {
            target: RegisterTarget {
                crate_index: 1,
                scope,
            },
            selection,
        }
    }

    #[test]
    fn selection_keeps_declared_order() {
        let all = select_registers(
            &info(),
            &request(RegisterScope::module(0), RegisterSelection::All),
        )
        .unwrap();
        let names: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["control", "status"]);

        let one = select_registers(
            &info(),
            &request(RegisterScope::module(0), RegisterSelection::Offset(4)),
        )
        .unwrap();
        assert_eq!(one[0].name, "status");
    }

    #[test]
    fn unknown_register_is_a_register_error() {
        let err = select_registers(
            &info(),
            &request(
                RegisterScope::module(0),
                RegisterSelection::Named("BADREG".into()),
            ),
        )
        .unwrap_err();
        assert!(matches!(err, ControllerError::Register(_)));
        assert_eq!(err.status(), ResponseStatus::RegisterError);
    }

    #[test]
    fn unknown_scope_is_not_found() {
        let missing_module = select_registers(
            &info(),
            &request(RegisterScope::module(7), RegisterSelection::All),
        );
        assert!(matches!(missing_module, Err(ControllerError::NotFound(_))));

        let missing_sub = select_registers(
            &info(),
            &request(
                RegisterScope::Module {
                    index: 0,
                    submodule: Some(3),
                },
                RegisterSelection::All,
            ),
        );
        assert!(matches!(missing_sub, Err(ControllerError::NotFound(_))));

        // Crates without global registers yield an empty set.
        let empty = select_registers(
            &info(),
            &request(RegisterScope::Crate, RegisterSelection::All),
        )
        .unwrap();
        assert!(empty.is_empty());
    }
}
