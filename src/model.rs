//! Typed data model of the controller's hardware topology.
//!
//! A controller owns a dense, 0-based list of crates. Each crate hosts modules
//! (which may themselves carry sub-modules) and may expose crate-level
//! registers of its own. Register *shapes* (name, offset, width, array length)
//! are static per module type; register *values* are only ever obtained by a
//! live read through [`RegisterDump`].
//!
//! Indices are stable for the lifetime of one controller process only. Do not
//! keep them across reconnects without listing the crates again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Position of a crate in the controller's canonical ordering.
pub type CrateIndex = u8;

/// Position of a module within its crate.
pub type ModuleIndex = u8;

/// One entry of the crate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrateSummary {
    /// Controller-assigned index.
    pub index: CrateIndex,
    /// Human-readable crate name.
    pub label: String,
    /// Installed modules, in slot order.
    pub modules: Vec<ModuleSummary>,
}

/// Module type information as carried by the crate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    /// Index within the crate.
    pub index: ModuleIndex,
    /// Module type identifier, e.g. `CAEN_V775`.
    pub kind: String,
    /// Sub-module type identifiers.
    pub submodules: Vec<String>,
}

impl fmt::Display for CrateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Crate[{}] = {}", self.index, self.label)?;
        for module in &self.modules {
            writeln!(f, " Module[{}] = {}", module.index, module.kind)?;
            for (k, sub) in module.submodules.iter().enumerate() {
                writeln!(f, "  Sub-module[{k}] = {sub}")?;
            }
        }
        Ok(())
    }
}

/// Run-time status block of a crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrateStatus {
    /// Overridden maximum number of events per readout, 0 if none.
    pub event_max_override: u16,
    /// Whether dead-time is released early.
    pub dead_time_release: bool,
    /// Acquisition veto time in nanoseconds.
    pub acvt_ns: u16,
    /// Bytes currently held in the shadow buffer.
    pub shadow_buf_bytes: u32,
    /// Shadow buffer capacity in bytes.
    pub shadow_max_bytes: u32,
}

/// Full record of one crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrateInfo {
    /// Controller-assigned index.
    pub index: CrateIndex,
    /// Human-readable crate name.
    pub label: String,
    /// Run-time status.
    pub status: CrateStatus,
    /// Crate-level registers, addressed with [`RegisterScope::Crate`].
    pub global_registers: Vec<RegisterShape>,
    /// Installed modules, in slot order.
    pub modules: Vec<ModuleInfo>,
}

impl CrateInfo {
    /// Looks up a module by index.
    #[must_use]
    pub fn module(&self, index: ModuleIndex) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.index == index)
    }

    /// Declared register shapes for the given scope, if the scope exists.
    #[must_use]
    pub fn registers(&self, scope: &RegisterScope) -> Option<&[RegisterShape]> {
        match *scope {
            RegisterScope::Crate => Some(&self.global_registers),
            RegisterScope::Module { index, submodule } => {
                let module = self.module(index)?;
                match submodule {
                    None => Some(&module.registers),
                    Some(k) => module
                        .submodules
                        .iter()
                        .find(|s| s.index == k)
                        .map(|s| s.registers.as_slice()),
                }
            }
        }
    }

    /// Reduces the record to its crate-list form.
    #[must_use]
    pub fn summary(&self) -> CrateSummary {
        CrateSummary {
            index: self.index,
            label: self.label.clone(),
            modules: self
                .modules
                .iter()
                .map(|m| ModuleSummary {
                    index: m.index,
                    kind: m.kind.clone(),
                    submodules: m.submodules.iter().map(|s| s.kind.clone()).collect(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for CrateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Crate[{}] = {}", self.index, self.label)?;
        let s = &self.status;
        writeln!(f, " event_max_override = {}", s.event_max_override)?;
        writeln!(f, " dead_time_release  = {}", s.dead_time_release)?;
        writeln!(f, " acvt               = {} ns", s.acvt_ns)?;
        writeln!(
            f,
            " shadow             = {}/{} bytes",
            s.shadow_buf_bytes, s.shadow_max_bytes
        )?;
        if !self.global_registers.is_empty() {
            writeln!(f, " Crate registers:")?;
            for shape in &self.global_registers {
                writeln!(f, "  {shape}")?;
            }
        }
        for module in &self.modules {
            writeln!(
                f,
                " Module[{}] = {} @ 0x{:08x}",
                module.index, module.kind, module.base_address
            )?;
            for shape in &module.registers {
                writeln!(f, "  {shape}")?;
            }
            for sub in &module.submodules {
                writeln!(f, "  Sub-module[{}] = {}", sub.index, sub.kind)?;
                for shape in &sub.registers {
                    writeln!(f, "   {shape}")?;
                }
            }
        }
        Ok(())
    }
}

/// A module slotted into a crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Index within the crate.
    pub index: ModuleIndex,
    /// Module type identifier.
    pub kind: String,
    /// Bus base address.
    pub base_address: u32,
    /// Declared register map.
    pub registers: Vec<RegisterShape>,
    /// Sub-modules, e.g. front-end cards behind a readout bridge.
    pub submodules: Vec<SubModuleInfo>,
}

/// A device behind a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubModuleInfo {
    /// Index within the parent module.
    pub index: u8,
    /// Sub-module type identifier.
    pub kind: String,
    /// Declared register map.
    pub registers: Vec<RegisterShape>,
}

/// Declared shape of a register: where it lives and how wide it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterShape {
    /// Register name, unique within its module.
    pub name: String,
    /// Offset from the module base address.
    pub offset: u32,
    /// Significant bits, 1..=32.
    pub bits: u8,
    /// Number of array elements; 0 and 1 both mean a scalar register.
    pub array_length: u16,
}

impl RegisterShape {
    /// Scalar register.
    pub fn new(name: impl Into<String>, offset: u32, bits: u8) -> Self {
        Self {
            name: name.into(),
            offset,
            bits,
            array_length: 0,
        }
    }

    /// Register array with `len` elements.
    pub fn array(name: impl Into<String>, offset: u32, bits: u8, len: u16) -> Self {
        Self {
            name: name.into(),
            offset,
            bits,
            array_length: len,
        }
    }

    /// Number of values a read of this register yields.
    #[must_use]
    pub fn element_count(&self) -> usize {
        usize::from(self.array_length.max(1))
    }

    /// Bus access width used for this register.
    #[must_use]
    pub fn access_width(&self) -> AccessWidth {
        if self.bits <= 16 {
            AccessWidth::Bits16
        } else {
            AccessWidth::Bits32
        }
    }

    /// Address of element `i`, relative to the module base.
    #[must_use]
    pub fn element_offset(&self, i: usize) -> u32 {
        let stride = self.access_width().bytes();
        self.offset.wrapping_add(stride.wrapping_mul(i as u32))
    }

    /// Returns the element index living at `offset`, if any.
    #[must_use]
    pub fn element_at(&self, offset: u32) -> Option<usize> {
        (0..self.element_count()).find(|&i| self.element_offset(i) == offset)
    }

    /// Mask of the significant bits.
    #[must_use]
    pub fn mask(&self) -> u32 {
        if self.bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.bits) - 1
        }
    }
}

impl fmt::Display for RegisterShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x}) {} bits", self.name, self.offset, self.bits)?;
        if self.array_length > 1 {
            write!(f, " x{}", self.array_length)?;
        }
        Ok(())
    }
}

/// Which register set of a crate a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterScope {
    /// Crate-level (global) registers.
    Crate,
    /// A module, or one of its sub-modules.
    Module {
        /// Module index within the crate.
        index: ModuleIndex,
        /// Sub-module index within the module.
        submodule: Option<u8>,
    },
}

impl RegisterScope {
    /// Module scope without a sub-module.
    #[must_use]
    pub fn module(index: ModuleIndex) -> Self {
        Self::Module {
            index,
            submodule: None,
        }
    }
}

impl fmt::Display for RegisterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crate => write!(f, "crate registers"),
            Self::Module {
                index,
                submodule: None,
            } => write!(f, "module {index}"),
            Self::Module {
                index,
                submodule: Some(k),
            } => write!(f, "module {index}.{k}"),
        }
    }
}

/// Accepts `global`, `crate` or `-` for crate-level registers, `J` for module
/// `J` and `J.K` for sub-module `K` of module `J`.
impl FromStr for RegisterScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "global" | "crate" | "-" => return Ok(Self::Crate),
            _ => {}
        }
        let (module, submodule) = match s.split_once('.') {
            Some((m, k)) => (m, Some(k)),
            None => (s, None),
        };
        let index = module
            .parse::<u8>()
            .map_err(|e| format!("invalid module index '{module}': {e}"))?;
        let submodule = submodule
            .map(|k| {
                k.parse::<u8>()
                    .map_err(|e| format!("invalid sub-module index '{k}': {e}"))
            })
            .transpose()?;
        Ok(Self::Module { index, submodule })
    }
}

/// Fully qualified register set: crate plus scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterTarget {
    /// Crate index.
    pub crate_index: CrateIndex,
    /// Register set within the crate.
    pub scope: RegisterScope,
}

impl RegisterTarget {
    /// Module `module` of crate `crate_index`.
    #[must_use]
    pub fn module(crate_index: CrateIndex, module: ModuleIndex) -> Self {
        Self {
            crate_index,
            scope: RegisterScope::module(module),
        }
    }

    /// Crate-level registers of crate `crate_index`.
    #[must_use]
    pub fn global(crate_index: CrateIndex) -> Self {
        Self {
            crate_index,
            scope: RegisterScope::Crate,
        }
    }
}

impl fmt::Display for RegisterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crate {} {}", self.crate_index, self.scope)
    }
}

/// Which registers of a target to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterSelection {
    /// Every declared register.
    All,
    /// A single register by name.
    Named(String),
    /// A single register by offset.
    Offset(u32),
}

impl RegisterSelection {
    /// Returns `true` if `shape` is selected.
    #[must_use]
    pub fn matches(&self, shape: &RegisterShape) -> bool {
        match self {
            Self::All => true,
            Self::Named(name) => shape.name.eq_ignore_ascii_case(name),
            Self::Offset(offset) => shape.offset == *offset,
        }
    }
}

impl fmt::Display for RegisterSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all registers"),
            Self::Named(name) => write!(f, "register '{name}'"),
            Self::Offset(offset) => write!(f, "register at 0x{offset:04x}"),
        }
    }
}

/// Numeric input (decimal or `0x` hex) selects by offset, anything else by name.
impl FromStr for RegisterSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty register selector".into());
        }
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        if s.starts_with(|c: char| c.is_ascii_digit()) {
            return parse_number(s).map(Self::Offset);
        }
        Ok(Self::Named(s.to_string()))
    }
}

/// A register read request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Where to read.
    pub target: RegisterTarget,
    /// What to read.
    pub selection: RegisterSelection,
}

/// Live value(s) of one register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReading {
    /// Register name.
    pub name: String,
    /// Offset from the module base address.
    pub offset: u32,
    /// Significant bits.
    pub bits: u8,
    /// One value per array element.
    pub values: Vec<u32>,
}

impl RegisterReading {
    /// First (or only) value.
    #[must_use]
    pub fn value(&self) -> Option<u32> {
        self.values.first().copied()
    }
}

/// Result of a register read, in declared register order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDump {
    /// Where the values were read.
    pub target: RegisterTarget,
    /// One entry per selected register.
    pub readings: Vec<RegisterReading>,
}

impl RegisterDump {
    /// Looks up a reading by register name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisterReading> {
        self.readings
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Register names in dump order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.readings.iter().map(|r| r.name.as_str())
    }

    /// Number of registers in the dump.
    #[must_use]
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Returns `true` if nothing was read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl fmt::Display for RegisterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.target)?;
        for reading in &self.readings {
            write!(f, " {} (0x{:04x}) = ", reading.name, reading.offset)?;
            let multi = reading.values.len() > 1;
            if multi {
                write!(f, "\n  ")?;
            }
            for (j, value) in reading.values.iter().enumerate() {
                write_hex(f, reading.bits, *value)?;
                if j + 1 == reading.values.len() {
                    break;
                }
                if j % 8 == 7 {
                    write!(f, "\n  ")?;
                } else {
                    write!(f, " ")?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bits: u8, value: u32) -> fmt::Result {
    if bits <= 16 {
        write!(f, "0x{value:04x}")
    } else {
        write!(f, "0x{value:08x}")
    }
}

/// Why a hardware access failed on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareFault {
    /// No bus acknowledge within the bus timeout.
    BusTimeout,
    /// The bus reported an error cycle.
    BusError,
    /// The access was refused (wrong address modifier, read-only, ...).
    AccessViolation,
}

impl HardwareFault {
    /// Transient faults may clear on retry; violations will not.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::BusTimeout | Self::BusError)
    }
}

impl fmt::Display for HardwareFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BusTimeout => "bus timeout",
            Self::BusError => "bus error",
            Self::AccessViolation => "access violation",
        };
        f.write_str(s)
    }
}

/// Bus access width for raw module access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessWidth {
    /// 16-bit access.
    Bits16,
    /// 32-bit access.
    Bits32,
}

impl AccessWidth {
    /// Width in bytes.
    #[must_use]
    pub fn bytes(self) -> u32 {
        match self {
            Self::Bits16 => 2,
            Self::Bits32 => 4,
        }
    }

    /// Width in bits.
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Bits16 => 16,
            Self::Bits32 => 32,
        }
    }

    /// Only 16- and 32-bit accesses exist.
    pub fn from_bits(bits: u32) -> Result<Self, String> {
        match bits {
            16 => Ok(Self::Bits16),
            32 => Ok(Self::Bits32),
            other => Err(format!("can only access 16 or 32 bits, asked for {other}")),
        }
    }
}

/// Raw read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessOp {
    /// Read the location.
    Read,
    /// Write the value.
    Write(u32),
}

/// One raw access to a module location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleAccess {
    /// Offset from the module base address.
    pub offset: u32,
    /// Access width.
    pub width: AccessWidth,
    /// Read or write.
    pub op: AccessOp,
}

impl ModuleAccess {
    /// Read access.
    #[must_use]
    pub fn read(offset: u32, width: AccessWidth) -> Self {
        Self {
            offset,
            width,
            op: AccessOp::Read,
        }
    }

    /// Write access.
    #[must_use]
    pub fn write(offset: u32, width: AccessWidth, value: u32) -> Self {
        Self {
            offset,
            width,
            op: AccessOp::Write(value),
        }
    }
}

/// A batch of raw accesses to one module, executed in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleAccessRequest {
    /// Crate and module; sub-module scopes address the parent module.
    pub target: RegisterTarget,
    /// Accesses in execution order.
    pub accesses: Vec<ModuleAccess>,
}

/// Parses `ofs:bits[:value]`, e.g. `0x1000:16` or `0x1008:32:1`.
impl FromStr for ModuleAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let offset = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| format!("missing offset in '{s}'"))
            .and_then(parse_number)?;
        let bits = parts
            .next()
            .ok_or_else(|| format!("missing bit width in '{s}'"))
            .and_then(parse_number)?;
        let width = AccessWidth::from_bits(bits)?;
        let op = match parts.next() {
            None => AccessOp::Read,
            Some(value) => AccessOp::Write(parse_number(value)?),
        };
        if parts.next().is_some() {
            return Err(format!("trailing fields in '{s}'"));
        }
        Ok(Self { offset, width, op })
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}
