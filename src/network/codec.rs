//! Binary encoding of request and response payloads.
//!
//! Integers are little-endian, strings are `u16 length | UTF-8`, sequences
//! are `u16 count | items`. Decoding is strict: running out of bytes, an
//! unknown tag or bytes left over after the top-level value are all errors.
//! Encoding refuses values that do not fit those prefixes rather than
//! truncating them, and configuration trees are capped at
//! [`MAX_CONFIG_DEPTH`] levels in both directions.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::model::{
    AccessOp, AccessWidth, CrateInfo, CrateStatus, CrateSummary, HardwareFault, ModuleAccess,
    ModuleAccessRequest, ModuleInfo, ModuleSummary, RegisterDump, RegisterReading, RegisterRequest,
    RegisterScope, RegisterSelection, RegisterShape, RegisterTarget, SubModuleInfo,
};
use crate::snapshot::{
    ConfigKind, ConfigNode, ConfigScalar, ConfigSnapshot, ScalarValue, MAX_CONFIG_DEPTH,
};

/// Largest count or byte length a `u16` prefix can carry.
pub const MAX_WIRE_LEN: usize = u16::MAX as usize;

/// Payload decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended before `what` was complete.
    #[error("truncated payload: {what} needs {needed} bytes, {remaining} left")]
    Truncated {
        /// Field being decoded.
        what: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        remaining: usize,
    },

    /// Bytes remained after the top-level value.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// A discriminant byte has no meaning.
    #[error("unknown {what} tag {tag:#04x}")]
    UnknownTag {
        /// Field being decoded.
        what: &'static str,
        /// Offending tag.
        tag: u8,
    },

    /// A string field was not UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A field decoded but its value is out of range.
    #[error("invalid {what}: {reason}")]
    Invalid {
        /// Field being decoded.
        what: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Payload encoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A list or string is longer than its length prefix can express.
    #[error("{what} has {len} entries, at most {} fit on the wire", MAX_WIRE_LEN)]
    TooLong {
        /// Field being encoded.
        what: &'static str,
        /// Actual length.
        len: usize,
    },

    /// A configuration tree nests deeper than [`MAX_CONFIG_DEPTH`].
    #[error("configuration tree is nested deeper than {} levels", MAX_CONFIG_DEPTH)]
    TooDeep,
}

/// Cursor over a payload.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    depth: usize,
}

impl<'a> WireReader<'a> {
    /// Starts reading at the beginning of `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, depth: 0 }
    }

    /// Enters one level of a nested value; fails once `limit` levels are
    /// open. Pair with [`WireReader::leave`].
    pub fn enter(&mut self, what: &'static str, limit: usize) -> Result<(), DecodeError> {
        if self.depth >= limit {
            return Err(DecodeError::Invalid {
                what,
                reason: format!("nested deeper than {limit} levels"),
            });
        }
        self.depth += 1;
        Ok(())
    }

    /// Leaves a level opened by [`WireReader::enter`].
    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Takes `n` raw bytes.
    pub fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated {
                what,
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    /// Reads a `u8`.
    pub fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.array::<1>(what)?[0])
    }

    /// Reads a `u16`.
    pub fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        self.array(what).map(u16::from_le_bytes)
    }

    /// Reads a `u32`.
    pub fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        self.array(what).map(u32::from_le_bytes)
    }

    /// Reads a `u64`.
    pub fn u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        self.array(what).map(u64::from_le_bytes)
    }

    /// Reads an `i32`.
    pub fn i32(&mut self, what: &'static str) -> Result<i32, DecodeError> {
        self.array(what).map(i32::from_le_bytes)
    }

    /// Reads an `i64`.
    pub fn i64(&mut self, what: &'static str) -> Result<i64, DecodeError> {
        self.array(what).map(i64::from_le_bytes)
    }

    /// Reads an `f64`.
    pub fn f64(&mut self, what: &'static str) -> Result<f64, DecodeError> {
        self.array(what).map(f64::from_le_bytes)
    }

    /// Reads a boolean byte; anything but 0 or 1 is rejected.
    pub fn bool(&mut self, what: &'static str) -> Result<bool, DecodeError> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::UnknownTag { what, tag }),
        }
    }

    /// Reads a length-prefixed string.
    pub fn string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let len = self.u16(what)? as usize;
        let raw = self.take(len, what)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(what))
    }

    /// Reads a count-prefixed sequence.
    pub fn seq<T: WireDecode>(&mut self) -> Result<Vec<T>, DecodeError> {
        let count = self.u16("sequence length")? as usize;
        // Each item is at least one byte; cap the allocation accordingly.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }

    /// Fails if any bytes are left.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

/// Types that can be written to a payload.
pub trait WireEncode {
    /// Appends the encoding to `buf`.
    ///
    /// On error `buf` may hold a partial encoding and must be discarded.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;

    /// Encodes into a fresh buffer.
    fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Types that can be read from a payload.
pub trait WireDecode: Sized {
    /// Reads one value.
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError>;

    /// Decodes a complete payload, rejecting trailing bytes.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(data);
        let value = Self::decode(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}

/// Writes a `u16` length prefix.
fn put_len(buf: &mut BytesMut, what: &'static str, len: usize) -> Result<(), EncodeError> {
    let len = u16::try_from(len).map_err(|_| EncodeError::TooLong { what, len })?;
    buf.put_u16_le(len);
    Ok(())
}

/// Appends a length-prefixed string.
pub fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    put_len(buf, "string", s.len())?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_seq<T: WireEncode>(buf: &mut BytesMut, items: &[T]) -> Result<(), EncodeError> {
    put_len(buf, "sequence", items.len())?;
    for item in items {
        item.encode(buf)?;
    }
    Ok(())
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) -> Result<(), EncodeError> {
    match s {
        None => {
            buf.put_u8(0);
            Ok(())
        }
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s)
        }
    }
}

fn opt_string(r: &mut WireReader<'_>, what: &'static str) -> Result<Option<String>, DecodeError> {
    match r.u8(what)? {
        0 => Ok(None),
        1 => r.string(what).map(Some),
        tag => Err(DecodeError::UnknownTag { what, tag }),
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_str(buf, self)
    }
}

impl WireDecode for String {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.string("string")
    }
}

impl WireEncode for u32 {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u32_le(*self);
        Ok(())
    }
}

impl WireDecode for u32 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.u32("u32")
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_seq(buf, self)
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.seq()
    }
}

/// Prefix argument of a configuration dump request.
impl WireEncode for Option<String> {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_opt_str(buf, self.as_deref())
    }
}

impl WireDecode for Option<String> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        opt_string(r, "optional string")
    }
}

impl WireEncode for ModuleSummary {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.index);
        put_str(buf, &self.kind)?;
        put_seq(buf, &self.submodules)?;
        Ok(())
    }
}

impl WireDecode for ModuleSummary {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            index: r.u8("module index")?,
            kind: r.string("module kind")?,
            submodules: r.seq()?,
        })
    }
}

impl WireEncode for CrateSummary {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.index);
        put_str(buf, &self.label)?;
        put_seq(buf, &self.modules)?;
        Ok(())
    }
}

impl WireDecode for CrateSummary {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            index: r.u8("crate index")?,
            label: r.string("crate label")?,
            modules: r.seq()?,
        })
    }
}

impl WireEncode for CrateStatus {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16_le(self.event_max_override);
        buf.put_u8(u8::from(self.dead_time_release));
        buf.put_u16_le(self.acvt_ns);
        buf.put_u32_le(self.shadow_buf_bytes);
        buf.put_u32_le(self.shadow_max_bytes);
        Ok(())
    }
}

impl WireDecode for CrateStatus {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            event_max_override: r.u16("event max override")?,
            dead_time_release: r.bool("dead-time release")?,
            acvt_ns: r.u16("acvt")?,
            shadow_buf_bytes: r.u32("shadow buffer size")?,
            shadow_max_bytes: r.u32("shadow buffer max")?,
        })
    }
}

impl WireEncode for RegisterShape {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_str(buf, &self.name)?;
        buf.put_u32_le(self.offset);
        buf.put_u8(self.bits);
        buf.put_u16_le(self.array_length);
        Ok(())
    }
}

impl WireDecode for RegisterShape {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let name = r.string("register name")?;
        let offset = r.u32("register offset")?;
        let bits = r.u8("register width")?;
        if !(1..=32).contains(&bits) {
            return Err(DecodeError::Invalid {
                what: "register width",
                reason: format!("{bits} bits for '{name}'"),
            });
        }
        let array_length = r.u16("register array length")?;
        Ok(Self {
            name,
            offset,
            bits,
            array_length,
        })
    }
}

impl WireEncode for SubModuleInfo {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.index);
        put_str(buf, &self.kind)?;
        put_seq(buf, &self.registers)?;
        Ok(())
    }
}

impl WireDecode for SubModuleInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            index: r.u8("sub-module index")?,
            kind: r.string("sub-module kind")?,
            registers: r.seq()?,
        })
    }
}

impl WireEncode for ModuleInfo {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.index);
        put_str(buf, &self.kind)?;
        buf.put_u32_le(self.base_address);
        put_seq(buf, &self.registers)?;
        put_seq(buf, &self.submodules)?;
        Ok(())
    }
}

impl WireDecode for ModuleInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            index: r.u8("module index")?,
            kind: r.string("module kind")?,
            base_address: r.u32("module address")?,
            registers: r.seq()?,
            submodules: r.seq()?,
        })
    }
}

impl WireEncode for CrateInfo {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.index);
        put_str(buf, &self.label)?;
        self.status.encode(buf)?;
        put_seq(buf, &self.global_registers)?;
        put_seq(buf, &self.modules)?;
        Ok(())
    }
}

impl WireDecode for CrateInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            index: r.u8("crate index")?,
            label: r.string("crate label")?,
            status: CrateStatus::decode(r)?,
            global_registers: r.seq()?,
            modules: r.seq()?,
        })
    }
}

const SCOPE_CRATE: u8 = 0;
const SCOPE_MODULE: u8 = 1;
const SCOPE_SUBMODULE: u8 = 2;

impl WireEncode for RegisterTarget {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.crate_index);
        match self.scope {
            RegisterScope::Crate => buf.put_u8(SCOPE_CRATE),
            RegisterScope::Module {
                index,
                submodule: None,
            } => {
                buf.put_u8(SCOPE_MODULE);
                buf.put_u8(index);
            }
            RegisterScope::Module {
                index,
                submodule: Some(k),
            } => {
                buf.put_u8(SCOPE_SUBMODULE);
                buf.put_u8(index);
                buf.put_u8(k);
            }
        }
        Ok(())
    }
}

impl WireDecode for RegisterTarget {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let crate_index = r.u8("crate index")?;
        let scope = match r.u8("register scope")? {
            SCOPE_CRATE => RegisterScope::Crate,
            SCOPE_MODULE => RegisterScope::module(r.u8("module index")?),
            SCOPE_SUBMODULE => RegisterScope::Module {
                index: r.u8("module index")?,
                submodule: Some(r.u8("sub-module index")?),
            },
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "register scope",
                    tag,
                })
            }
        };
        Ok(Self { crate_index, scope })
    }
}

impl WireEncode for RegisterRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.target.encode(buf)?;
        match &self.selection {
            RegisterSelection::All => buf.put_u8(0),
            RegisterSelection::Named(name) => {
                buf.put_u8(1);
                put_str(buf, name)?;
            }
            RegisterSelection::Offset(offset) => {
                buf.put_u8(2);
                buf.put_u32_le(*offset);
            }
        }
        Ok(())
    }
}

impl WireDecode for RegisterRequest {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let target = RegisterTarget::decode(r)?;
        let selection = match r.u8("register selection")? {
            0 => RegisterSelection::All,
            1 => RegisterSelection::Named(r.string("register name")?),
            2 => RegisterSelection::Offset(r.u32("register offset")?),
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "register selection",
                    tag,
                })
            }
        };
        Ok(Self { target, selection })
    }
}

impl WireEncode for RegisterReading {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_str(buf, &self.name)?;
        buf.put_u32_le(self.offset);
        buf.put_u8(self.bits);
        put_seq(buf, &self.values)?;
        Ok(())
    }
}

impl WireDecode for RegisterReading {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            name: r.string("register name")?,
            offset: r.u32("register offset")?,
            bits: r.u8("register width")?,
            values: r.seq()?,
        })
    }
}

impl WireEncode for RegisterDump {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.target.encode(buf)?;
        put_seq(buf, &self.readings)?;
        Ok(())
    }
}

impl WireDecode for RegisterDump {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            target: RegisterTarget::decode(r)?,
            readings: r.seq()?,
        })
    }
}

impl WireEncode for HardwareFault {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(match self {
            Self::BusTimeout => 0,
            Self::BusError => 1,
            Self::AccessViolation => 2,
        });
        Ok(())
    }
}

impl WireDecode for HardwareFault {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        match r.u8("hardware fault")? {
            0 => Ok(Self::BusTimeout),
            1 => Ok(Self::BusError),
            2 => Ok(Self::AccessViolation),
            tag => Err(DecodeError::UnknownTag {
                what: "hardware fault",
                tag,
            }),
        }
    }
}

impl WireEncode for ModuleAccess {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u32_le(self.offset);
        buf.put_u8(self.width.bits());
        match self.op {
            AccessOp::Read => buf.put_u8(0),
            AccessOp::Write(value) => {
                buf.put_u8(1);
                buf.put_u32_le(value);
            }
        }
        Ok(())
    }
}

impl WireDecode for ModuleAccess {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let offset = r.u32("access offset")?;
        let bits = r.u8("access width")?;
        let width = AccessWidth::from_bits(u32::from(bits)).map_err(|reason| {
            DecodeError::Invalid {
                what: "access width",
                reason,
            }
        })?;
        let op = match r.u8("access op")? {
            0 => AccessOp::Read,
            1 => AccessOp::Write(r.u32("access value")?),
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "access op",
                    tag,
                })
            }
        };
        Ok(Self { offset, width, op })
    }
}

impl WireEncode for ModuleAccessRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.target.encode(buf)?;
        put_seq(buf, &self.accesses)?;
        Ok(())
    }
}

impl WireDecode for ModuleAccessRequest {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            target: RegisterTarget::decode(r)?,
            accesses: r.seq()?,
        })
    }
}

const SCALAR_EMPTY: u8 = 0;
const SCALAR_DOUBLE: u8 = 1;
const SCALAR_INTEGER: u8 = 2;
const SCALAR_KEYWORD: u8 = 3;
const SCALAR_RANGE: u8 = 4;
const SCALAR_STRING: u8 = 5;

impl WireEncode for ScalarValue {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Self::Empty => buf.put_u8(SCALAR_EMPTY),
            Self::Double { value, unit } => {
                buf.put_u8(SCALAR_DOUBLE);
                buf.put_f64_le(*value);
                put_str(buf, unit)?;
            }
            Self::Integer { value, unit } => {
                buf.put_u8(SCALAR_INTEGER);
                buf.put_i32_le(*value);
                put_str(buf, unit)?;
            }
            Self::Keyword(word) => {
                buf.put_u8(SCALAR_KEYWORD);
                put_str(buf, word)?;
            }
            Self::Range { first, last } => {
                buf.put_u8(SCALAR_RANGE);
                buf.put_u8(*first);
                buf.put_u8(*last);
            }
            Self::String(s) => {
                buf.put_u8(SCALAR_STRING);
                put_str(buf, s)?;
            }
        }
        Ok(())
    }
}

impl WireDecode for ScalarValue {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(match r.u8("scalar type")? {
            SCALAR_EMPTY => Self::Empty,
            SCALAR_DOUBLE => Self::Double {
                value: r.f64("double")?,
                unit: r.string("unit")?,
            },
            SCALAR_INTEGER => Self::Integer {
                value: r.i32("integer")?,
                unit: r.string("unit")?,
            },
            SCALAR_KEYWORD => Self::Keyword(r.string("keyword")?),
            SCALAR_RANGE => Self::Range {
                first: r.u8("range start")?,
                last: r.u8("range end")?,
            },
            SCALAR_STRING => Self::String(r.string("string")?),
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "scalar type",
                    tag,
                })
            }
        })
    }
}

const RUN_FLAG: u8 = 0x80;
const MAX_RUN: usize = 129;
const MAX_LITERALS: usize = 128;

/// Writes a scalar list with run-length compression.
///
/// A tag `0x80 | (n - 2)` is followed by one value standing for `n`
/// consecutive copies (2..=129). A tag `n - 1` is followed by `n` literal
/// values (1..=128). Vector indices are implicit: they count up from the
/// first value. The list is prefixed by its total length as `u16`.
fn put_scalars(buf: &mut BytesMut, values: &[ConfigScalar]) -> Result<(), EncodeError> {
    put_len(buf, "scalar list", values.len())?;
    let mut i = 0;
    while i < values.len() {
        let run = values[i..]
            .iter()
            .take(MAX_RUN)
            .take_while(|s| s.value == values[i].value)
            .count();
        if run >= 2 {
            buf.put_u8(RUN_FLAG | (run - 2) as u8);
            values[i].value.encode(buf)?;
            i += run;
            continue;
        }
        // Literal block up to the next run of two.
        let mut end = i + 1;
        while end < values.len()
            && end - i < MAX_LITERALS
            && !(end + 1 < values.len() && values[end].value == values[end + 1].value)
        {
            end += 1;
        }
        buf.put_u8((end - i - 1) as u8);
        for scalar in &values[i..end] {
            scalar.value.encode(buf)?;
        }
        i = end;
    }
    Ok(())
}

fn scalars(r: &mut WireReader<'_>) -> Result<Vec<ConfigScalar>, DecodeError> {
    let total = r.u16("scalar count")? as usize;
    let mut out: Vec<ConfigScalar> = Vec::with_capacity(total.min(r.remaining()));
    while out.len() < total {
        let tag = r.u8("scalar run")?;
        let (count, repeat) = if tag & RUN_FLAG != 0 {
            (usize::from(tag & !RUN_FLAG) + 2, true)
        } else {
            (usize::from(tag) + 1, false)
        };
        if out.len() + count > total {
            return Err(DecodeError::Invalid {
                what: "scalar run",
                reason: format!("{count} values overrun list of {total}"),
            });
        }
        if repeat {
            let value = ScalarValue::decode(r)?;
            for _ in 0..count {
                let vector_index = out.len() as u16;
                out.push(ConfigScalar {
                    vector_index,
                    value: value.clone(),
                });
            }
        } else {
            for _ in 0..count {
                let vector_index = out.len() as u16;
                out.push(ConfigScalar {
                    vector_index,
                    value: ScalarValue::decode(r)?,
                });
            }
        }
    }
    Ok(out)
}

fn put_node(buf: &mut BytesMut, node: &ConfigNode, depth: usize) -> Result<(), EncodeError> {
    if depth > MAX_CONFIG_DEPTH {
        return Err(EncodeError::TooDeep);
    }
    buf.put_u8(match node.kind {
        ConfigKind::Scalar => 0,
        ConfigKind::Block => 1,
    });
    buf.put_u8(u8::from(node.touched));
    buf.put_u16_le(node.ordinal);
    put_str(buf, &node.name)?;
    put_scalars(buf, &node.values)?;
    put_len(buf, "config children", node.children.len())?;
    for child in &node.children {
        put_node(buf, child, depth + 1)?;
    }
    Ok(())
}

impl WireEncode for ConfigNode {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_node(buf, self, 1)
    }
}

impl WireDecode for ConfigNode {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.enter("config depth", MAX_CONFIG_DEPTH)?;
        let node = decode_node(r);
        r.leave();
        node
    }
}

fn decode_node(r: &mut WireReader<'_>) -> Result<ConfigNode, DecodeError> {
    let kind = match r.u8("config node type")? {
        0 => ConfigKind::Scalar,
        1 => ConfigKind::Block,
        tag => {
            return Err(DecodeError::UnknownTag {
                what: "config node type",
                tag,
            })
        }
    };
    let touched = r.bool("touched flag")?;
    let ordinal = r.u16("block ordinal")?;
    let name = r.string("config name")?;
    let values = scalars(r)?;
    let children: Vec<ConfigNode> = r.seq()?;
    if kind == ConfigKind::Scalar && !children.is_empty() {
        return Err(DecodeError::Invalid {
            what: "config node",
            reason: format!("scalar '{name}' has children"),
        });
    }
    Ok(ConfigNode {
        name,
        kind,
        touched,
        ordinal,
        values,
        children,
    })
}

impl WireEncode for ConfigSnapshot {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_i64_le(self.captured_at().timestamp_millis());
        put_opt_str(buf, self.prefix())?;
        put_seq(buf, self.nodes())?;
        Ok(())
    }
}

impl WireDecode for ConfigSnapshot {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let millis = r.i64("capture time")?;
        let captured_at: DateTime<Utc> = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| DecodeError::Invalid {
                what: "capture time",
                reason: format!("{millis} ms is out of range"),
            })?;
        let prefix = opt_string(r, "prefix")?;
        let nodes = r.seq()?;
        Ok(Self::new(captured_at, prefix, nodes))
    }
}
