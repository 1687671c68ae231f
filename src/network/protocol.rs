//! Request/response envelopes carried in frames.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::codec::{put_str, DecodeError, EncodeError, WireReader};

/// Operations a controller answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestType {
    /// Liveness and version check, empty payload.
    Ping = 0,
    /// Enumerate crates.
    ListCrates = 1,
    /// Detailed description of one crate.
    CrateInfo = 2,
    /// Read a register set.
    ReadRegisters = 3,
    /// Dump the configuration tree, optionally filtered.
    ConfigDump = 4,
    /// Raw module reads and writes.
    ModuleAccess = 5,
}

impl RequestType {
    /// Maps a wire tag back to a request type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestType::Ping),
            1 => Some(RequestType::ListCrates),
            2 => Some(RequestType::CrateInfo),
            3 => Some(RequestType::ReadRegisters),
            4 => Some(RequestType::ConfigDump),
            5 => Some(RequestType::ModuleAccess),
            _ => None,
        }
    }

    /// Name for log output.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RequestType::Ping => "ping",
            RequestType::ListCrates => "list-crates",
            RequestType::CrateInfo => "crate-info",
            RequestType::ReadRegisters => "read-registers",
            RequestType::ConfigDump => "config-dump",
            RequestType::ModuleAccess => "module-access",
        }
    }
}

/// Outcome reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseStatus {
    /// Payload carries the result.
    Success = 0,
    /// Unknown crate or module.
    NotFound = 1,
    /// Malformed or unsupported request.
    InvalidRequest = 2,
    /// Register not exposed by the module.
    RegisterError = 3,
    /// Payload carries the fault class.
    HardwareError = 4,
    /// Payload carries the controller's protocol version.
    VersionMismatch = 5,
}

impl ResponseStatus {
    /// Maps a wire tag back to a status.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseStatus::Success),
            1 => Some(ResponseStatus::NotFound),
            2 => Some(ResponseStatus::InvalidRequest),
            3 => Some(ResponseStatus::RegisterError),
            4 => Some(ResponseStatus::HardwareError),
            5 => Some(ResponseStatus::VersionMismatch),
            _ => None,
        }
    }
}

/// One request frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// Echoed back in the response.
    pub request_id: u32,
    /// Operation.
    pub request_type: RequestType,
    /// Operation arguments.
    pub payload: Bytes,
    /// Client wall clock, ms since the epoch.
    pub timestamp: u64,
}

impl ControlRequest {
    /// Stamps a request with the current time.
    pub fn new(request_id: u32, request_type: RequestType, payload: Bytes) -> Self {
        Self {
            request_id,
            request_type,
            payload,
            timestamp: Utc::now().timestamp_millis() as u64,
        }
    }

    /// Serializes the envelope.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17 + self.payload.len());

        buf.put_u8(self.request_type as u8);
        buf.put_u32_le(self.request_id);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_u64_le(self.timestamp);

        buf.freeze()
    }

    /// Parses a complete envelope.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(data);

        let tag = r.u8("request type")?;
        let request_type = RequestType::from_u8(tag).ok_or(DecodeError::UnknownTag {
            what: "request type",
            tag,
        })?;
        let request_id = r.u32("request id")?;
        let payload_len = r.u32("payload length")? as usize;
        let payload = Bytes::copy_from_slice(r.take(payload_len, "request payload")?);
        let timestamp = r.u64("timestamp")?;
        r.finish()?;

        Ok(ControlRequest {
            request_id,
            request_type,
            payload,
            timestamp,
        })
    }

    /// Reads just the request id, for answering requests that fail to decode.
    #[must_use]
    pub fn peek_request_id(data: &[u8]) -> u32 {
        match data.get(1..5) {
            Some(id) => u32::from_le_bytes([id[0], id[1], id[2], id[3]]),
            None => 0,
        }
    }
}

/// One response frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    /// Id of the request being answered.
    pub request_id: u32,
    /// Outcome.
    pub status: ResponseStatus,
    /// Result, or fault detail for hardware errors.
    pub payload: Bytes,
    /// Human-readable detail for failures.
    pub error_message: String,
    /// Controller wall clock, ms since the epoch.
    pub timestamp: u64,
}

impl ControlResponse {
    /// Stamps a response with the current time.
    pub fn new(request_id: u32, status: ResponseStatus, payload: Bytes) -> Self {
        Self {
            request_id,
            status,
            payload,
            error_message: String::new(),
            timestamp: Utc::now().timestamp_millis() as u64,
        }
    }

    /// Successful response.
    pub fn success(request_id: u32, payload: Bytes) -> Self {
        Self::new(request_id, ResponseStatus::Success, payload)
    }

    /// Failure response without payload.
    pub fn error(request_id: u32, status: ResponseStatus, message: String) -> Self {
        Self {
            request_id,
            status,
            payload: Bytes::new(),
            error_message: message,
            timestamp: Utc::now().timestamp_millis() as u64,
        }
    }

    /// Returns `true` for [`ResponseStatus::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Serializes the envelope.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(21 + self.payload.len() + self.error_message.len());

        buf.put_u8(self.status as u8);
        buf.put_u32_le(self.request_id);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let error_bytes = self.error_message.as_bytes();
        buf.put_u32_le(error_bytes.len() as u32);
        buf.put_slice(error_bytes);

        buf.put_u64_le(self.timestamp);

        buf.freeze()
    }

    /// Parses a complete envelope.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(data);

        let tag = r.u8("response status")?;
        let status = ResponseStatus::from_u8(tag).ok_or(DecodeError::UnknownTag {
            what: "response status",
            tag,
        })?;
        let request_id = r.u32("request id")?;
        let payload_len = r.u32("payload length")? as usize;
        let payload = Bytes::copy_from_slice(r.take(payload_len, "response payload")?);

        let error_len = r.u32("message length")? as usize;
        let error_message = std::str::from_utf8(r.take(error_len, "error message")?)
            .map_err(|_| DecodeError::InvalidUtf8("error message"))?
            .to_owned();

        let timestamp = r.u64("timestamp")?;
        r.finish()?;

        Ok(ControlResponse {
            request_id,
            status,
            payload,
            error_message,
            timestamp,
        })
    }
}

/// Version-mismatch reply body: the version this side speaks.
pub fn version_payload(version: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u16_le(version);
    buf.freeze()
}

/// Ping reply body: controller name and its build's protocol version.
pub fn pong_payload(name: &str, version: u16) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    buf.put_u16_le(version);
    put_str(&mut buf, name)?;
    Ok(buf.freeze())
}

/// Decodes a [`pong_payload`].
pub fn decode_pong(data: &[u8]) -> Result<(u16, String), DecodeError> {
    let mut r = WireReader::new(data);
    let version = r.u16("protocol version")?;
    let name = r.string("controller name")?;
    r.finish()?;
    Ok((version, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_request_roundtrip() {
        let req = ControlRequest::new(42, RequestType::CrateInfo, Bytes::from_static(&[1]));
        let encoded = req.encode();
        let decoded = ControlRequest::decode(&encoded).unwrap();

        assert_eq!(decoded, req);
        assert_eq!(ControlRequest::peek_request_id(&encoded), 42);
    }

    #[test]
    fn test_control_response_roundtrip() {
        let resp = ControlResponse::error(
            7,
            ResponseStatus::RegisterError,
            "no register 'BADREG'".to_string(),
        );
        let decoded = ControlResponse::decode(&resp.encode()).unwrap();

        assert_eq!(decoded, resp);
        assert!(!decoded.is_success());
    }

    #[test]
    fn test_short_or_padded_envelopes_fail() {
        let req = ControlRequest::new(1, RequestType::Ping, Bytes::new()).encode();
        assert!(ControlRequest::decode(&req[..10]).is_err());

        let mut padded = req.to_vec();
        padded.push(0xff);
        assert_eq!(
            ControlRequest::decode(&padded),
            Err(DecodeError::TrailingBytes(1))
        );

        let mut bad = req.to_vec();
        bad[0] = 200;
        assert!(matches!(
            ControlRequest::decode(&bad),
            Err(DecodeError::UnknownTag { tag: 200, .. })
        ));
    }

    #[test]
    fn test_pong_payload() {
        let (version, name) = decode_pong(&pong_payload("mock", 1).unwrap()).unwrap();
        assert_eq!(version, 1);
        assert_eq!(name, "mock");
    }
}
