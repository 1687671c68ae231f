//! Error types for the control client.
//!
//! Every failure a caller can observe is a [`CtrlError`]. The variants fall into
//! five kinds (see [`ErrorKind`]) that are never collapsed into each other, so a
//! caller can, for example, retry hardware faults while aborting on protocol
//! errors:
//!
//! - **Connection**: the controller is unreachable, refused the connection,
//!   dropped it, or did not answer within the configured timeout.
//! - **Protocol**: a response could not be decoded against the expected
//!   schema, or the two sides speak different protocol versions.
//! - **NotFound**: the referenced crate or module does not exist on the
//!   controller right now. Re-enumerate and try again.
//! - **Register**: the request was well formed but names a register the
//!   module does not expose.
//! - **Hardware**: the controller reached the hardware and the access failed.
//!   Transient faults may be retried, see [`CtrlError::is_retriable`].
//!
//! Usage errors (bad addresses, bad settings, arguments too large to encode)
//! form a sixth kind that only occurs before any request is sent.

use std::time::Duration;

use thiserror::Error;

use crate::client::address::AddressError;
use crate::model::HardwareFault;
use crate::network::codec::{DecodeError, EncodeError};
use crate::network::frame::FrameError;

/// Convenience alias for results using the client error type.
pub type CtrlResult<T> = std::result::Result<T, CtrlError>;

/// Coarse classification of a [`CtrlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level failure.
    Connection,
    /// Malformed or version-mismatched exchange.
    Protocol,
    /// Unknown crate or module.
    NotFound,
    /// Register not exposed by the module.
    Register,
    /// Hardware access failed on the controller.
    Hardware,
    /// Invalid caller input or settings.
    Usage,
}

impl ErrorKind {
    /// Process exit code used by the command-line tool for this kind.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Connection => 2,
            Self::Protocol => 3,
            Self::NotFound => 4,
            Self::Register => 5,
            Self::Hardware => 6,
            Self::Usage => 64,
        }
    }

    /// Short label for log output.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::NotFound => "not-found",
            Self::Register => "register",
            Self::Hardware => "hardware",
            Self::Usage => "usage",
        }
    }
}

/// Errors returned by control client operations.
#[derive(Error, Debug)]
pub enum CtrlError {
    /// Socket-level failure while connecting, sending or receiving.
    #[error("Connection error while {context}: {source}")]
    Connection {
        /// What the client was doing.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The host name did not resolve to any address.
    #[error("Connection error: could not resolve '{0}'")]
    Unresolved(String),

    /// An operation was attempted without an open connection.
    #[error("Not connected to a controller")]
    NotConnected,

    /// A connect, send or receive step exceeded its deadline.
    #[error("Connection error: {stage} timed out after {after:?}")]
    Timeout {
        /// Which step timed out.
        stage: &'static str,
        /// The configured deadline.
        after: Duration,
    },

    /// The response payload did not match the expected schema.
    #[error("Protocol error: {0}")]
    Decode(#[from] DecodeError),

    /// Framing failure (bad magic, foreign version, oversized frame).
    #[error("Protocol error: {0}")]
    Frame(FrameError),

    /// The exchange itself was inconsistent.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The controller does not know the referenced crate or module.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The module does not expose the requested register.
    #[error("Register error: {0}")]
    Register(String),

    /// The controller reached the hardware but the access failed.
    #[error("Hardware error ({fault}): {message}")]
    Hardware {
        /// Fault class reported by the controller.
        fault: HardwareFault,
        /// Controller-provided detail.
        message: String,
    },

    /// Request arguments exceed what the wire format can carry.
    #[error("Request too large: {0}")]
    Encode(#[from] EncodeError),

    /// Invalid controller address.
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings loaded but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl CtrlError {
    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. }
            | Self::Unresolved(_)
            | Self::NotConnected
            | Self::Timeout { .. } => ErrorKind::Connection,
            Self::Decode(_) | Self::Protocol(_) => ErrorKind::Protocol,
            Self::Frame(err) => match err {
                FrameError::Io(_) => ErrorKind::Connection,
                _ => ErrorKind::Protocol,
            },
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Register(_) => ErrorKind::Register,
            Self::Hardware { .. } => ErrorKind::Hardware,
            Self::Encode(_) | Self::Address(_) | Self::Config(_) | Self::Configuration(_) => {
                ErrorKind::Usage
            }
        }
    }

    /// Returns `true` if repeating the same request may succeed.
    ///
    /// Only transient hardware faults qualify. Connection errors need a new
    /// connection first, and that decision belongs to the caller.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Hardware { fault, .. } if fault.is_transient())
    }

    /// Returns `true` if the error forces the connection closed.
    #[must_use]
    pub fn closes_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Protocol)
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connection {
            context: context.into(),
            source,
        }
    }
}

impl From<FrameError> for CtrlError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::Io(source) => Self::Connection {
                context: "reading a response".into(),
                source,
            },
            other => Self::Frame(other),
        }
    }
}

impl From<figment::Error> for CtrlError {
    fn from(value: figment::Error) -> Self {
        Self::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let kinds = [
            ErrorKind::Connection,
            ErrorKind::Protocol,
            ErrorKind::NotFound,
            ErrorKind::Register,
            ErrorKind::Hardware,
            ErrorKind::Usage,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn only_transient_hardware_faults_are_retriable() {
        let transient = CtrlError::Hardware {
            fault: HardwareFault::BusTimeout,
            message: "VME bus timeout".into(),
        };
        let persistent = CtrlError::Hardware {
            fault: HardwareFault::AccessViolation,
            message: "write to read-only register".into(),
        };
        assert!(transient.is_retriable());
        assert!(!persistent.is_retriable());
        assert!(!CtrlError::Protocol("bad".into()).is_retriable());
        assert!(!CtrlError::NotFound("crate 9".into()).is_retriable());
    }

    #[test]
    fn frame_io_errors_count_as_connection_errors() {
        let err: CtrlError =
            FrameError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).into();
        assert_eq!(err.kind(), ErrorKind::Connection);

        let err: CtrlError = FrameError::BadMagic([0, 1, 2, 3]).into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.closes_connection());
    }

    #[test]
    fn controller_reported_errors_keep_connection() {
        assert!(!CtrlError::NotFound("crate 99".into()).closes_connection());
        assert!(!CtrlError::Register("BADREG".into()).closes_connection());
    }
}
