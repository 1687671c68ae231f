//! Wire protocol between control clients and controllers.

pub mod codec;
pub mod frame;
pub mod protocol;

pub use codec::{DecodeError, EncodeError, WireDecode, WireEncode};
pub use frame::{FrameError, DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION};
pub use protocol::{ControlRequest, ControlResponse, RequestType, ResponseStatus};
