//! Forward Protocol Definitions
//!
//! This crate defines the wire framing and the forward request/response
//! message model shared by the socket engine and the forward multiplexer.

pub mod codec;
pub mod forward;

pub use codec::{CodecError, FrameCodec, FRAME_HEADER_LEN};
pub use forward::{
    paths, AliveType, DataType, ForwardInfo, ForwardType, MessageError, RegisterParams, StateType,
    UnRegisterParams,
};
