//! Forward request/response message model
//!
//! A `ForwardInfo` travels over the message relay in both directions: the
//! local side sends Connect/Forward slices as `TcpForward/Request`, the
//! remote side answers with `TcpForward/Response` carrying the same request
//! id. Payloads are bincode-encoded.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relay operation paths
pub mod paths {
    pub const REQUEST: &str = "TcpForward/Request";
    pub const RESPONSE: &str = "TcpForward/Response";
    pub const GET_PORTS: &str = "TcpForward/GetPorts";
    pub const REGISTER: &str = "TcpForward/Register";
    pub const UNREGISTER: &str = "TcpForward/UnRegister";
}

/// Message encode/decode errors
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Encode failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Decode failed: {0}")]
    Decode(#[source] bincode::Error),
}

/// Whether a listener waits for first client bytes before signaling Connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AliveType {
    /// Target is determined externally; Connect is signaled immediately
    /// with an empty payload.
    Tunnel,
    /// First inbound bytes carry the target (e.g. an HTTP CONNECT line);
    /// Connect is signaled with that first burst.
    Interactive,
}

/// Whether connect-phase replies are emulated as HTTP CONNECT responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardType {
    Tunnel,
    Proxy,
}

/// Lifecycle phase of a forwarded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Connect,
    Forward,
}

/// Outcome carried by a slice or response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateType {
    Success,
    Close,
}

/// One forwarded slice or lifecycle transition.
///
/// `request_id` is the sole correlation key between relay responses and the
/// originating local connection; it is unique while the connection is live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardInfo {
    pub request_id: u32,
    pub source_port: u16,
    pub alive_type: AliveType,
    pub forward_type: ForwardType,
    pub data_type: DataType,
    pub state_type: StateType,
    #[serde(with = "serde_bytes")]
    pub target_endpoint: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ForwardInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(MessageError::Encode)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(data).map_err(MessageError::Decode)
    }
}

/// Parameters for `TcpForward/Register`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterParams {
    pub source_port: u16,
    pub alive_type: AliveType,
    pub forward_type: ForwardType,
    #[serde(with = "serde_bytes")]
    pub target_endpoint: Vec<u8>,
}

/// Parameters for `TcpForward/UnRegister`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UnRegisterParams {
    pub source_port: u16,
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
