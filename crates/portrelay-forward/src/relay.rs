//! Message relay seam
//!
//! The remote transport and peer discovery live outside this crate; they
//! are consumed through the `MessageRelay` trait. `ForwardSender` speaks
//! the named `TcpForward/*` operations over that seam, and
//! `RelayForwarder` bridges the synchronous request predicate onto the
//! async relay.

use crate::multiplexer::RequestHandler;
use async_trait::async_trait;
use bytes::Bytes;
use portrelay_proto::{paths, ForwardInfo, MessageError, RegisterParams, UnRegisterParams};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout")]
    Timeout,
}

/// Abstract message relay to the remote party.
///
/// `send` is fire-and-forget; `request` is request-reply. Implementations
/// deliver replies and pushed messages on whatever task their transport
/// runs on.
#[async_trait]
pub trait MessageRelay: Send + Sync {
    async fn send(&self, path: &str, data: Bytes) -> Result<(), RelayError>;

    async fn request(&self, path: &str, data: Bytes) -> Result<Bytes, RelayError>;
}

/// Client for the named `TcpForward/*` relay operations
pub struct ForwardSender {
    relay: Arc<dyn MessageRelay>,
}

impl ForwardSender {
    pub fn new(relay: Arc<dyn MessageRelay>) -> Self {
        Self { relay }
    }

    /// Fire-and-forget forward slice toward the remote peer.
    pub async fn send_request(&self, info: &ForwardInfo) -> Result<(), RelayError> {
        self.relay
            .send(paths::REQUEST, info.to_bytes()?.into())
            .await
    }

    /// Fire-and-forget response back toward the originating side.
    pub async fn send_response(&self, info: &ForwardInfo) -> Result<(), RelayError> {
        self.relay
            .send(paths::RESPONSE, info.to_bytes()?.into())
            .await
    }

    /// Ports the remote party is currently forwarding.
    pub async fn get_ports(&self) -> Result<Vec<u16>, RelayError> {
        let reply = self.relay.request(paths::GET_PORTS, Bytes::new()).await?;
        bincode::deserialize(&reply).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    pub async fn register(&self, params: &RegisterParams) -> Result<bool, RelayError> {
        let data = bincode::serialize(params).map_err(|e| RelayError::Protocol(e.to_string()))?;
        let reply = self.relay.request(paths::REGISTER, data.into()).await?;
        bincode::deserialize(&reply).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    pub async fn unregister(&self, params: &UnRegisterParams) -> Result<bool, RelayError> {
        let data = bincode::serialize(params).map_err(|e| RelayError::Protocol(e.to_string()))?;
        let reply = self.relay.request(paths::UNREGISTER, data.into()).await?;
        bincode::deserialize(&reply).map_err(|e| RelayError::Protocol(e.to_string()))
    }
}

/// Request handler that pumps accepted slices onto the relay.
///
/// The predicate runs on the connection's receive task, so slices are
/// queued onto an unbounded channel and shipped by a dedicated task;
/// per-connection ordering is preserved by the channel.
pub struct RelayForwarder {
    tx: mpsc::UnboundedSender<ForwardInfo>,
}

impl RelayForwarder {
    pub fn spawn(sender: ForwardSender) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ForwardInfo>();
        tokio::spawn(async move {
            while let Some(info) = rx.recv().await {
                if let Err(e) = sender.send_request(&info).await {
                    warn!(
                        "Failed to relay request {} slice: {}",
                        info.request_id, e
                    );
                }
            }
        });
        Arc::new(Self { tx })
    }
}

impl RequestHandler for RelayForwarder {
    fn on_request(&self, info: ForwardInfo) -> bool {
        self.tx.send(info).is_ok()
    }
}
