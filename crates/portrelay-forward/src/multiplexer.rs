//! Forward multiplexer
//!
//! Per listening port, accepts client connections and mediates their byte
//! streams through `ForwardInfo` slices correlated by request id. Every
//! inbound data slice and lifecycle transition goes through the
//! owner-supplied predicate; responses from the relay are applied back to
//! the local socket by request id, with unknown ids silently discarded.

use crate::http_connect::{CONNECT_ERROR, CONNECT_SUCCESS};
use crate::registry::{ConnectionRegistry, ForwardEntry, ListenerEntry, ListenerRegistry};
use portrelay_proto::{AliveType, ForwardInfo, ForwardType, StateType};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default per-connection receive buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owner-supplied predicate invoked for every inbound slice and lifecycle
/// transition. Returning `false` tears the connection down immediately and
/// synthesizes one Close notification through the same callback.
pub trait RequestHandler: Send + Sync {
    fn on_request(&self, info: ForwardInfo) -> bool;
}

/// Listening-state change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningChange {
    pub port: u16,
    pub listening: bool,
}

/// TCP forward multiplexer
pub struct ForwardMultiplexer {
    handler: Arc<dyn RequestHandler>,
    connections: Arc<ConnectionRegistry>,
    listeners: ListenerRegistry,
    next_request_id: Arc<AtomicU32>,
    listening_tx: broadcast::Sender<ListeningChange>,
    buffer_size: usize,
}

impl ForwardMultiplexer {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        let (listening_tx, _) = broadcast::channel(16);
        Self {
            handler,
            connections: Arc::new(ConnectionRegistry::new()),
            listeners: ListenerRegistry::new(),
            next_request_id: Arc::new(AtomicU32::new(1)),
            listening_tx,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Subscribe to listening-state changes.
    pub fn listening_changes(&self) -> broadcast::Receiver<ListeningChange> {
        self.listening_tx.subscribe()
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.listeners.contains(port)
    }

    /// Number of live forwarded connections.
    pub fn active_requests(&self) -> usize {
        self.connections.len()
    }

    /// Stash bytes that arrived for a request before its target was
    /// confirmed; delivered and cleared on the Success response.
    pub fn append_cache(&self, request_id: u32, bytes: &[u8]) -> bool {
        match self.connections.get(request_id) {
            Some(entry) => {
                entry.append_cache(bytes);
                true
            }
            None => false,
        }
    }

    /// Bind `port` (0 for ephemeral) and start accepting forward clients.
    ///
    /// Idempotent per port; returns the actually bound port, which becomes
    /// the `source_port` on every request accepted here.
    pub async fn start(
        &self,
        port: u16,
        alive_type: AliveType,
        forward_type: ForwardType,
    ) -> Result<u16, ForwardError> {
        if port != 0 && self.listeners.contains(port) {
            return Ok(port);
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ForwardError::Bind { port, source })?;
        let local_port = listener.local_addr()?.port();

        let cancel = CancellationToken::new();
        self.listeners
            .insert(ListenerEntry::new(local_port, cancel.clone()));

        info!("Forwarding {:?} connections on port {}", alive_type, local_port);
        let _ = self.listening_tx.send(ListeningChange {
            port: local_port,
            listening: true,
        });

        let handler = self.handler.clone();
        let connections = self.connections.clone();
        let next_request_id = self.next_request_id.clone();
        let buffer_size = self.buffer_size;

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let request_id = next_request_id.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Accepted forward client {} on port {} (request {})",
                            peer_addr, local_port, request_id
                        );

                        let (read_half, write_half) = stream.into_split();
                        let entry = Arc::new(ForwardEntry::new(
                            request_id,
                            local_port,
                            alive_type,
                            forward_type,
                            write_half,
                        ));
                        connections.insert(entry.clone());

                        let handler = handler.clone();
                        let connections = connections.clone();
                        tokio::spawn(async move {
                            run_connection(entry, read_half, handler, connections, buffer_size)
                                .await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept on port {}: {}", local_port, e);
                    }
                }
            }
            // Dropping the listener unbinds the port.
        });

        Ok(local_port)
    }

    /// Unbind `port` and close every request accepted on it.
    pub async fn stop(&self, port: u16) {
        if let Some(listener) = self.listeners.remove(port) {
            info!("Stopped forwarding on port {}", listener.source_port());
            let _ = self.listening_tx.send(ListeningChange {
                port,
                listening: false,
            });
            self.connections.clear_by_port(port).await;
        }
    }

    /// Unbind all listeners and close all requests.
    pub async fn stop_all(&self) {
        for port in self.listeners.clear_all() {
            let _ = self.listening_tx.send(ListeningChange {
                port,
                listening: false,
            });
        }
        self.connections.clear_all().await;
    }

    /// Apply a relay response to the originating local connection.
    ///
    /// Responses for unknown or already-removed request ids are discarded
    /// without error or registry mutation.
    pub async fn response(&self, info: ForwardInfo) {
        let Some(entry) = self.connections.get(info.request_id) else {
            debug!("Discarding response for unknown request {}", info.request_id);
            return;
        };

        match info.state_type {
            StateType::Success => {
                if entry.begin_forward() {
                    if entry.forward_type() == ForwardType::Proxy {
                        if entry.write(CONNECT_SUCCESS).await.is_err() {
                            self.connections.remove(info.request_id).await;
                            return;
                        }
                    } else {
                        let cache = entry.take_cache();
                        if !cache.is_empty()
                            && !self.handler.on_request(entry.info(StateType::Success, cache))
                        {
                            close_and_notify(&self.connections, &entry, self.handler.as_ref())
                                .await;
                            return;
                        }
                    }
                    entry.resume();
                }
                if !info.payload.is_empty() && entry.write(&info.payload).await.is_err() {
                    self.connections.remove(info.request_id).await;
                }
            }
            StateType::Close => {
                if entry.forward_type() == ForwardType::Proxy {
                    let _ = entry.write(CONNECT_ERROR).await;
                } else if !info.payload.is_empty() {
                    let _ = entry.write(&info.payload).await;
                }
                self.connections.remove(info.request_id).await;
            }
        }
    }
}

/// Remove a connection and synthesize exactly one Close notification.
///
/// Only the caller that actually removed the entry notifies, so a local
/// disconnect racing a relay-driven removal never produces two Closes.
/// Connections that die before the owner ever saw their Connect are
/// removed silently; a Close for an id the owner never learned would be
/// meaningless.
async fn close_and_notify(
    connections: &ConnectionRegistry,
    entry: &Arc<ForwardEntry>,
    handler: &dyn RequestHandler,
) {
    if connections.remove(entry.request_id()).await.is_some() && entry.connect_delivered() {
        handler.on_request(entry.info(StateType::Close, Vec::new()));
    }
}

async fn run_connection(
    entry: Arc<ForwardEntry>,
    mut read_half: OwnedReadHalf,
    handler: Arc<dyn RequestHandler>,
    connections: Arc<ConnectionRegistry>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];

    // Connect phase: Tunnel listeners signal immediately with an empty
    // payload, Interactive listeners wait for the first burst because it
    // carries the target.
    let connect_payload = match entry.alive_type() {
        AliveType::Tunnel => Vec::new(),
        AliveType::Interactive => {
            let read = tokio::select! {
                _ = entry.cancelled() => return,
                read = read_half.read(&mut buf) => read,
            };
            match read {
                Ok(0) | Err(_) => {
                    close_and_notify(&connections, &entry, handler.as_ref()).await;
                    return;
                }
                Ok(n) => buf[..n].to_vec(),
            }
        }
    };

    if !handler.on_request(entry.info(StateType::Success, connect_payload)) {
        close_and_notify(&connections, &entry, handler.as_ref()).await;
        return;
    }
    entry.mark_connected();

    // No further reads until the relay confirms the target.
    tokio::select! {
        _ = entry.cancelled() => return,
        _ = entry.resumed() => {}
    }

    loop {
        let read = tokio::select! {
            _ = entry.cancelled() => return,
            read = read_half.read(&mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => {
                close_and_notify(&connections, &entry, handler.as_ref()).await;
                return;
            }
            Ok(n) => {
                if !handler.on_request(entry.info(StateType::Success, buf[..n].to_vec())) {
                    close_and_notify(&connections, &entry, handler.as_ref()).await;
                    return;
                }
            }
        }
    }
}
