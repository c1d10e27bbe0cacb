//! Connection and listener registries
//!
//! Concurrent maps tracking live forwarded connections (keyed by request
//! id) and bound listeners (keyed by source port). Removal is idempotent,
//! always closes the underlying socket, and swallows cleanup failures.

use dashmap::DashMap;
use portrelay_proto::{AliveType, DataType, ForwardInfo, ForwardType, StateType};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct EntryState {
    data_type: DataType,
    connect_sent: bool,
    cache: Vec<u8>,
}

/// One live forwarded connection.
///
/// Owns the write half of the client socket; the read half lives in the
/// connection's receive task, which exits when the entry is cancelled.
pub struct ForwardEntry {
    request_id: u32,
    source_port: u16,
    alive_type: AliveType,
    forward_type: ForwardType,
    state: StdMutex<EntryState>,
    writer: Mutex<OwnedWriteHalf>,
    resume: Notify,
    cancel: CancellationToken,
}

impl ForwardEntry {
    pub fn new(
        request_id: u32,
        source_port: u16,
        alive_type: AliveType,
        forward_type: ForwardType,
        writer: OwnedWriteHalf,
    ) -> Self {
        Self {
            request_id,
            source_port,
            alive_type,
            forward_type,
            state: StdMutex::new(EntryState {
                data_type: DataType::Connect,
                connect_sent: false,
                cache: Vec::new(),
            }),
            writer: Mutex::new(writer),
            resume: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn alive_type(&self) -> AliveType {
        self.alive_type
    }

    pub fn forward_type(&self) -> ForwardType {
        self.forward_type
    }

    pub fn data_type(&self) -> DataType {
        self.state.lock().unwrap().data_type
    }

    /// Snapshot this connection's state into a `ForwardInfo` slice.
    pub fn info(&self, state_type: StateType, payload: Vec<u8>) -> ForwardInfo {
        ForwardInfo {
            request_id: self.request_id,
            source_port: self.source_port,
            alive_type: self.alive_type,
            forward_type: self.forward_type,
            data_type: self.data_type(),
            state_type,
            target_endpoint: Vec::new(),
            payload,
        }
    }

    /// Record that the owner was handed this connection's Connect
    /// notification. Until then no lifecycle slice for this request has
    /// left the process, so teardown stays silent.
    pub fn mark_connected(&self) {
        self.state.lock().unwrap().connect_sent = true;
    }

    pub fn connect_delivered(&self) -> bool {
        self.state.lock().unwrap().connect_sent
    }

    /// Transition Connect -> Forward. Returns whether this call performed
    /// the transition.
    pub fn begin_forward(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.data_type == DataType::Connect {
            state.data_type = DataType::Forward;
            true
        } else {
            false
        }
    }

    /// Stash bytes that arrived before the target was confirmed.
    pub fn append_cache(&self, bytes: &[u8]) {
        self.state.lock().unwrap().cache.extend_from_slice(bytes);
    }

    pub fn take_cache(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().cache)
    }

    pub async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await
    }

    /// Unblock the receive loop after the relay confirmed the target.
    pub fn resume(&self) {
        self.resume.notify_one();
    }

    pub async fn resumed(&self) {
        self.resume.notified().await;
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Best-effort close: stop the receive task and shut the socket down.
    /// Failures on an already-gone socket are swallowed.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Live forwarded connections keyed by request id
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<u32, Arc<ForwardEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, entry: Arc<ForwardEntry>) -> bool {
        let id = entry.request_id();
        self.entries.insert(id, entry).is_none()
    }

    pub fn get(&self, request_id: u32) -> Option<Arc<ForwardEntry>> {
        self.entries.get(&request_id).map(|e| e.value().clone())
    }

    /// Remove and close a connection. Safe no-op when already removed.
    pub async fn remove(&self, request_id: u32) -> Option<Arc<ForwardEntry>> {
        match self.entries.remove(&request_id) {
            Some((_, entry)) => {
                debug!("Removing forwarded connection {}", request_id);
                entry.close().await;
                Some(entry)
            }
            None => None,
        }
    }

    /// Remove every connection accepted on `source_port`.
    pub async fn clear_by_port(&self, source_port: u16) {
        let ids: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.value().source_port() == source_port)
            .map(|e| *e.key())
            .collect();
        for id in ids {
            self.remove(id).await;
        }
    }

    pub async fn clear_all(&self) {
        let ids: Vec<u32> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove(id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A bound listener's accept task handle
pub struct ListenerEntry {
    source_port: u16,
    cancel: CancellationToken,
}

impl ListenerEntry {
    pub fn new(source_port: u16, cancel: CancellationToken) -> Self {
        Self {
            source_port,
            cancel,
        }
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    /// Stop the accept loop; the task drops the listening socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Bound listeners keyed by source port
#[derive(Default)]
pub struct ListenerRegistry {
    entries: DashMap<u16, ListenerEntry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.entries.contains_key(&port)
    }

    pub fn insert(&self, entry: ListenerEntry) -> bool {
        let port = entry.source_port();
        self.entries.insert(port, entry).is_none()
    }

    /// Remove a listener and stop its accept loop. Idempotent.
    pub fn remove(&self, port: u16) -> Option<ListenerEntry> {
        self.entries.remove(&port).map(|(_, entry)| {
            entry.close();
            entry
        })
    }

    /// Remove all listeners, returning the ports that were bound.
    pub fn clear_all(&self) -> Vec<u16> {
        let ports: Vec<u16> = self.entries.iter().map(|e| *e.key()).collect();
        for &port in &ports {
            self.remove(port);
        }
        ports
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
