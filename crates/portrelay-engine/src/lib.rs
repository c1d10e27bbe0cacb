//! Framed TCP socket engine
//!
//! Accepts inbound connections and runs one receive loop per socket:
//! arriving bytes are appended to the connection's buffer, complete frames
//! are handed to the subscriber, and bytes already available on the socket
//! are drained without an extra await before the next registered read.
//! Read failures, zero-length reads, and disconnects are terminal for the
//! connection and are never retried here.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use portrelay_proto::{CodecError, FrameCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default per-connection receive buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
}

/// Subscriber receiving every decoded frame
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn on_frame(&self, conn: &ConnectionHandle, frame: Bytes);
}

/// Per-connection error callback, invoked once on the terminal failure
pub type ErrorCallback = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// Write side of a registered connection.
///
/// Cloneable handle; `send` frames the payload before writing.
#[derive(Clone)]
pub struct ConnectionHandle {
    peer_addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Frame and send a payload.
    pub async fn send(&self, payload: &[u8]) -> Result<(), EngineError> {
        let framed = FrameCodec::frame(payload);
        let mut writer = self.writer.lock().await;
        writer.write_all(&framed).await?;
        Ok(())
    }

    /// Stop the receive loop and release the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Framed TCP accept/receive engine
pub struct SocketEngine {
    sink: Arc<dyn FrameSink>,
    buffer_size: usize,
    cancel: CancellationToken,
}

impl SocketEngine {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            buffer_size: DEFAULT_BUFFER_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Bind `port` (0 for ephemeral) and start accepting.
    ///
    /// Returns the actually bound port.
    pub async fn start(&self, port: u16) -> Result<u16, EngineError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| EngineError::Bind { port, source })?;
        let local_port = listener.local_addr()?.port();

        info!("Socket engine listening on port {}", local_port);

        let sink = self.sink.clone();
        let buffer_size = self.buffer_size;
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted framed connection from {}", peer_addr);
                        spawn_connection(
                            stream,
                            peer_addr,
                            sink.clone(),
                            None,
                            buffer_size,
                            cancel.child_token(),
                        );
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        });

        Ok(local_port)
    }

    /// Register an already-established socket for framed receive.
    ///
    /// Used when another component hands off a connection instead of the
    /// engine accepting it locally.
    pub fn bind_receive(
        &self,
        stream: TcpStream,
        error_callback: Option<ErrorCallback>,
    ) -> Result<ConnectionHandle, EngineError> {
        let peer_addr = stream.peer_addr()?;
        Ok(spawn_connection(
            stream,
            peer_addr,
            self.sink.clone(),
            error_callback,
            self.buffer_size,
            self.cancel.child_token(),
        ))
    }

    /// Stop accepting and tear down every connection loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    sink: Arc<dyn FrameSink>,
    error_callback: Option<ErrorCallback>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> ConnectionHandle {
    let (read_half, write_half) = stream.into_split();
    let handle = ConnectionHandle {
        peer_addr,
        writer: Arc::new(Mutex::new(write_half)),
        cancel,
    };

    let loop_handle = handle.clone();
    tokio::spawn(async move {
        receive_loop(read_half, loop_handle, sink, error_callback, buffer_size).await;
    });

    handle
}

async fn receive_loop(
    mut read_half: OwnedReadHalf,
    handle: ConnectionHandle,
    sink: Arc<dyn FrameSink>,
    error_callback: Option<ErrorCallback>,
    buffer_size: usize,
) {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(buffer_size);

    let err = 'recv: loop {
        buf.reserve(buffer_size);
        let res = tokio::select! {
            _ = handle.cancel.cancelled() => return,
            res = read_half.read_buf(&mut buf) => res,
        };
        match res {
            Ok(0) => break EngineError::Closed,
            Ok(_) => {}
            Err(e) => break EngineError::Io(e),
        }

        if let Err(e) = deliver_frames(&mut codec, &mut buf, &sink, &handle).await {
            break e;
        }

        // Drain whatever is already available without re-awaiting; bounded
        // by currently readable bytes, never a blocking wait.
        loop {
            buf.reserve(buffer_size);
            match read_half.try_read_buf(&mut buf) {
                Ok(0) => break 'recv EngineError::Closed,
                Ok(_) => {
                    if let Err(e) = deliver_frames(&mut codec, &mut buf, &sink, &handle).await {
                        break 'recv e;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => break 'recv EngineError::Io(e),
            }
        }
    };

    debug!("Connection {} closed: {}", handle.peer_addr, err);
    if let Some(callback) = &error_callback {
        callback(&err);
    }
    handle.close();
    // Terminal failures also release the write half, even while a caller
    // still holds the handle.
    let _ = handle.writer.lock().await.shutdown().await;
}

async fn deliver_frames(
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
    sink: &Arc<dyn FrameSink>,
    handle: &ConnectionHandle,
) -> Result<(), EngineError> {
    while let Some(frame) = codec.decode(buf)? {
        sink.on_frame(handle, frame).await;
    }
    Ok(())
}
