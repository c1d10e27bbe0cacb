//! Loopback tests for the forward multiplexer

use portrelay_forward::{ForwardMultiplexer, ListeningChange, RequestHandler, CONNECT_ERROR};
use portrelay_proto::{AliveType, DataType, ForwardInfo, ForwardType, StateType};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

struct CollectHandler {
    tx: mpsc::UnboundedSender<ForwardInfo>,
}

impl RequestHandler for CollectHandler {
    fn on_request(&self, info: ForwardInfo) -> bool {
        let _ = self.tx.send(info);
        true
    }
}

/// Rejects Forward-phase data slices; everything else is accepted.
struct RejectForwardHandler {
    tx: mpsc::UnboundedSender<ForwardInfo>,
}

impl RequestHandler for RejectForwardHandler {
    fn on_request(&self, info: ForwardInfo) -> bool {
        let reject = info.state_type == StateType::Success && info.data_type == DataType::Forward;
        let _ = self.tx.send(info);
        !reject
    }
}

fn collecting_mux() -> (ForwardMultiplexer, mpsc::UnboundedReceiver<ForwardInfo>) {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    (ForwardMultiplexer::new(Arc::new(CollectHandler { tx })), rx)
}

async fn recv_info(rx: &mut mpsc::UnboundedReceiver<ForwardInfo>) -> ForwardInfo {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for request callback")
        .expect("handler channel closed")
}

fn success_response(request_id: u32, payload: Vec<u8>) -> ForwardInfo {
    ForwardInfo {
        request_id,
        source_port: 0,
        alive_type: AliveType::Interactive,
        forward_type: ForwardType::Tunnel,
        data_type: DataType::Connect,
        state_type: StateType::Success,
        target_endpoint: Vec::new(),
        payload,
    }
}

fn close_response(request_id: u32) -> ForwardInfo {
    ForwardInfo {
        state_type: StateType::Close,
        ..success_response(request_id, Vec::new())
    }
}

#[tokio::test]
async fn interactive_lifecycle_connect_forward_close() {
    let (mux, mut rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Interactive, ForwardType::Tunnel)
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"CONNECT example.com:443").await.unwrap();

    // First inbound burst arrives as the Connect notification.
    let connect = recv_info(&mut rx).await;
    assert_eq!(connect.source_port, port);
    assert_eq!(connect.data_type, DataType::Connect);
    assert_eq!(connect.state_type, StateType::Success);
    assert_eq!(connect.payload, b"CONNECT example.com:443");

    // Confirming the target resumes the receive loop.
    mux.response(success_response(connect.request_id, Vec::new()))
        .await;

    client.write_all(b"payload one").await.unwrap();
    let forward = recv_info(&mut rx).await;
    assert_eq!(forward.request_id, connect.request_id);
    assert_eq!(forward.data_type, DataType::Forward);
    assert_eq!(forward.payload, b"payload one");

    client.write_all(b"payload two").await.unwrap();
    let forward = recv_info(&mut rx).await;
    assert_eq!(forward.payload, b"payload two");

    // Disconnect produces exactly one Close.
    drop(client);
    let close = recv_info(&mut rx).await;
    assert_eq!(close.request_id, connect.request_id);
    assert_eq!(close.state_type, StateType::Close);
    assert_eq!(mux.active_requests(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn tunnel_mode_signals_connect_without_first_bytes() {
    let (mux, mut rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Tunnel, ForwardType::Tunnel)
        .await
        .unwrap();

    let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let connect = recv_info(&mut rx).await;
    assert_eq!(connect.data_type, DataType::Connect);
    assert!(connect.payload.is_empty());
}

#[tokio::test]
async fn disconnect_before_first_bytes_closes_silently() {
    let (mux, mut rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Interactive, ForwardType::Tunnel)
        .await
        .unwrap();

    // The client goes away before sending the first burst, so no Connect
    // was ever delivered for its request id.
    let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    drop(client);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mux.active_requests(), 0);
    // No Connect, and no Close for an id the owner never learned.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn cache_backlog_delivered_on_success() {
    let (mux, mut rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Tunnel, ForwardType::Tunnel)
        .await
        .unwrap();

    let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connect = recv_info(&mut rx).await;

    // Bytes buffered before the target was confirmed.
    assert!(mux.append_cache(connect.request_id, b"early bytes"));
    mux.response(success_response(connect.request_id, Vec::new()))
        .await;

    let replayed = recv_info(&mut rx).await;
    assert_eq!(replayed.request_id, connect.request_id);
    assert_eq!(replayed.data_type, DataType::Forward);
    assert_eq!(replayed.payload, b"early bytes");

    // The cache is cleared after delivery.
    mux.response(success_response(connect.request_id, Vec::new()))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn success_payload_written_to_local_socket() {
    let (mux, mut rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Interactive, ForwardType::Tunnel)
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let connect = recv_info(&mut rx).await;

    mux.response(success_response(connect.request_id, Vec::new()))
        .await;
    mux.response(success_response(connect.request_id, b"remote answer".to_vec()))
        .await;

    let mut read = vec![0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut read))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&read[..n], b"remote answer");
}

#[tokio::test]
async fn proxy_close_writes_error_template_and_removes() {
    let (mux, mut rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Interactive, ForwardType::Proxy)
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"CONNECT blocked.example:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let connect = recv_info(&mut rx).await;
    assert_eq!(mux.active_requests(), 1);

    mux.response(close_response(connect.request_id)).await;

    // The client sees the CONNECT error template, then EOF.
    let mut read = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut read))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, CONNECT_ERROR);
    assert_eq!(mux.active_requests(), 0);

    // Relay-driven removal does not echo a Close callback.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn response_for_unknown_request_is_ignored() {
    let (mux, _rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Interactive, ForwardType::Tunnel)
        .await
        .unwrap();

    mux.response(success_response(424242, b"orphan".to_vec()))
        .await;
    mux.response(close_response(424242)).await;

    assert_eq!(mux.active_requests(), 0);
    assert!(mux.is_listening(port));
}

#[tokio::test]
async fn request_ids_distinct_under_concurrent_accepts() {
    let (mux, mut rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Tunnel, ForwardType::Tunnel)
        .await
        .unwrap();

    let mut clients = Vec::new();
    for _ in 0..20 {
        clients.push(tokio::spawn(async move {
            TcpStream::connect(("127.0.0.1", port)).await.unwrap()
        }));
    }

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(recv_info(&mut rx).await.request_id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);

    for client in clients {
        drop(client.await.unwrap());
    }
}

#[tokio::test]
async fn stop_port_removes_only_matching_requests() {
    let (mux, mut rx) = collecting_mux();
    let mut changes = mux.listening_changes();

    let port_a = mux
        .start(0, AliveType::Tunnel, ForwardType::Tunnel)
        .await
        .unwrap();
    let port_b = mux
        .start(0, AliveType::Tunnel, ForwardType::Tunnel)
        .await
        .unwrap();

    assert_eq!(
        changes.recv().await.unwrap(),
        ListeningChange {
            port: port_a,
            listening: true
        }
    );
    assert_eq!(
        changes.recv().await.unwrap(),
        ListeningChange {
            port: port_b,
            listening: true
        }
    );

    let _client_a = TcpStream::connect(("127.0.0.1", port_a)).await.unwrap();
    let _client_b = TcpStream::connect(("127.0.0.1", port_b)).await.unwrap();
    let first = recv_info(&mut rx).await;
    let second = recv_info(&mut rx).await;
    assert_eq!(mux.active_requests(), 2);

    mux.stop(port_a).await;
    assert!(!mux.is_listening(port_a));
    assert!(mux.is_listening(port_b));
    assert_eq!(mux.active_requests(), 1);
    assert_eq!(
        changes.recv().await.unwrap(),
        ListeningChange {
            port: port_a,
            listening: false
        }
    );

    // The surviving request is the one accepted on the other port.
    let survivor = if first.source_port == port_b {
        first.request_id
    } else {
        second.request_id
    };
    assert!(mux.append_cache(survivor, b""));

    mux.stop_all().await;
    assert_eq!(mux.active_requests(), 0);
    assert!(!mux.is_listening(port_b));
}

#[tokio::test]
async fn start_is_idempotent_per_port() {
    let (mux, _rx) = collecting_mux();
    let port = mux
        .start(0, AliveType::Interactive, ForwardType::Tunnel)
        .await
        .unwrap();

    let again = mux
        .start(port, AliveType::Interactive, ForwardType::Tunnel)
        .await
        .unwrap();
    assert_eq!(again, port);
}

#[tokio::test]
async fn rejected_slice_tears_down_with_synthesized_close() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mux = ForwardMultiplexer::new(Arc::new(RejectForwardHandler { tx }));
    let port = mux
        .start(0, AliveType::Interactive, ForwardType::Tunnel)
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let connect = recv_info(&mut rx).await;
    assert_eq!(connect.data_type, DataType::Connect);

    mux.response(success_response(connect.request_id, Vec::new()))
        .await;

    // The first Forward slice is rejected by the owner.
    client.write_all(b"rejected data").await.unwrap();
    let forward = recv_info(&mut rx).await;
    assert_eq!(forward.data_type, DataType::Forward);

    let close = recv_info(&mut rx).await;
    assert_eq!(close.state_type, StateType::Close);
    assert_eq!(close.request_id, connect.request_id);
    assert_eq!(mux.active_requests(), 0);

    // The local socket is closed.
    let mut read = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut read))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}
