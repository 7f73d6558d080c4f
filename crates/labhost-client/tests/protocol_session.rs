//! Integration tests for a full protocol session over a real TCP socket.
//!
//! Each test starts a scripted host on `127.0.0.1:0`, opens a [`Transport`]
//! to it and drives a [`ProtocolClient`] through its public API, the same way
//! the `labhost` binary does.
//!
//! ```text
//! scripted host                         ProtocolClient
//! ─────────────                         ──────────────
//! initialize, state  ─────────────────► initialize()  → Accepted
//!                    ◄───────────────── request(a), request(b)
//! response(b), response(a) ───────────► both requests resolve
//! state {partial}    ─────────────────► observer sees merged snapshot
//!                    ◄───────────────── close()
//! ```

use std::sync::Arc;

use labhost_client::application::protocol_client::{
    ClientError, ClientOptions, Handshake, Lifecycle, ProtocolClient,
};
use labhost_client::infrastructure::transport::{OpenOptions, Transport};
use labhost_core::FailureReason;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const HANDSHAKE: &str = concat!(
    r#"{"type":"initialize","identifier":"bench-1","version":3,"staticUrl":null}"#,
    "\n",
    r#"{"type":"state","data":{"name":"Bench 1","power":"off","slots":4}}"#,
    "\n",
);

async fn write_json(write: &mut OwnedWriteHalf, doc: Value) {
    let mut line = serde_json::to_vec(&doc).unwrap();
    line.push(b'\n');
    write.write_all(&line).await.unwrap();
}

/// Binds a listener and runs `script` on the first accepted connection.
async fn scripted_host<F, Fut>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>, OwnedWriteHalf) -> Fut
        + Send
        + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        script(BufReader::new(read).lines(), write).await;
    });
    (port, task)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_handshake_requests_and_state_updates() {
    // Arrange – the host answers two requests in reverse order, then pushes
    // a partial state update and waits for the client to hang up.
    let (port, host) = scripted_host(|mut lines, mut write| async move {
        write.write_all(HANDSHAKE.as_bytes()).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            let line = lines.next_line().await.unwrap().unwrap();
            let request: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["type"], "request");
            received.push(request);
        }
        for request in received.iter().rev() {
            write_json(
                &mut write,
                json!({"type": "response", "id": request["id"], "data": {"echo": request["data"]}}),
            )
            .await;
        }
        write_json(&mut write, json!({"type": "state", "data": {"power": "on"}})).await;

        while lines.next_line().await.unwrap().is_some() {}
    })
    .await;

    let transport = Transport::open(OpenOptions::tcp("127.0.0.1", port)).await.unwrap();
    let (tx, mut states) = mpsc::unbounded_channel();
    let client = Arc::new(ProtocolClient::with_options(
        transport,
        ClientOptions::default().with_state_observer(tx),
    ));

    // Act – handshake
    let handshake = client.initialize().await.unwrap();

    // Assert
    let Handshake::Accepted(info) = handshake else {
        panic!("expected handshake to be accepted, got {handshake:?}")
    };
    assert_eq!(info.identifier, "bench-1");
    assert_eq!(info.version, 3);
    assert_eq!(info.name.as_deref(), Some("Bench 1"));
    assert_eq!(client.lifecycle(), Lifecycle::Ready);

    // Act – two concurrent requests
    let running = Arc::clone(&client).spawn();
    let (first, second) = tokio::join!(client.request(json!("first")), client.request(json!("second")));

    // Assert – each caller gets its own answer despite the reordering
    let mut answers = vec![first.unwrap(), second.unwrap()];
    answers.sort_by_key(|v| v.to_string());
    assert_eq!(answers, vec![json!({"echo": "first"}), json!({"echo": "second"})]);

    // Assert – the update is merged into the snapshot
    let merged = states.recv().await.unwrap();
    assert_eq!(merged, json!({"name": "Bench 1", "power": "on", "slots": 4}));
    assert_eq!(client.state(), merged);

    // Act – hang up
    client.close().await;

    // Assert
    assert!(running.await.unwrap().is_ok());
    assert_eq!(client.lifecycle(), Lifecycle::Closed);
    assert!(matches!(client.request(json!("late")).await, Err(ClientError::Closed)));
    host.await.unwrap();
}

#[tokio::test]
async fn test_host_disconnect_rejects_pending_request() {
    // Arrange – the host reads one request and disappears without answering
    let (port, host) = scripted_host(|mut lines, mut write| async move {
        write.write_all(HANDSHAKE.as_bytes()).await.unwrap();
        let _ = lines.next_line().await.unwrap();
    })
    .await;

    let transport = Transport::open(OpenOptions::tcp("127.0.0.1", port)).await.unwrap();
    let client = Arc::new(ProtocolClient::new(transport));
    assert!(matches!(client.initialize().await.unwrap(), Handshake::Accepted(_)));
    let running = Arc::clone(&client).spawn();

    // Act
    let outcome = client.request(json!({"op": "reboot"})).await;

    // Assert
    assert!(matches!(outcome, Err(ClientError::Closed)));
    assert!(running.await.unwrap().is_ok());
    assert_eq!(client.pending_count(), 0);
    client.close().await;
    host.await.unwrap();
}

#[tokio::test]
async fn test_host_opening_with_state_is_rejected() {
    // Arrange – wrong first message
    let (port, host) = scripted_host(|mut lines, mut write| async move {
        write_json(&mut write, json!({"type": "state", "data": {}})).await;
        while lines.next_line().await.unwrap().is_some() {}
    })
    .await;

    let transport = Transport::open(OpenOptions::tcp("127.0.0.1", port)).await.unwrap();
    let client = ProtocolClient::new(transport);

    // Act
    let handshake = client.initialize().await.unwrap();

    // Assert
    assert_eq!(handshake, Handshake::Rejected(FailureReason::InvalidProtocol));
    assert_eq!(client.lifecycle(), Lifecycle::Closed);
    client.close().await;
    host.await.unwrap();
}

#[tokio::test]
async fn test_unparseable_line_stops_running_loop() {
    // Arrange
    let (port, host) = scripted_host(|mut lines, mut write| async move {
        write.write_all(HANDSHAKE.as_bytes()).await.unwrap();
        write.write_all(b"{not json}\n").await.unwrap();
        while lines.next_line().await.unwrap().is_some() {}
    })
    .await;

    let transport = Transport::open(OpenOptions::tcp("127.0.0.1", port)).await.unwrap();
    let client = Arc::new(ProtocolClient::new(transport));
    assert!(matches!(client.initialize().await.unwrap(), Handshake::Accepted(_)));

    // Act
    let outcome = client.run().await;

    // Assert
    assert!(matches!(outcome, Err(ClientError::Frame(_))));
    assert_eq!(client.lifecycle(), Lifecycle::Closed);
    client.close().await;
    host.await.unwrap();
}
