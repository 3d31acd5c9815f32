//! Shared test infrastructure for Taskhub integration tests.
//!
//! Provides TestEnv helper which runs a hub on an ephemeral port, plus a raw
//! WebSocket connection for checking frames on the wire.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use taskhub::auth::basic_header;
use taskhub::{Client, ClientConfig, ClientTask, Hub, HubConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// How long to listen before concluding no frame is coming.
pub const QUIET: Duration = Duration::from_millis(200);

/// Identities every test hub accepts.
pub const IDENTITIES: &[&str] = &["alice", "bob", "carol"];

/// Key of a test identity.
pub fn key_of(identity: &str) -> String {
    format!("{}-key", identity)
}

/// Test environment with a running hub.
pub struct TestEnv {
    pub hub: Hub,
    pub addr: SocketAddr,
}

impl TestEnv {
    /// Start a hub on an ephemeral port that accepts [`IDENTITIES`].
    pub async fn new() -> Self {
        let mut hub = Hub::new(HubConfig::local(0).with_log_target("test-hub"));
        for identity in IDENTITIES {
            hub.add_credential(*identity, key_of(identity));
        }
        let addr = hub.start().await.expect("Failed to start hub");
        Self { hub, addr }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Client config for a known identity.
    pub fn config(&self, identity: &str) -> ClientConfig {
        ClientConfig::new(self.url(), identity, key_of(identity)).with_log_target(format!("test-client-{}", identity))
    }

    /// Connect a client as a known identity.
    pub async fn client(&self, identity: &str) -> Client {
        Client::create(self.config(identity))
            .await
            .expect("Failed to connect client")
    }

    /// Open a raw WebSocket connection as a known identity.
    pub async fn raw(&self, identity: &str) -> RawConn {
        RawConn::connect(&self.url(), identity, &key_of(identity))
            .await
            .expect("Failed to open raw connection")
    }

    /// Wait until the hub lists `identity` as connected.
    pub async fn wait_connected(&self, identity: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.hub.connected_identities().iter().any(|i| i == identity) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "Expected '{}' to be connected",
                identity
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A WebSocket connection speaking raw frames.
pub struct RawConn {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawConn {
    pub async fn connect(url: &str, identity: &str, key: &str) -> Result<Self, tungstenite::Error> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&basic_header(identity, key)).expect("Invalid header"),
        );
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self { ws })
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::text(text.to_string()))
            .await
            .expect("Failed to send frame");
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    /// Next text frame, parsed as JSON. Panics after [`WAIT`].
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.next_json())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Connection closed while waiting for a frame")
    }

    /// Assert nothing arrives within [`QUIET`].
    pub async fn assert_quiet(&mut self) {
        if let Ok(Some(frame)) = tokio::time::timeout(QUIET, self.next_json()).await {
            panic!("Expected no frame, got {}", frame);
        }
    }

    /// Subscribe and consume the acknowledgement.
    pub async fn subscribe(&mut self, action: &str) {
        self.send_json(serde_json::json!({"cmd": "sub", "action": action}))
            .await;
        let ack = self.recv().await;
        assert_eq!(ack["status"], "ok", "Unexpected reply to sub: {}", ack);
    }

    async fn next_json(&mut self) -> Option<Value> {
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).expect("Hub sent invalid JSON"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    }
}

/// Build an `init` frame.
pub fn init_frame(task_id: &str, event_id: &str, action: &str, payload: Value) -> Value {
    serde_json::json!({
        "cmd": "pub",
        "taskId": task_id,
        "eventId": event_id,
        "event": "init",
        "action": action,
        "payload": payload,
    })
}

/// Subscription callback forwarding every handle to a channel.
pub fn forward() -> (impl Fn(ClientTask) + Send + Sync + 'static, mpsc::UnboundedReceiver<ClientTask>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |task: ClientTask| {
        let _ = tx.send(task);
    };
    (callback, rx)
}

/// Next forwarded handle. Panics after [`WAIT`].
pub async fn next_task(rx: &mut mpsc::UnboundedReceiver<ClientTask>) -> ClientTask {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timed out waiting for a task event")
        .expect("Callback channel closed")
}

/// A localhost port nothing listens on right now.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    listener.local_addr().expect("No local addr").port()
}
