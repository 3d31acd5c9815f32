//! The hub: accepts connections, authenticates them and routes task events.
//!
//! The hub provides:
//! - Credential check on the WebSocket upgrade (401 before any frame is read)
//! - Subscription registry (action -> identities)
//! - A task store mirroring every task it has routed
//! - Fan-out of each applied event to the action's subscribers and the task's origin

use crate::auth::{Authenticator, Credentials, parse_basic};
use crate::error::Error;
use crate::protocol::{Request, Response, TaskView};
use crate::store::{MemoryStore, SharedTask, TaskStore};
use crate::task::Task;
use crate::types::{EventKind, TaskEvent};
use dashmap::DashMap;
use eyre::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default log target of hub records.
pub const DEFAULT_LOG_TARGET: &str = "taskhub::hub";

/// Configuration for the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to listen on; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,

    /// Target every log record of this hub is emitted with
    pub log_target: String,
}

impl HubConfig {
    /// Create config listening on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            log_target: DEFAULT_LOG_TARGET.to_string(),
        }
    }

    /// Create config listening on localhost.
    pub fn local(port: u16) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::local(DEFAULT_PORT)
    }
}

/// A sender for frames to one connection.
type ConnSender = mpsc::UnboundedSender<Message>;

struct Connection {
    id: u64,
    tx: ConnSender,
}

/// Routing state shared by every connection worker.
struct Router {
    log_target: String,
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn TaskStore>,

    /// Identity -> its open connections
    connections: DashMap<String, Vec<Connection>>,

    /// Action -> identities subscribed to it
    subscriptions: DashMap<String, HashSet<String>>,

    next_conn: AtomicU64,
}

struct Running {
    addr: SocketAddr,
    router: Arc<Router>,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

/// The task hub.
pub struct Hub {
    config: HubConfig,
    credentials: Arc<Credentials>,
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn TaskStore>,
    running: Option<Running>,
}

impl Hub {
    /// Create a hub with an in-memory store, authenticating against its own
    /// credential registry.
    pub fn new(config: HubConfig) -> Self {
        let credentials = Arc::new(Credentials::new());
        Self {
            config,
            authenticator: Arc::clone(&credentials) as Arc<dyn Authenticator>,
            credentials,
            store: Arc::new(MemoryStore::new()),
            running: None,
        }
    }

    /// Use another task store. Takes effect on the next `start`.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = store;
        self
    }

    /// Authenticate with something other than the built-in registry.
    ///
    /// `add_credential`/`remove_credential` no longer affect who may connect.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The task store the hub mirrors tasks in.
    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    /// Allow `identity` to connect with `key`.
    pub fn add_credential(&self, identity: impl Into<String>, key: impl Into<String>) {
        let identity = identity.into();
        log::info!(target: self.config.log_target.as_str(), "Credentials added for '{}'", identity);
        self.credentials.add(identity, key);
    }

    pub fn remove_credential(&self, identity: &str) -> bool {
        self.credentials.remove(identity)
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address. Calling it on a running hub is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.addr);
        }

        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind hub to {}", self.config.bind_addr))?;
        let addr = listener.local_addr().context("Failed to read hub address")?;

        log::info!(target: self.config.log_target.as_str(), "Hub listening on {}", addr);

        let router = Arc::new(Router {
            log_target: self.config.log_target.clone(),
            authenticator: Arc::clone(&self.authenticator),
            store: Arc::clone(&self.store),
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
            next_conn: AtomicU64::new(0),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let acceptor = tokio::spawn(Arc::clone(&router).accept_connections(listener, shutdown_rx));

        self.running = Some(Running {
            addr,
            router,
            shutdown,
            acceptor,
        });
        Ok(addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the hub listens on, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Stop accepting connections and close every open one.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            let _ = running.acceptor.await;
            log::info!(target: self.config.log_target.as_str(), "Hub stopped");
        }
    }

    /// Identities with at least one open connection.
    pub fn connected_identities(&self) -> Vec<String> {
        self.running
            .as_ref()
            .map(|r| r.router.connections.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Identities subscribed to `action`.
    pub fn subscribers(&self, action: &str) -> HashSet<String> {
        self.running
            .as_ref()
            .map(|r| r.router.subscribers(action))
            .unwrap_or_default()
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            running.acceptor.abort();
        }
    }
}

impl Router {
    /// Accept connections until shutdown is signalled.
    async fn accept_connections(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Arc::clone(&router).handle_connection(stream, peer, shutdown).await {
                                log::warn!(target: router.log_target.as_str(), "Connection error from {}: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!(target: self.log_target.as_str(), "Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },

                _ = shutdown.changed() => break,
            }
        }

        log::info!(target: self.log_target.as_str(), "Hub shutting down");
    }

    /// Authenticate, then process frames of one connection in order.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut identity = None;
        let authenticator = Arc::clone(&self.authenticator);
        let check_credentials = |req: &UpgradeRequest, resp: UpgradeResponse| -> std::result::Result<UpgradeResponse, ErrorResponse> {
            let presented = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_basic);
            match presented {
                Some((id, key)) if authenticator.authenticate(&id, &key) => {
                    identity = Some(id);
                    Ok(resp)
                }
                _ => Err(unauthorized()),
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, check_credentials).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!(target: self.log_target.as_str(), "Rejected connection from {}: {}", peer, e);
                return Ok(());
            }
        };
        let Some(identity) = identity else {
            return Ok(());
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let conn_id = self.register_connection(&identity, tx.clone());
        log::info!(
            target: self.log_target.as_str(),
            "Client '{}' connected from {} (connection {})",
            identity,
            peer,
            conn_id
        );

        let (mut sink, mut frames) = ws.split();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let outcome = loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&identity, &tx, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(eyre::eyre!("Failed to read frame: {}", e)),
                },

                _ = shutdown.changed() => break Ok(()),
            }
        };

        self.unregister_connection(&identity, conn_id);
        drop(tx);
        let _ = writer.await;
        log::info!(target: self.log_target.as_str(), "Client '{}' disconnected (connection {})", identity, conn_id);

        outcome
    }

    /// Dispatch one frame; errors go back to the sending connection only.
    async fn handle_frame(&self, identity: &str, tx: &ConnSender, raw: &str) {
        if let Err(e) = self.dispatch(identity, tx, raw).await {
            log::info!(target: self.log_target.as_str(), "Invalid frame from '{}': {}", identity, e);
            self.send(tx, &Response::error(&e, raw));
        }
    }

    async fn dispatch(&self, identity: &str, tx: &ConnSender, raw: &str) -> Result<(), Error> {
        match Request::parse(raw)? {
            Request::Sub { action } => {
                self.subscribe(identity, &action);
                self.send(tx, &Response::ack(format!("Client subscribed to {}.", action)));
                Ok(())
            }
            Request::Pub { task_id, event } => self.publish(identity, &task_id, event).await,
        }
    }

    fn subscribe(&self, identity: &str, action: &str) {
        let added = self
            .subscriptions
            .entry(action.to_string())
            .or_default()
            .insert(identity.to_string());
        if added {
            log::debug!(target: self.log_target.as_str(), "'{}' subscribed to {}", identity, action);
        }
    }

    fn subscribers(&self, action: &str) -> HashSet<String> {
        self.subscriptions
            .get(action)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    /// Apply an event to the hub's copy of the task and fan it out.
    async fn publish(&self, identity: &str, task_id: &str, event: TaskEvent) -> Result<(), Error> {
        let kind = event.kind();
        let event_id = event.event_id.clone();

        let task = match self.store.get(task_id).await? {
            Some(task) => task,
            None if kind == EventKind::Init => {
                self.store
                    .get_or_insert(SharedTask::new(Task::new(task_id)))
                    .await?
            }
            None => return Err(Error::UnknownTask(task_id.to_string())),
        };

        // Held until the broadcast is queued so every connection sees this
        // task's events in the order they were applied.
        let mut guard = task.lock().await;
        guard.apply(event)?;
        if kind == EventKind::Init {
            guard.set_origin(identity);
        }
        self.store.update(task.clone()).await?;

        let view = TaskView::of(&guard, &event_id, kind);
        let mut targets = self.subscribers(&view.action);
        if let Some(origin) = guard.origin() {
            targets.insert(origin.to_string());
        }

        log::debug!(
            target: self.log_target.as_str(),
            "Task {} {} from '{}' -> {} identities",
            task_id,
            kind,
            identity,
            targets.len()
        );

        match Response::task(view).to_text() {
            Ok(text) => {
                for target in &targets {
                    self.send_to_identity(target, &text);
                }
            }
            Err(e) => log::error!(target: self.log_target.as_str(), "Failed to encode task {}: {}", task_id, e),
        }

        Ok(())
    }

    fn register_connection(&self, identity: &str, tx: ConnSender) -> u64 {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.connections
            .entry(identity.to_string())
            .or_default()
            .push(Connection { id, tx });
        id
    }

    fn unregister_connection(&self, identity: &str, conn_id: u64) {
        if let Some(mut conns) = self.connections.get_mut(identity) {
            conns.retain(|c| c.id != conn_id);
        }
        self.connections.remove_if(identity, |_, conns| conns.is_empty());
    }

    /// Send a frame to every connection of an identity.
    fn send_to_identity(&self, identity: &str, text: &str) {
        if let Some(conns) = self.connections.get(identity) {
            for conn in conns.iter() {
                if conn.tx.send(Message::text(text.to_string())).is_err() {
                    log::debug!(
                        target: self.log_target.as_str(),
                        "Dropped frame for '{}' connection {}",
                        identity,
                        conn.id
                    );
                }
            }
        }
    }

    fn send(&self, tx: &ConnSender, response: &Response) {
        match response.to_text() {
            Ok(text) => {
                let _ = tx.send(Message::text(text));
            }
            Err(e) => log::error!(target: self.log_target.as_str(), "Failed to encode response: {}", e),
        }
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
