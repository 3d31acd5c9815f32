//! Client for connecting to a task hub.
//!
//! A client keeps its own mirror of every task it published or learned about
//! and applies each event the hub routes to it before notifying local
//! subscription callbacks.

use crate::auth::basic_header;
use crate::error::Error;
use crate::id;
use crate::protocol::{ErrorEnvelope, Reply, Request, Response};
use crate::store::{MemoryStore, SharedTask, TaskStore};
use crate::task::Task;
use crate::types::{EventBody, EventKind, TaskEvent};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Default budget for connect retries in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default delay between connect attempts in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Default log target of client records.
pub const DEFAULT_LOG_TARGET: &str = "taskhub::client";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked for every event of a subscribed action.
pub type SubscriptionCallback = Arc<dyn Fn(ClientTask) + Send + Sync>;

/// Configuration for a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub URL, e.g. `ws://localhost:8080`
    pub url: String,

    /// Identity to authenticate as
    pub identity: String,

    /// Secret key of the identity
    pub key: String,

    /// How long to keep retrying a refused connection
    pub timeout: Duration,

    /// Pause between connect attempts
    pub retry_delay: Duration,

    /// Target every log record of this client is emitted with
    pub log_target: String,
}

impl ClientConfig {
    /// Create config with default settings.
    pub fn new(url: impl Into<String>, identity: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            identity: identity.into(),
            key: key.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            log_target: DEFAULT_LOG_TARGET.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }
}

/// State shared between the client handle, its reader and its task handles.
struct Inner {
    config: ClientConfig,
    outbound: mpsc::UnboundedSender<Message>,
    store: Arc<dyn TaskStore>,
    open: AtomicBool,

    /// Action -> local callbacks
    subscriptions: DashMap<String, Vec<SubscriptionCallback>>,

    /// Task ID -> publisher waiting for its init to come back
    publish_waiters: DashMap<String, oneshot::Sender<Result<(), Error>>>,

    /// Pending `sub` acknowledgements, in send order
    ack_waiters: Mutex<VecDeque<oneshot::Sender<Result<(), Error>>>>,
}

/// A connection to a hub.
pub struct Client {
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Client {
    /// Connect to a hub, mirroring tasks in memory.
    pub async fn create(config: ClientConfig) -> Result<Self, Error> {
        Self::create_with_store(config, Arc::new(MemoryStore::new())).await
    }

    /// Connect to a hub, mirroring tasks in `store`.
    ///
    /// Refused connections are retried every `retry_delay` until `timeout`
    /// has elapsed; any other connection error is returned immediately.
    pub async fn create_with_store(config: ClientConfig, store: Arc<dyn TaskStore>) -> Result<Self, Error> {
        let ws = connect_with_retry(&config).await?;
        let (sink, stream) = ws.split();
        let (outbound, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            outbound,
            store,
            open: AtomicBool::new(true),
            subscriptions: DashMap::new(),
            publish_waiters: DashMap::new(),
            ack_waiters: Mutex::new(VecDeque::new()),
        });

        let writer = tokio::spawn(write_frames(sink, rx));
        let reader = tokio::spawn(Arc::clone(&inner).read_frames(stream));

        Ok(Self { inner, reader, writer })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// The store holding this client's task mirrors.
    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.inner.store)
    }

    /// Actions with at least one local subscription callback.
    pub fn subscribed_actions(&self) -> Vec<String> {
        self.inner.subscriptions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Publish a new task and wait until the hub echoes its `init` back.
    ///
    /// The `init` is validated before anything is stored; a publish that
    /// fails later leaves no task behind in the local store.
    pub async fn publish(&self, action: &str, payload: Value) -> Result<ClientTask, Error> {
        let task_id = id::task_id(action);
        let event = TaskEvent::parse(&serde_json::json!({
            "eventId": id::event_id(&task_id),
            "event": EventKind::Init.as_str(),
            "action": action,
            "payload": payload,
        }))?;

        let task = SharedTask::new(Task::new(task_id.as_str()));
        self.inner.store.add(task.clone()).await?;

        let (tx, rx) = oneshot::channel();
        self.inner.publish_waiters.insert(task_id.clone(), tx);
        let request = Request::Pub {
            task_id: task_id.clone(),
            event,
        };
        let outcome = match self.inner.send(&request) {
            Ok(()) => rx.await.unwrap_or(Err(Error::Closed)),
            Err(e) => {
                self.inner.publish_waiters.remove(&task_id);
                Err(e)
            }
        };
        if let Err(e) = outcome {
            if let Err(store_err) = self.inner.store.remove(&task_id).await {
                log::warn!(
                    target: self.inner.config.log_target.as_str(),
                    "Failed to drop rejected task {}: {:#}",
                    task_id,
                    store_err
                );
            }
            return Err(e);
        }

        let payload = task.lock().await.payload();
        Ok(ClientTask {
            task,
            action: action.to_string(),
            event: EventKind::Init,
            payload,
            update: None,
            client: Arc::clone(&self.inner),
        })
    }

    /// Call `callback` for every event of tasks published under `action`.
    ///
    /// Returns once the hub acknowledged the subscription.
    pub async fn subscribe(
        &self,
        action: &str,
        callback: impl Fn(ClientTask) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let callback: SubscriptionCallback = Arc::new(callback);
        self.inner
            .subscriptions
            .entry(action.to_string())
            .or_default()
            .push(Arc::clone(&callback));

        let (tx, rx) = oneshot::channel();
        let sent = {
            // queue and send under one lock so acks line up with frames
            let mut waiters = self.inner.ack_waiters.lock().await;
            waiters.push_back(tx);
            let sent = self.inner.send(&Request::Sub {
                action: action.to_string(),
            });
            if sent.is_err() {
                waiters.pop_back();
            }
            sent
        };

        let outcome = match sent {
            Ok(()) => rx.await.unwrap_or(Err(Error::Closed)),
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            self.inner.unregister_callback(action, &callback);
        }
        outcome
    }

    /// Publish a task and wait for its result.
    ///
    /// A failed task yields `default`, or [`Error::NoResult`] without one.
    pub async fn call(&self, action: &str, payload: Value, default: Option<Value>) -> Result<Value, Error> {
        let task = self.publish(action, payload).await?;
        task.result(default).await
    }

    /// Close the connection.
    pub async fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            let _ = self.inner.outbound.send(Message::Close(None));
            log::info!(target: self.inner.config.log_target.as_str(), "Closing connection to {}", self.inner.config.url);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Inner {
    fn send(&self, request: &Request) -> Result<(), Error> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let text = request.to_text().map_err(|e| Error::validation(e.to_string()))?;
        self.outbound.send(Message::text(text)).map_err(|_| Error::Closed)
    }

    /// Forget a callback whose subscription never took effect.
    fn unregister_callback(&self, action: &str, callback: &SubscriptionCallback) {
        if let Some(mut callbacks) = self.subscriptions.get_mut(action) {
            callbacks.retain(|c| !Arc::ptr_eq(c, callback));
        }
        self.subscriptions.remove_if(action, |_, callbacks| callbacks.is_empty());
    }

    fn send_event(&self, task_id: &str, body: EventBody) -> Result<(), Error> {
        self.send(&Request::Pub {
            task_id: task_id.to_string(),
            event: TaskEvent::new(id::event_id(task_id), body),
        })
    }

    async fn read_frames(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        let target = self.config.log_target.as_str();
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_frame(text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!(target: target, "Connection error: {}", e);
                    break;
                }
            }
        }

        self.open.store(false, Ordering::Release);
        // dropping the senders wakes every waiter with Closed
        self.ack_waiters.lock().await.clear();
        self.publish_waiters.clear();
        log::info!(target: target, "Disconnected from {}", self.config.url);
    }

    async fn handle_frame(self: &Arc<Self>, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                log::warn!(target: self.config.log_target.as_str(), "Ignoring non-JSON frame: {}", e);
                return;
            }
        };

        match value.get("taskId").and_then(Value::as_str) {
            Some(task_id) => self.apply_task_frame(task_id, &value).await,
            None => self.handle_control_frame(value).await,
        }
    }

    /// Apply a routed event to the local mirror, then run callbacks.
    async fn apply_task_frame(self: &Arc<Self>, task_id: &str, value: &Value) {
        let target = self.config.log_target.as_str();
        let Some(kind) = value.get("event").and_then(Value::as_str).and_then(EventKind::parse) else {
            log::warn!(target: target, "Ignoring frame for task {} without a known event", task_id);
            return;
        };

        let lookup = match self.store.get(task_id).await {
            Ok(Some(task)) => Ok(task),
            Ok(None) if kind == EventKind::Init => self.store.get_or_insert(SharedTask::new(Task::new(task_id))).await,
            Ok(None) => {
                log::warn!(target: target, "Dropping '{}' event for unknown task {}", kind, task_id);
                return;
            }
            Err(e) => Err(e),
        };
        let task = match lookup {
            Ok(task) => task,
            Err(e) => {
                log::warn!(target: target, "Task store failed for {}: {:#}", task_id, e);
                return;
            }
        };

        let (action, payload, update) = {
            let mut guard = task.lock().await;
            if let Err(e) = guard.add_event(value) {
                log::warn!(target: target, "Rejected '{}' event for task {}: {}", kind, task_id, e);
                return;
            }
            let update = if kind == EventKind::Update {
                guard.last_update()
            } else {
                None
            };
            (guard.action().map(String::from), guard.payload(), update)
        };
        if let Err(e) = self.store.update(task.clone()).await {
            log::warn!(target: target, "Task store failed for {}: {:#}", task_id, e);
        }

        if kind == EventKind::Init
            && let Some((_, waiter)) = self.publish_waiters.remove(task_id)
        {
            let _ = waiter.send(Ok(()));
        }

        let Some(action) = action else {
            return;
        };
        let callbacks: Vec<SubscriptionCallback> = self
            .subscriptions
            .get(&action)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for callback in callbacks {
            callback(ClientTask {
                task: task.clone(),
                action: action.clone(),
                event: kind,
                payload: payload.clone(),
                update: update.clone(),
                client: Arc::clone(self),
            });
        }
    }

    /// Frames outside the task protocol: acks and error envelopes.
    async fn handle_control_frame(&self, value: Value) {
        match serde_json::from_value::<Response>(value) {
            Ok(Response::Ok(Reply::Ack { message })) => {
                log::debug!(target: self.config.log_target.as_str(), "Hub: {}", message);
                if let Some(waiter) = self.ack_waiters.lock().await.pop_front() {
                    let _ = waiter.send(Ok(()));
                }
            }
            Ok(Response::Error(envelope)) => self.handle_error_envelope(envelope).await,
            Ok(Response::Ok(Reply::Task(_))) => {}
            Err(e) => log::debug!(target: self.config.log_target.as_str(), "Ignoring frame: {}", e),
        }
    }

    async fn handle_error_envelope(&self, envelope: ErrorEnvelope) {
        log::warn!(
            target: self.config.log_target.as_str(),
            "Hub rejected frame: {}: {}",
            envelope.error,
            envelope.message
        );

        let request: Option<Value> = serde_json::from_str(&envelope.request).ok();
        let err = Error::Remote {
            kind: envelope.error,
            message: envelope.message,
        };
        let field = |name: &str| request.as_ref().and_then(|r| r.get(name)).and_then(Value::as_str);

        match field("cmd") {
            Some("sub") => {
                if let Some(waiter) = self.ack_waiters.lock().await.pop_front() {
                    let _ = waiter.send(Err(err));
                }
            }
            Some("pub") => {
                if let Some(task_id) = field("taskId")
                    && let Some((_, waiter)) = self.publish_waiters.remove(task_id)
                {
                    let _ = waiter.send(Err(err));
                }
            }
            _ => {}
        }
    }
}

async fn write_frames(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            break;
        }
    }
}

/// Connect, retrying refused connections until the timeout is exhausted.
async fn connect_with_retry(config: &ClientConfig) -> Result<WsStream, Error> {
    let target = config.log_target.as_str();
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let mut request = config.url.as_str().into_client_request()?;
        let credentials = HeaderValue::from_str(&basic_header(&config.identity, &config.key))
            .map_err(|e| Error::validation(format!("invalid credentials: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, credentials);

        match connect_async(request).await {
            Ok((ws, _)) => {
                log::info!(
                    target: target,
                    "Connected to {} as '{}' after {} attempt(s)",
                    config.url,
                    config.identity,
                    attempts
                );
                return Ok(ws);
            }
            Err(e) if is_connection_refused(&e) => {
                let elapsed = started.elapsed();
                if elapsed >= config.timeout {
                    return Err(Error::ConnectionTimeout {
                        elapsed,
                        last_error: Box::new(e),
                    });
                }
                let backoff = config.retry_delay.min(config.timeout - elapsed);
                log::debug!(
                    target: target,
                    "Hub not ready yet (attempt {}): {}; retrying in {:?}",
                    attempts,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(tungstenite::Error::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                return Err(Error::Unauthorized(config.identity.clone()));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_connection_refused(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(io_err) if io_err.kind() == io::ErrorKind::ConnectionRefused)
}

/// A task as seen by this client, with the senders of its lifecycle events.
///
/// Lifecycle senders only queue the frame; the local mirror changes when the
/// hub routes the event back.
#[derive(Clone)]
pub struct ClientTask {
    task: SharedTask,
    action: String,
    event: EventKind,
    payload: Value,
    update: Option<Value>,
    client: Arc<Inner>,
}

impl ClientTask {
    pub fn id(&self) -> &str {
        self.task.id()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// The event that produced this handle.
    pub fn event(&self) -> EventKind {
        self.event
    }

    /// Copy of the task payload.
    pub fn payload(&self) -> Value {
        self.payload.clone()
    }

    /// Value reported by the `update` event that produced this handle.
    pub fn update_value(&self) -> Option<&Value> {
        self.update.as_ref()
    }

    /// The local mirror.
    pub fn shared(&self) -> &SharedTask {
        &self.task
    }

    /// Wait for the task's result; see [`Task::get_result`].
    pub async fn result(&self, default: Option<Value>) -> Result<Value, Error> {
        let pending = self.task.lock().await.get_result(default);
        pending.await
    }

    pub fn start(&self) -> Result<(), Error> {
        self.client.send_event(self.id(), EventBody::Start)
    }

    pub fn update(&self, update: Value) -> Result<(), Error> {
        self.client.send_event(self.id(), EventBody::Update { update })
    }

    /// Give the task up so another worker may start it.
    pub fn drop_task(&self) -> Result<(), Error> {
        self.client.send_event(self.id(), EventBody::Drop)
    }

    /// Report success, then end the task.
    pub fn success(&self, result: Value) -> Result<(), Error> {
        self.client.send_event(self.id(), EventBody::Success { result })?;
        self.client.send_event(self.id(), EventBody::End)
    }

    /// Report failure, then end the task.
    pub fn fail(&self, reason: Value) -> Result<(), Error> {
        self.client.send_event(self.id(), EventBody::Fail { reason })?;
        self.client.send_event(self.id(), EventBody::End)
    }
}

impl std::fmt::Debug for ClientTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTask")
            .field("id", &self.id())
            .field("action", &self.action)
            .field("event", &self.event)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new("ws://localhost:8080", "svc", "key");
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(config.retry_delay, Duration::from_millis(DEFAULT_RETRY_DELAY_MS));
        assert_eq!(config.log_target, DEFAULT_LOG_TARGET);

        let config = config.with_timeout(Duration::from_millis(100)).with_log_target("worker");
        assert_eq!(config.timeout, Duration::from_millis(100));
        assert_eq!(config.log_target, "worker");
    }

    #[test]
    fn test_connection_refused_is_retryable() {
        let refused = tungstenite::Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(is_connection_refused(&refused));

        let reset = tungstenite::Error::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!is_connection_refused(&reset));
        assert!(!is_connection_refused(&tungstenite::Error::ConnectionClosed));
    }
}
