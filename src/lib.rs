//! Taskhub: a task pub/sub hub over WebSockets.
//!
//! Tasks are event-sourced state machines (`init`, `start`, `update`, `drop`,
//! `success`, `fail`, `end`). A [`Hub`] routes every event of a task to the
//! clients subscribed to its action and to the client that published it.
//! Each [`Client`] mirrors the tasks it sees and exposes them as [`ClientTask`]
//! handles.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use taskhub::{Client, ClientConfig, Hub, HubConfig};
//!
//! # async fn example() -> eyre::Result<()> {
//! let mut hub = Hub::new(HubConfig::local(8080));
//! hub.add_credential("worker", "secret");
//! hub.start().await?;
//!
//! let worker = Client::create(ClientConfig::new("ws://127.0.0.1:8080", "worker", "secret")).await?;
//! worker
//!     .subscribe("add", |task| {
//!         if task.event() == taskhub::EventKind::Init {
//!             let sum = task.payload()["a"].as_i64().unwrap_or(0) + task.payload()["b"].as_i64().unwrap_or(0);
//!             let _ = task.success(json!(sum));
//!         }
//!     })
//!     .await?;
//!
//! let sum = worker.call("add", json!({"a": 1, "b": 2}), None).await?;
//! assert_eq!(sum, json!(3));
//! # Ok(())
//! # }
//! ```

mod error;

pub mod auth;
pub mod client;
pub mod hub;
pub mod id;
pub mod protocol;
pub mod store;
pub mod task;
pub mod types;

// Re-export public API
pub use auth::{Authenticator, Credentials};
pub use client::{Client, ClientConfig, ClientTask};
pub use error::Error;
pub use hub::{Hub, HubConfig};
pub use protocol::{Request, Response, TaskView};
pub use store::{MemoryStore, SharedTask, TaskStore};
pub use task::{EventRecord, ObserverId, PendingResult, Task};
pub use types::{EventBody, EventKind, TaskEvent};
