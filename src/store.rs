//! Task store: a pluggable index from task id to task.
//!
//! Stores hand out [`SharedTask`]s. Every mutation of a task goes through its
//! own lock, so frames for the same task arriving on different connections
//! are applied one after another.

use crate::task::Task;
use async_trait::async_trait;
use dashmap::DashMap;
use eyre::Result;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// A task behind a per-task lock.
#[derive(Clone)]
pub struct SharedTask {
    id: Arc<str>,
    inner: Arc<Mutex<Task>>,
}

impl SharedTask {
    pub fn new(task: Task) -> Self {
        Self {
            id: Arc::from(task.id()),
            inner: Arc::new(Mutex::new(task)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lock the task for reading or mutation.
    pub async fn lock(&self) -> MutexGuard<'_, Task> {
        self.inner.lock().await
    }

    /// True if both handles point at the same task instance.
    pub fn ptr_eq(&self, other: &SharedTask) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedTask").field(&self.id).finish()
    }
}

/// Lookup from task id to task, used by hubs and clients to mirror state.
///
/// A store is an index, not the source of truth. Implementations must be
/// safe to share between connections.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Get a task by ID.
    async fn get(&self, task_id: &str) -> Result<Option<SharedTask>>;

    /// Insert a task, replacing any task with the same ID.
    async fn add(&self, task: SharedTask) -> Result<()>;

    /// Replace a stored task.
    async fn update(&self, task: SharedTask) -> Result<()>;

    /// Return the task stored under `task.id()`, inserting `task` if there is none.
    ///
    /// Must be atomic: two racing callers get the same instance back.
    async fn get_or_insert(&self, task: SharedTask) -> Result<SharedTask>;

    /// Remove a task. Returns false if it was not stored.
    async fn remove(&self, task_id: &str) -> Result<bool>;

    /// Number of stored tasks.
    async fn len(&self) -> Result<usize>;
}

/// In-memory store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryStore {
    tasks: DashMap<String, SharedTask>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get(&self, task_id: &str) -> Result<Option<SharedTask>> {
        Ok(self.tasks.get(task_id).map(|entry| entry.value().clone()))
    }

    async fn add(&self, task: SharedTask) -> Result<()> {
        self.tasks.insert(task.id().to_string(), task);
        Ok(())
    }

    async fn update(&self, task: SharedTask) -> Result<()> {
        self.tasks.insert(task.id().to_string(), task);
        Ok(())
    }

    async fn get_or_insert(&self, task: SharedTask) -> Result<SharedTask> {
        let entry = self.tasks.entry(task.id().to_string()).or_insert(task);
        Ok(entry.value().clone())
    }

    async fn remove(&self, task_id: &str) -> Result<bool> {
        Ok(self.tasks.remove(task_id).is_some())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.tasks.len())
    }
}
