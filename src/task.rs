//! Event-sourced task state machine.
//!
//! A [`Task`] is mutated exclusively through [`Task::add_event`] (or its typed
//! twin [`Task::apply`]). Each call:
//! - validates the raw event and strips fields outside its table row
//! - rejects reused event ids and transitions the policy refuses
//! - applies side effects (action/payload, result, reason, last update)
//! - records missing predecessors, then the event itself, notifying observers

use crate::error::Error;
use crate::id;
use crate::types::{EventBody, EventKind, TaskEvent, check_transition, missing_predecessors};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::IntoFuture;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// One entry of a task's event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Unique within the task
    pub event_id: String,

    pub event: EventKind,

    /// When the event was recorded
    pub at: DateTime<Utc>,

    /// Recorded implicitly as the predecessor of another event
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthesized: bool,
}

/// Handle returned by [`Task::on`], used to deregister the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback = Box<dyn FnMut(&Task) + Send + Sync>;

struct Observer {
    id: ObserverId,
    once: bool,
    callback: Callback,
}

#[derive(Default)]
struct Slot {
    happened_at: Option<DateTime<Utc>>,
    observers: Vec<Observer>,
}

/// One unit of work, mirrored by every participant that learned about it.
pub struct Task {
    id: String,
    action: Option<String>,
    payload: Value,
    result: Option<Value>,
    reason: Option<Value>,
    last_update: Option<Value>,
    origin: Option<String>,
    current_state: Option<EventKind>,
    log: Vec<EventRecord>,
    event_ids: HashSet<String>,
    slots: HashMap<EventKind, Slot>,
    next_observer: u64,
}

impl Task {
    /// Create an empty task. Nothing has happened until the first event.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: None,
            payload: Value::Null,
            result: None,
            reason: None,
            last_update: None,
            origin: None,
            current_state: None,
            log: Vec::new(),
            event_ids: HashSet::new(),
            slots: HashMap::new(),
            next_observer: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Copy of the payload set by `init` (null before that).
    pub fn payload(&self) -> Value {
        self.payload.clone()
    }

    /// Copy of the result; implicit success yields null.
    pub fn result(&self) -> Option<Value> {
        if self.has_happened(EventKind::Success) {
            Some(self.result.clone().unwrap_or(Value::Null))
        } else {
            None
        }
    }

    /// Copy of the failure reason.
    pub fn reason(&self) -> Option<Value> {
        self.reason.clone()
    }

    pub fn last_update(&self) -> Option<Value> {
        self.last_update.clone()
    }

    /// Identity that published the task (hub side).
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn set_origin(&mut self, origin: impl Into<String>) {
        self.origin = Some(origin.into());
    }

    /// Most advanced event recorded so far.
    pub fn current_state(&self) -> Option<EventKind> {
        self.current_state
    }

    pub fn has_happened(&self, kind: EventKind) -> bool {
        self.happened_at(kind).is_some()
    }

    /// Time of the latest occurrence of `kind`.
    pub fn happened_at(&self, kind: EventKind) -> Option<DateTime<Utc>> {
        self.slots.get(&kind).and_then(|slot| slot.happened_at)
    }

    pub fn is_finished(&self) -> bool {
        self.has_happened(EventKind::End)
    }

    /// The ordered event log.
    pub fn events(&self) -> &[EventRecord] {
        &self.log
    }

    /// Validate and apply a raw JSON event.
    pub fn add_event(&mut self, raw: &Value) -> Result<(), Error> {
        let event = TaskEvent::parse(raw)?;
        self.apply(event)
    }

    /// Apply an already validated event.
    pub fn apply(&mut self, event: TaskEvent) -> Result<(), Error> {
        if self.event_ids.contains(&event.event_id) {
            return Err(Error::DuplicateEvent(event.event_id));
        }

        let kind = event.kind();
        check_transition(kind, |k| self.has_happened(k)).map_err(|msg| Error::invalid_transition(&self.id, msg))?;

        match event.body {
            EventBody::Init { action, payload } => {
                self.action = Some(action);
                self.payload = payload;
            }
            EventBody::Update { update } => self.last_update = Some(update),
            EventBody::Success { result } => self.result = Some(result),
            EventBody::Fail { reason } => self.reason = Some(reason),
            EventBody::Start | EventBody::Drop | EventBody::End => {}
        }

        let now = Utc::now();
        for prev in missing_predecessors(kind, |k| self.has_happened(k)) {
            let event_id = self.fresh_event_id();
            self.record(EventRecord {
                event_id,
                event: prev,
                at: now,
                synthesized: true,
            });
        }
        self.record(EventRecord {
            event_id: event.event_id,
            event: kind,
            at: now,
            synthesized: false,
        });

        Ok(())
    }

    /// Register an observer for `kind`.
    ///
    /// Fires right away if the event already happened, and again on every
    /// later occurrence until removed with [`Task::off`].
    pub fn on(&mut self, kind: EventKind, callback: impl FnMut(&Task) + Send + Sync + 'static) -> ObserverId {
        let mut callback: Callback = Box::new(callback);
        if self.has_happened(kind) {
            callback(&*self);
        }
        let id = self.next_observer_id();
        self.slots.entry(kind).or_default().observers.push(Observer {
            id,
            once: false,
            callback,
        });
        id
    }

    /// Register an observer that fires exactly once.
    ///
    /// Returns `None` when the event already happened and the callback ran
    /// immediately.
    pub fn once(&mut self, kind: EventKind, callback: impl FnOnce(&Task) + Send + Sync + 'static) -> Option<ObserverId> {
        if self.has_happened(kind) {
            callback(&*self);
            return None;
        }
        let mut pending = Some(callback);
        let id = self.next_observer_id();
        self.slots.entry(kind).or_default().observers.push(Observer {
            id,
            once: true,
            callback: Box::new(move |task: &Task| {
                if let Some(callback) = pending.take() {
                    callback(task);
                }
            }),
        });
        Some(id)
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn off(&mut self, id: ObserverId) -> bool {
        for slot in self.slots.values_mut() {
            if let Some(pos) = slot.observers.iter().position(|o| o.id == id) {
                slot.observers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Result of the task once it has an outcome.
    ///
    /// A failed task yields `default`, or [`Error::NoResult`] without one.
    pub fn get_result(&mut self, default: Option<Value>) -> PendingResult {
        if self.has_happened(EventKind::Fail) {
            return PendingResult::Ready(default.ok_or_else(|| Error::NoResult {
                task_id: self.id.clone(),
            }));
        }
        if let Some(result) = self.result() {
            return PendingResult::Ready(Ok(result));
        }

        let (tx, rx) = oneshot::channel();
        let on_fail = Arc::new(Mutex::new(Some(tx)));
        let on_success = Arc::clone(&on_fail);

        self.once(EventKind::Success, move |task| {
            if let Some(tx) = take_sender(&on_success) {
                let _ = tx.send(Ok(task.result().unwrap_or(Value::Null)));
            }
        });
        self.once(EventKind::Fail, move |task| {
            if let Some(tx) = take_sender(&on_fail) {
                let outcome = default.ok_or_else(|| Error::NoResult {
                    task_id: task.id().to_string(),
                });
                let _ = tx.send(outcome);
            }
        });

        PendingResult::Pending(rx)
    }

    fn record(&mut self, record: EventRecord) {
        let kind = record.event;
        self.event_ids.insert(record.event_id.clone());
        if self.current_state.is_none_or(|current| kind.rank() >= current.rank()) {
            self.current_state = Some(kind);
        }
        self.slots.entry(kind).or_default().happened_at = Some(record.at);
        self.log.push(record);
        self.notify(kind);
    }

    fn notify(&mut self, kind: EventKind) {
        let observers = match self.slots.get_mut(&kind) {
            Some(slot) => std::mem::take(&mut slot.observers),
            None => return,
        };

        let mut kept = Vec::with_capacity(observers.len());
        for mut observer in observers {
            (observer.callback)(&*self);
            if !observer.once {
                kept.push(observer);
            }
        }

        if let Some(slot) = self.slots.get_mut(&kind) {
            slot.observers = kept;
        }
    }

    fn fresh_event_id(&self) -> String {
        loop {
            let candidate = id::event_id(&self.id);
            if !self.event_ids.contains(&candidate) {
                return candidate;
            }
        }
    }

    fn next_observer_id(&mut self) -> ObserverId {
        self.next_observer += 1;
        ObserverId(self.next_observer)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("current_state", &self.current_state)
            .field("events", &self.log.len())
            .finish()
    }
}

type Outcome = Result<Value, Error>;

fn take_sender(slot: &Mutex<Option<oneshot::Sender<Outcome>>>) -> Option<oneshot::Sender<Outcome>> {
    slot.lock().ok().and_then(|mut sender| sender.take())
}

/// Outcome of [`Task::get_result`]; `.await` it.
#[derive(Debug)]
pub enum PendingResult {
    /// The task already had an outcome.
    Ready(Outcome),
    /// Resolves on the first `success` or `fail`.
    Pending(oneshot::Receiver<Outcome>),
}

impl IntoFuture for PendingResult {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            match self {
                PendingResult::Ready(outcome) => outcome,
                PendingResult::Pending(rx) => match rx.await {
                    Ok(outcome) => outcome,
                    // the task was dropped before it got an outcome
                    Err(_) => Err(Error::Closed),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(id: &str, name: &str) -> Value {
        json!({ "eventId": id, "event": name })
    }

    #[test]
    fn test_late_observer_fires_immediately() {
        let mut task = Task::new("tk-1");
        task.add_event(&json!({"eventId": "e1", "event": "init", "action": "a:b", "payload": 1}))
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        task.on(EventKind::Init, move |t| {
            assert_eq!(t.id(), "tk-1");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_fires_on_every_occurrence_until_off() {
        let mut task = Task::new("tk-1");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = task.on(EventKind::Update, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.add_event(&json!({"eventId": "u1", "event": "update", "update": 10})).unwrap();
        task.add_event(&json!({"eventId": "u2", "event": "update", "update": 20})).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(task.off(id));
        task.add_event(&json!({"eventId": "u3", "event": "update", "update": 30})).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!task.off(id));
    }

    #[test]
    fn test_once_deregisters_after_first_call() {
        let mut task = Task::new("tk-1");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        assert!(
            task.once(EventKind::Update, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .is_some()
        );

        task.add_event(&json!({"eventId": "u1", "event": "update", "update": 1})).unwrap();
        task.add_event(&json!({"eventId": "u2", "event": "update", "update": 2})).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_synthesized_events_notify_observers() {
        let mut task = Task::new("tk-1");
        let order = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Init, EventKind::Start, EventKind::Success] {
            let order = Arc::clone(&order);
            task.on(kind, move |_| order.lock().unwrap().push(kind));
        }

        task.add_event(&event("end-1", "end")).unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec![EventKind::Init, EventKind::Start, EventKind::Success]
        );
        let synthesized: Vec<bool> = task.events().iter().map(|r| r.synthesized).collect();
        assert_eq!(synthesized, vec![true, true, true, false]);
    }

    #[test]
    fn test_current_state_never_regresses() {
        let mut task = Task::new("tk-1");
        task.add_event(&json!({"eventId": "u1", "event": "update", "update": 1})).unwrap();
        task.add_event(&event("s2", "start")).unwrap();

        assert_eq!(task.current_state(), Some(EventKind::Update));
        assert_eq!(task.events().len(), 4);
    }

    #[tokio::test]
    async fn test_pending_result_resolves_on_success() {
        let mut task = Task::new("tk-1");
        let pending = task.get_result(None);
        assert!(matches!(pending, PendingResult::Pending(_)));

        task.add_event(&json!({"eventId": "ok", "event": "success", "result": "R"})).unwrap();
        assert_eq!(pending.await.unwrap(), json!("R"));
    }

    #[tokio::test]
    async fn test_pending_result_with_default_on_fail() {
        let mut task = Task::new("tk-1");
        let pending = task.get_result(Some(json!("fallback")));

        task.add_event(&json!({"eventId": "no", "event": "fail", "reason": "boom"})).unwrap();
        assert_eq!(pending.await.unwrap(), json!("fallback"));
    }

    #[tokio::test]
    async fn test_pending_result_rejects_on_fail() {
        let mut task = Task::new("tk-1");
        let pending = task.get_result(None);

        task.add_event(&json!({"eventId": "no", "event": "fail", "reason": "boom"})).unwrap();
        assert!(matches!(pending.await, Err(Error::NoResult { .. })));
    }

    #[tokio::test]
    async fn test_implicit_success_yields_null() {
        let mut task = Task::new("tk-1");
        task.add_event(&event("end", "end")).unwrap();
        assert_eq!(task.get_result(None).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_dropped_task_closes_pending_result() {
        let mut task = Task::new("tk-1");
        let pending = task.get_result(None);
        drop(task);
        assert!(matches!(pending.await, Err(Error::Closed)));
    }
}
