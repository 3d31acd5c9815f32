//! Core event types and the task lifecycle transition table.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle events a task can go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Init,
    Start,
    Update,
    Drop,
    Success,
    Fail,
    End,
}

impl EventKind {
    /// Every event, in table order.
    pub const ALL: [EventKind; 7] = [
        EventKind::Init,
        EventKind::Start,
        EventKind::Update,
        EventKind::Drop,
        EventKind::Success,
        EventKind::Fail,
        EventKind::End,
    ];

    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Init => "init",
            EventKind::Start => "start",
            EventKind::Update => "update",
            EventKind::Drop => "drop",
            EventKind::Success => "success",
            EventKind::Fail => "fail",
            EventKind::End => "end",
        }
    }

    /// Look up an event by wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }

    /// Fields an event of this kind must carry besides `eventId` and `event`.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::Init => &["action", "payload"],
            EventKind::Update => &["update"],
            EventKind::Success => &["result"],
            EventKind::Fail => &["reason"],
            EventKind::Start | EventKind::Drop | EventKind::End => &[],
        }
    }

    /// The event that must have happened before this one.
    ///
    /// `end` names `success` here; [`missing_predecessors`] skips it when the
    /// task already has an outcome of either class.
    pub fn implied_predecessor(&self) -> Option<EventKind> {
        match self {
            EventKind::Init => None,
            EventKind::Start => Some(EventKind::Init),
            EventKind::Update | EventKind::Drop | EventKind::Success | EventKind::Fail => Some(EventKind::Start),
            EventKind::End => Some(EventKind::Success),
        }
    }

    /// Position in the lifecycle. `current_state` never moves to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            EventKind::Init => 0,
            EventKind::Start => 1,
            EventKind::Update | EventKind::Drop => 2,
            EventKind::Success | EventKind::Fail => 3,
            EventKind::End => 4,
        }
    }

    /// Success-class or failure-class event.
    pub fn is_outcome(&self) -> bool {
        matches!(self, EventKind::Success | EventKind::Fail)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that have to be synthesized before `kind` can be recorded, oldest first.
pub fn missing_predecessors(kind: EventKind, happened: impl Fn(EventKind) -> bool) -> Vec<EventKind> {
    let mut chain = Vec::new();
    let mut cursor = kind;
    while let Some(prev) = cursor.implied_predecessor() {
        if happened(prev) {
            break;
        }
        // end after fail: the outcome is already there
        if prev == EventKind::Success && happened(EventKind::Fail) {
            break;
        }
        chain.push(prev);
        cursor = prev;
    }
    chain.reverse();
    chain
}

/// Check whether `kind` may be recorded given what already happened.
pub fn check_transition(kind: EventKind, happened: impl Fn(EventKind) -> bool) -> Result<(), &'static str> {
    if happened(EventKind::End) {
        return Err("task has already ended");
    }
    let has_outcome = EventKind::ALL.iter().any(|k| k.is_outcome() && happened(*k));
    match kind {
        EventKind::Init if happened(EventKind::Init) => Err("task has already been initialized"),
        _ if kind.is_outcome() && has_outcome => Err("task already has an outcome"),
        EventKind::Start | EventKind::Update | EventKind::Drop if has_outcome => {
            Err("task already has an outcome")
        }
        _ => Ok(()),
    }
}

/// Event-specific data, one variant per row of the transition table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventBody {
    Init { action: String, payload: Value },
    Start,
    Update { update: Value },
    Drop,
    Success { result: Value },
    Fail { reason: Value },
    End,
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Init { .. } => EventKind::Init,
            EventBody::Start => EventKind::Start,
            EventBody::Update { .. } => EventKind::Update,
            EventBody::Drop => EventKind::Drop,
            EventBody::Success { .. } => EventKind::Success,
            EventBody::Fail { .. } => EventKind::Fail,
            EventBody::End => EventKind::End,
        }
    }
}

/// A validated lifecycle event.
///
/// Only the fields of the event's table row survive parsing; anything else a
/// sender attached is dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    #[serde(rename = "eventId")]
    pub event_id: String,

    #[serde(flatten)]
    pub body: EventBody,
}

impl TaskEvent {
    pub fn new(event_id: impl Into<String>, body: EventBody) -> Self {
        Self {
            event_id: event_id.into(),
            body,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    /// Validate a raw JSON event and keep only its whitelisted fields.
    pub fn parse(value: &Value) -> Result<Self, Error> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::validation("events must be JSON objects"))?;

        let event_id = match map.get("eventId") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => return Err(Error::validation("eventId must be a non-empty string")),
            None => return Err(Error::validation("events must have props: eventId, event")),
        };

        let name = match map.get("event") {
            Some(Value::String(name)) => name.as_str(),
            Some(_) => return Err(Error::validation("event must be a string")),
            None => return Err(Error::validation("events must have props: eventId, event")),
        };
        let kind = EventKind::parse(name).ok_or_else(|| Error::UnsupportedEvent(name.to_string()))?;

        let required = kind.required_fields();
        if !required.iter().all(|field| map.contains_key(*field)) {
            return Err(Error::validation(format!(
                "'{}' events must have props: {}",
                kind,
                required.join(", ")
            )));
        }

        let field = |name: &str| map.get(name).cloned().unwrap_or(Value::Null);
        let body = match kind {
            EventKind::Init => {
                let action = match map.get("action") {
                    Some(Value::String(action)) if !action.is_empty() => action.clone(),
                    _ => return Err(Error::validation("action must be a non-empty string")),
                };
                EventBody::Init {
                    action,
                    payload: field("payload"),
                }
            }
            EventKind::Start => EventBody::Start,
            EventKind::Update => EventBody::Update {
                update: field("update"),
            },
            EventKind::Drop => EventBody::Drop,
            EventKind::Success => EventBody::Success {
                result: field("result"),
            },
            EventKind::Fail => EventBody::Fail {
                reason: field("reason"),
            },
            EventKind::End => EventBody::End,
        };

        Ok(Self { event_id, body })
    }
}
