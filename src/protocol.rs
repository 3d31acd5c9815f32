//! Wire protocol: JSON text frames between clients and the hub.

use crate::error::Error;
use crate::task::Task;
use crate::types::{EventKind, TaskEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame sent from client to hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Start routing events of an action to the caller.
    Sub { action: String },

    /// Publish a lifecycle event for a task.
    Pub {
        #[serde(rename = "taskId")]
        task_id: String,

        #[serde(flatten)]
        event: TaskEvent,
    },
}

impl Request {
    /// Parse a raw text frame, validating it structurally.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(raw).map_err(|e| Error::Syntax(e.to_string()))?;
        let map = value
            .as_object()
            .ok_or_else(|| Error::validation("frames must be JSON objects"))?;

        let cmd = match map.get("cmd") {
            Some(Value::String(cmd)) => cmd.as_str(),
            Some(_) => return Err(Error::validation("cmd must be a string")),
            None => return Err(Error::validation("frames must have props: cmd")),
        };

        match cmd {
            "sub" => match map.get("action") {
                Some(Value::String(action)) if !action.is_empty() => Ok(Request::Sub {
                    action: action.clone(),
                }),
                _ => Err(Error::validation("sub frames must have props: action")),
            },
            "pub" => {
                let task_id = match map.get("taskId") {
                    Some(Value::String(id)) if !id.is_empty() => id.clone(),
                    _ => return Err(Error::validation("pub frames must have props: taskId")),
                };
                let event = TaskEvent::parse(&value)?;
                Ok(Request::Pub { task_id, event })
            }
            other => Err(Error::UnsupportedCommand(other.to_string())),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frame sent from hub to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok(Reply),
    Error(ErrorEnvelope),
}

/// Payload of an `ok` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// A task event broadcast.
    Task(TaskView),
    /// Acknowledgement of a command.
    Ack { message: String },
}

/// Body of an `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error kind name
    pub error: String,
    pub message: String,
    /// The offending frame, verbatim
    pub request: String,
}

/// The state of a task right after one of its events was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: String,
    pub event_id: String,
    pub action: String,
    pub event: EventKind,

    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,
}

impl TaskView {
    /// View of `task` after `event_id` (of kind `event`) was applied.
    pub fn of(task: &Task, event_id: &str, event: EventKind) -> Self {
        Self {
            task_id: task.id().to_string(),
            event_id: event_id.to_string(),
            action: task.action().unwrap_or_default().to_string(),
            event,
            payload: task.payload(),
            result: task.result(),
            reason: task.reason(),
            update: if event == EventKind::Update {
                task.last_update()
            } else {
                None
            },
        }
    }
}

impl Response {
    /// Create an acknowledgement response.
    pub fn ack(message: impl Into<String>) -> Self {
        Self::Ok(Reply::Ack {
            message: message.into(),
        })
    }

    pub fn task(view: TaskView) -> Self {
        Self::Ok(Reply::Task(view))
    }

    /// Create an error response quoting the offending frame.
    pub fn error(err: &Error, request: &str) -> Self {
        Self::Error(ErrorEnvelope {
            error: err.kind().to_string(),
            message: err.to_string(),
            request: request.to_string(),
        })
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
