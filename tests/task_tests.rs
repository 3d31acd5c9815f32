//! Integration tests for the task state machine.
//!
//! Covers the lifecycle rules every hub and client mirror relies on.

use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use taskhub::{Error, EventKind, Task};

fn event(id: &str, name: &str) -> Value {
    json!({"eventId": id, "event": name})
}

fn init(id: &str, action: &str, payload: Value) -> Value {
    json!({"eventId": id, "event": "init", "action": action, "payload": payload})
}

fn kinds(task: &Task) -> Vec<EventKind> {
    task.events().iter().map(|r| r.event).collect()
}

// =============================================================================
// Implied Predecessors
// =============================================================================

#[test]
fn test_end_on_fresh_task_implies_whole_chain() {
    let mut task = Task::new("t1");

    task.add_event(&event("e-end", "end")).unwrap();

    assert_eq!(
        kinds(&task),
        vec![EventKind::Init, EventKind::Start, EventKind::Success, EventKind::End]
    );
    assert!(task.events()[..3].iter().all(|r| r.synthesized));
    assert!(!task.events()[3].synthesized);
    assert_eq!(task.events()[3].event_id, "e-end");
    assert_eq!(task.current_state(), Some(EventKind::End));
    assert_eq!(task.result(), Some(Value::Null));
}

#[test]
fn test_success_after_init_implies_only_start() {
    let mut task = Task::new("t1");
    task.add_event(&init("e1", "math", json!(1))).unwrap();

    task.add_event(&json!({"eventId": "e2", "event": "success", "result": 2}))
        .unwrap();

    assert_eq!(kinds(&task), vec![EventKind::Init, EventKind::Start, EventKind::Success]);
    assert!(task.has_happened(EventKind::Start));
    assert_eq!(task.result(), Some(json!(2)));
}

#[test]
fn test_end_after_fail_does_not_imply_success() {
    let mut task = Task::new("t1");
    task.add_event(&init("e1", "math", json!(1))).unwrap();
    task.add_event(&json!({"eventId": "e2", "event": "fail", "reason": "boom"}))
        .unwrap();

    task.add_event(&event("e3", "end")).unwrap();

    assert!(!task.has_happened(EventKind::Success));
    assert_eq!(task.result(), None);
    assert_eq!(task.reason(), Some(json!("boom")));
    assert!(task.is_finished());
}

#[test]
fn test_implied_predecessors_share_the_event_timestamp() {
    let mut task = Task::new("t1");

    task.add_event(&json!({"eventId": "e-up", "event": "update", "update": 1}))
        .unwrap();

    let init_at = task.happened_at(EventKind::Init).expect("init should be implied");
    assert_eq!(task.happened_at(EventKind::Start), Some(init_at));
    assert_eq!(task.happened_at(EventKind::Update), Some(init_at));
    assert_eq!(task.happened_at(EventKind::Success), None);
    assert!(task.events().iter().all(|r| r.at == init_at));
}

#[test]
fn test_synthesized_ids_are_unique_within_task() {
    let mut task = Task::new("t1");
    task.add_event(&event("e-end", "end")).unwrap();

    let mut ids: Vec<&str> = task.events().iter().map(|r| r.event_id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

// =============================================================================
// Rejected Events
// =============================================================================

#[test]
fn test_duplicate_event_id_changes_nothing() {
    let mut task = Task::new("t1");
    task.add_event(&init("e1", "math", json!(1))).unwrap();
    task.add_event(&event("e2", "start")).unwrap();

    let err = task.add_event(&event("e2", "drop")).unwrap_err();

    assert!(matches!(err, Error::DuplicateEvent(ref id) if id == "e2"));
    assert_eq!(task.events().len(), 2);
    assert_eq!(task.current_state(), Some(EventKind::Start));
    assert!(!task.has_happened(EventKind::Drop));
}

#[test]
fn test_nothing_is_accepted_after_end() {
    let mut task = Task::new("t1");
    task.add_event(&event("e1", "end")).unwrap();

    for name in ["start", "drop", "end"] {
        let err = task.add_event(&event(&format!("late-{}", name), name)).unwrap_err();
        assert_eq!(err.kind(), "InvalidTransitionError", "{} after end", name);
    }
    assert_eq!(task.events().len(), 4);
}

#[test]
fn test_validation_errors_leave_task_untouched() {
    let mut task = Task::new("t1");

    let err = task.add_event(&json!({"eventId": "e1", "event": "init", "payload": 1})).unwrap_err();
    assert_eq!(err.kind(), "ValidationError");

    let err = task.add_event(&json!({"eventId": "e2", "event": "resume"})).unwrap_err();
    assert_eq!(err.kind(), "UnsupportedEventError");

    assert!(task.events().is_empty());
    assert_eq!(task.current_state(), None);
}

// =============================================================================
// Payload and Updates
// =============================================================================

#[test]
fn test_payload_is_a_copy() {
    let mut task = Task::new("t1");
    task.add_event(&init("e1", "math", json!({"a": [1, 2]}))).unwrap();

    let mut payload = task.payload();
    payload["a"] = json!("changed");

    assert_eq!(task.payload(), json!({"a": [1, 2]}));
}

#[test]
fn test_updates_keep_the_latest_value() {
    let mut task = Task::new("t1");
    task.add_event(&init("e1", "math", json!(null))).unwrap();

    task.add_event(&json!({"eventId": "e2", "event": "update", "update": 1}))
        .unwrap();
    task.add_event(&json!({"eventId": "e3", "event": "drop"})).unwrap();
    task.add_event(&json!({"eventId": "e4", "event": "update", "update": 2}))
        .unwrap();

    assert_eq!(task.last_update(), Some(json!(2)));
    assert_eq!(task.current_state(), Some(EventKind::Update));
}

// =============================================================================
// Observers and Results
// =============================================================================

#[test]
fn test_observers_see_applied_state() {
    let mut task = Task::new("t1");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    task.on(EventKind::Success, move |t| {
        sink.lock().unwrap().push(t.result());
    });

    task.add_event(&init("e1", "math", json!(1))).unwrap();
    task.add_event(&json!({"eventId": "e2", "event": "success", "result": "ok"}))
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some(json!("ok"))]);
}

#[tokio::test]
async fn test_result_waits_for_outcome() {
    let mut task = Task::new("t1");
    task.add_event(&init("e1", "math", json!(1))).unwrap();

    let pending = task.get_result(Some(json!("default")));
    task.add_event(&json!({"eventId": "e2", "event": "success", "result": 7}))
        .unwrap();

    assert_eq!(pending.await.unwrap(), json!(7));
}

#[tokio::test]
async fn test_result_after_fail_without_default_is_an_error() {
    let mut task = Task::new("t1");
    task.add_event(&init("e1", "math", json!(1))).unwrap();
    task.add_event(&json!({"eventId": "e2", "event": "fail", "reason": "nope"}))
        .unwrap();

    let err = task.get_result(None).await.unwrap_err();
    assert!(matches!(err, Error::NoResult { ref task_id } if task_id == "t1"));
}
