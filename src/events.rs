//! The single event the conductor consumes from its external caller: the outcome of
//! one action execution, fed back in via `Conductor::update_task_state`.
//!
//! Internal bookkeeping events (a task entering `Running`, a workflow starting, …) are
//! derived by the conductor itself; this is the only event an external caller ever
//! constructs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::Status;

/// The result of one action execution, reported back to the conductor.
///
/// For a with-items task, `item_index` identifies which item this event settles;
/// `None` means the event is for the task as a whole (a non-with-items task, or a
/// with-items task's aggregate outcome).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecutionEvent {
    pub task_id: String,
    #[serde(default)]
    pub item_index: Option<usize>,
    pub status: Status,
    #[serde(default)]
    pub result: Option<Value>,
    /// Variables this execution published into the workflow context.
    #[serde(default)]
    pub context: Option<Value>,
}

impl ActionExecutionEvent {
    #[must_use]
    pub fn new(task_id: impl Into<String>, status: Status) -> Self {
        Self {
            task_id: task_id.into(),
            item_index: None,
            status,
            result: None,
            context: None,
        }
    }

    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn for_item(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }

    /// `(task_id, item_index)` identity for a with-items item event, if this event
    /// targets one.
    #[must_use]
    pub fn item_id(&self) -> Option<(String, usize)> {
        self.item_index.map(|i| (self.task_id.clone(), i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_chain_sets_all_fields() {
        let ev = ActionExecutionEvent::new("t1", Status::Succeeded)
            .with_result(json!({"ok": true}))
            .with_context(json!({"x": 1}))
            .for_item(2);

        assert_eq!(ev.task_id, "t1");
        assert_eq!(ev.item_index, Some(2));
        assert_eq!(ev.result, Some(json!({"ok": true})));
        assert_eq!(ev.item_id(), Some(("t1".to_string(), 2)));
    }

    #[test]
    fn non_item_event_has_no_item_id() {
        let ev = ActionExecutionEvent::new("t1", Status::Succeeded);
        assert_eq!(ev.item_id(), None);
    }

    #[test]
    fn serializes_with_status_as_lowercase_string() {
        let ev = ActionExecutionEvent::new("t1", Status::Failed);
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"failed\""));
    }
}
