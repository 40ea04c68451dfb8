//! The conductor's append-only execution record: contexts, routes, task instances,
//! and the staging/sequence bookkeeping the conductor reads and writes each cycle.
//!
//! Contexts, routes, and the task sequence are all append-only vectors; nothing is
//! ever mutated or removed once created, which keeps serialization a straight
//! structural copy.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;
use uuid::Uuid;

use crate::status::Status;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no task instance named `{name}` on route {route}"))]
    UnknownTask { name: String, route: usize },

    #[snafu(display("status transition rejected for task `{name}`: {source}"))]
    TaskTransition {
        name: String,
        source: crate::status::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

pub type RouteId = usize;

/// One "with-items" child: the item's status and, once settled, its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEntry {
    pub index: usize,
    pub status: Status,
    #[serde(default)]
    pub result: Option<Value>,
}

/// A single task instance: one `(name, route)` pair over the life of a workflow
/// execution. Retries reuse this entry rather than creating a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub name: String,
    pub route: RouteId,
    /// Indices into `WorkflowState::contexts` available for this instance to read,
    /// oldest first.
    pub ctxs: Vec<usize>,
    /// Predecessor task name -> transition criteria that satisfied it, accumulated
    /// for barrier counting.
    pub prev: IndexMap<String, Vec<String>>,
    /// Successor task name -> whether this instance has already fired that
    /// transition (an edge fires at most once per predecessor completion).
    pub next: IndexMap<String, bool>,
    pub status: Status,
    pub items: Option<Vec<ItemEntry>>,
    pub retries: u32,
    /// Delay reported to the caller for the next dispatch of this instance, set by a
    /// retry and consumed (cleared) the next time it is staged. The conductor never
    /// enforces this delay itself — there is no wall-clock scheduling here.
    #[serde(default)]
    pub pending_delay: Option<f64>,
}

impl TaskEntry {
    fn new(name: &str, route: RouteId, ctxs: Vec<usize>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            route,
            ctxs,
            prev: IndexMap::new(),
            next: IndexMap::new(),
            status: Status::Requested,
            items: None,
            retries: 0,
            pending_delay: None,
        }
    }

    #[must_use]
    pub fn has_fired(&self, successor: &str) -> bool {
        self.next.get(successor).copied().unwrap_or(false)
    }

    pub fn mark_fired(&mut self, successor: &str) {
        self.next.insert(successor.to_string(), true);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Append-only list of rendered contexts, oldest first. Index 0 is the initial
    /// context seeded from workflow input and declared vars.
    pub contexts: Vec<Value>,
    /// Append-only list of split route membership: `routes[0]` is always `[]` (the
    /// unsplit root route); `routes[n]` for `n > 0` lists the split task names this
    /// branch has passed through, outermost first.
    pub routes: Vec<Vec<String>>,
    /// Task instance ids in the order they were created.
    pub sequence: Vec<String>,
    /// Task instance ids currently staged (ready to hand to the external executor).
    pub staged: Vec<String>,
    pub tasks: IndexMap<String, TaskEntry>,
    pub status: Status,
    pub output: Option<Value>,
    pub errors: Vec<String>,
    #[serde(skip)]
    by_name_route: IndexMap<(String, RouteId), String>,
}

impl WorkflowState {
    #[must_use]
    pub fn new(initial_context: Value) -> Self {
        Self {
            contexts: vec![initial_context],
            routes: vec![Vec::new()],
            sequence: Vec::new(),
            staged: Vec::new(),
            tasks: IndexMap::new(),
            status: Status::Unset,
            output: None,
            errors: Vec::new(),
            by_name_route: IndexMap::new(),
        }
    }

    /// Rebuild the `(name, route)` lookup index after deserialization.
    pub fn reindex(&mut self) {
        self.by_name_route = self
            .tasks
            .values()
            .map(|t| ((t.name.clone(), t.route), t.id.clone()))
            .collect();
    }

    pub fn add_context(&mut self, ctx: Value) -> usize {
        self.contexts.push(ctx);
        self.contexts.len() - 1
    }

    /// Append a new route branching off `parent`, recording the split task that
    /// forked it. Routes are immutable once created.
    pub fn add_route(&mut self, parent: RouteId, split_task: &str) -> RouteId {
        let mut members = self.routes.get(parent).cloned().unwrap_or_default();
        members.push(split_task.to_string());
        self.routes.push(members);
        self.routes.len() - 1
    }

    #[must_use]
    pub fn task_by_name_route(&self, name: &str, route: RouteId) -> Option<&TaskEntry> {
        self.by_name_route
            .get(&(name.to_string(), route))
            .and_then(|id| self.tasks.get(id))
    }

    pub fn task_by_name_route_mut(&mut self, name: &str, route: RouteId) -> Option<&mut TaskEntry> {
        let id = self.by_name_route.get(&(name.to_string(), route))?.clone();
        self.tasks.get_mut(&id)
    }

    #[must_use]
    pub fn task(&self, id: &str) -> Option<&TaskEntry> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut TaskEntry> {
        self.tasks.get_mut(id)
    }

    /// Create a new task instance if one doesn't already exist for `(name, route)`,
    /// returning its instance id either way.
    pub fn get_or_create_task(&mut self, name: &str, route: RouteId, ctxs: Vec<usize>) -> String {
        if let Some(existing) = self.by_name_route.get(&(name.to_string(), route)) {
            return existing.clone();
        }
        let entry = TaskEntry::new(name, route, ctxs);
        let id = entry.id.clone();
        self.by_name_route
            .insert((name.to_string(), route), id.clone());
        self.tasks.insert(id.clone(), entry);
        self.sequence.push(id.clone());
        id
    }

    pub fn stage(&mut self, id: &str) {
        if !self.staged.contains(&id.to_string()) {
            self.staged.push(id.to_string());
        }
    }

    pub fn unstage(&mut self, id: &str) {
        self.staged.retain(|s| s != id);
    }

    pub fn set_task_status(&mut self, id: &str, status: Status) -> Result<()> {
        let task = self.tasks.get_mut(id).context(UnknownTaskSnafu {
            name: id.to_string(),
            route: 0usize,
        })?;
        crate::status::check_task_transition(task.status, status).context(TaskTransitionSnafu {
            name: task.name.clone(),
        })?;
        task.status = status;
        Ok(())
    }

    pub fn set_workflow_status(&mut self, status: Status) -> std::result::Result<(), crate::status::Error> {
        crate::status::check_workflow_transition(self.status, status)?;
        self.status = status;
        Ok(())
    }

    /// Re-arm an abended instance for another attempt under the same `(name, route)`
    /// identity. This is a new attempt, not a continuation of
    /// the just-settled one, so it bypasses `check_task_transition` rather than
    /// extending the transition table with an ABENDED -> REQUESTED edge that would
    /// apply to non-retry callers too.
    pub fn retry_task(&mut self, id: &str, delay: Option<f64>) -> Result<()> {
        let task = self.tasks.get_mut(id).context(UnknownTaskSnafu {
            name: id.to_string(),
            route: 0usize,
        })?;
        task.status = Status::Requested;
        task.retries += 1;
        task.pending_delay = delay;
        task.next.clear();
        task.items = None;
        Ok(())
    }

    #[must_use]
    pub fn active_task_ids(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.status.is_active() || t.status == Status::Scheduled || t.status == Status::Requested)
            .map(|t| t.id.clone())
            .collect()
    }

    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_completed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_state_seeds_one_context_and_root_route() {
        let state = WorkflowState::new(json!({"a": 1}));
        assert_eq!(state.contexts.len(), 1);
        assert_eq!(state.routes, vec![Vec::<String>::new()]);
    }

    #[test]
    fn get_or_create_task_is_idempotent_per_name_route() {
        let mut state = WorkflowState::new(json!({}));
        let id1 = state.get_or_create_task("t1", 0, vec![0]);
        let id2 = state.get_or_create_task("t1", 0, vec![0]);
        assert_eq!(id1, id2);
        assert_eq!(state.sequence.len(), 1);
    }

    #[test]
    fn add_route_inherits_parent_membership() {
        let mut state = WorkflowState::new(json!({}));
        let r1 = state.add_route(0, "split1");
        let r2 = state.add_route(r1, "split2");
        assert_eq!(state.routes[r2], vec!["split1".to_string(), "split2".to_string()]);
    }

    #[test]
    fn set_task_status_rejects_invalid_transition() {
        let mut state = WorkflowState::new(json!({}));
        let id = state.get_or_create_task("t1", 0, vec![0]);
        state.set_task_status(&id, Status::Succeeded).unwrap_err();
    }

    #[test]
    fn set_task_status_allows_valid_transition() {
        let mut state = WorkflowState::new(json!({}));
        let id = state.get_or_create_task("t1", 0, vec![0]);
        state.set_task_status(&id, Status::Scheduled).unwrap();
        state.set_task_status(&id, Status::Running).unwrap();
        state.set_task_status(&id, Status::Succeeded).unwrap();
        assert!(state.is_quiescent());
    }

    #[test]
    fn reindex_restores_lookup_after_round_trip() {
        let mut state = WorkflowState::new(json!({}));
        state.get_or_create_task("t1", 0, vec![0]);
        let json = serde_json::to_string(&state).unwrap();
        let mut restored: WorkflowState = serde_json::from_str(&json).unwrap();
        restored.reindex();
        assert!(restored.task_by_name_route("t1", 0).is_some());
    }
}
