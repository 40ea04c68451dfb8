//! The conductor: drives a composed [`WorkflowGraph`] to completion by staging ready
//! task instances and accepting [`ActionExecutionEvent`]s for completed ones.
//!
//! Synchronous and I/O-free by design: every method is a pure state-machine step over
//! an in-memory [`WorkflowState`]. Action execution, scheduling, and persistence are
//! external collaborators that call in through this API.

use serde_json::{Map, Value};
use snafu::prelude::*;
use tracing::{debug, trace};

use crate::composer;
use crate::config::ConductorConfig;
use crate::context;
use crate::events::ActionExecutionEvent;
use crate::expressions::Registry;
use crate::graph::{Barrier, WorkflowGraph};
use crate::spec::WorkflowSpec;
use crate::state::{RouteId, WorkflowState};
use crate::status::Status;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to compose workflow spec: {source}"))]
    Compose { source: composer::Error },

    #[snafu(display("workflow state error: {source}"))]
    State { source: crate::state::Error },

    #[snafu(display("workflow status error: {source}"))]
    WorkflowStatus { source: crate::status::Error },

    #[snafu(display("context rendering error: {source}"))]
    Context { source: context::Error },

    #[snafu(display("expression evaluation error: {source}"))]
    Expression { source: crate::expressions::Error },

    #[snafu(display("no task instance with id `{id}`"))]
    UnknownTaskInstance { id: String },

    #[snafu(display(
        "staged backlog of {count} exceeds configured max of {max}; the caller is falling behind"
    ))]
    StagedBacklogExceeded { count: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<composer::Error> for Error {
    fn from(source: composer::Error) -> Self {
        Error::Compose { source }
    }
}

impl From<crate::state::Error> for Error {
    fn from(source: crate::state::Error) -> Self {
        Error::State { source }
    }
}

impl From<crate::status::Error> for Error {
    fn from(source: crate::status::Error) -> Self {
        Error::WorkflowStatus { source }
    }
}

impl From<context::Error> for Error {
    fn from(source: context::Error) -> Self {
        Error::Context { source }
    }
}

impl From<crate::expressions::Error> for Error {
    fn from(source: crate::expressions::Error) -> Self {
        Error::Expression { source }
    }
}

/// A task instance ready for dispatch to the external executor.
#[derive(Debug, Clone)]
pub struct StagedTask {
    pub id: String,
    pub name: String,
    pub route: RouteId,
    pub input: Value,
    pub item: Option<Value>,
    pub item_index: Option<usize>,
    /// Delay reported by a pending retry attempt. Reported only, never enforced —
    /// the conductor does not schedule in wall-clock time.
    pub delay: Option<f64>,
}

pub struct Conductor<S: WorkflowSpec> {
    spec: S,
    graph: WorkflowGraph,
    state: WorkflowState,
    registry: Registry,
    config: ConductorConfig,
}

impl<S: WorkflowSpec> Conductor<S> {
    /// Compose `spec` into a graph and seed workflow state from `spec.vars()` merged
    /// under the caller-supplied `input`.
    pub fn new(spec: S, input: Value) -> Result<Self> {
        Self::with_config(spec, input, ConductorConfig::default())
    }

    pub fn with_config(spec: S, input: Value, config: ConductorConfig) -> Result<Self> {
        let graph = composer::compose(&spec)?;
        let base_vars: Value = {
            let mut m = Map::new();
            for (k, v) in spec.vars() {
                m.insert(k.clone(), v.clone());
            }
            Value::Object(m)
        };
        let initial = context::merge(&base_vars, &input, &[]);
        let state = WorkflowState::new(initial);
        Ok(Self {
            spec,
            graph,
            state,
            registry: Registry::new(),
            config,
        })
    }

    #[must_use]
    pub fn get_workflow_status(&self) -> Status {
        self.state.status
    }

    #[must_use]
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    #[must_use]
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn set_workflow_state(&mut self, state: WorkflowState) {
        self.state = state;
        self.state.reindex();
    }

    /// Request an externally-driven workflow status change: starting, pausing,
    /// resuming, or canceling. Requesting `CANCELED` or `CANCELING` on an active
    /// workflow lowers to `CANCELING` and only settles to `CANCELED` once every task
    /// has reached a terminal status;
    /// requesting `PAUSED` on an active workflow likewise lowers to `PAUSING`.
    pub fn request_workflow_status(&mut self, status: Status) -> Result<()> {
        match status {
            Status::Canceled | Status::Canceling => return self.request_cancel(),
            Status::Paused if self.state.status.is_active() => {
                self.state.set_workflow_status(Status::Pausing)?;
                return Ok(());
            }
            _ => {}
        }
        self.state.set_workflow_status(status)?;
        Ok(())
    }

    /// Cancellation protocol: if no task is currently active, settle
    /// directly to `Canceled`; otherwise drive every active task to `Canceling`, drop
    /// not-yet-dispatched staged work (already-dispatched with-items children are left
    /// to drain to a terminal status), and settle to `Canceled` once quiescent.
    fn request_cancel(&mut self) -> Result<()> {
        if self.state.active_task_ids().is_empty() {
            debug!("cancel requested with no active tasks, settling immediately");
            self.state.set_workflow_status(Status::Canceled)?;
            return Ok(());
        }
        debug!(active = self.state.active_task_ids().len(), "cancel requested, draining active tasks");
        self.state.set_workflow_status(Status::Canceling)?;
        for id in self.state.active_task_ids() {
            // A task still `Requested` was never dispatched (no `Requested -> Canceling`
            // edge exists) and never will be now that `staged` is about to be cleared, so
            // it settles straight to `Canceled` rather than stranding the drain waiting on
            // an event that can't arrive.
            let current = self.state.task(&id).map(|t| t.status).unwrap_or(Status::Requested);
            let target = if current == Status::Requested {
                Status::Canceled
            } else {
                Status::Canceling
            };
            let _ = self.state.set_task_status(&id, target);
        }
        self.state.staged.clear();
        if self.state.is_quiescent() {
            self.state.set_workflow_status(Status::Canceled)?;
        }
        Ok(())
    }

    fn task_statuses_value(&self) -> Value {
        let mut m = Map::new();
        for id in &self.state.sequence {
            if let Some(t) = self.state.task(id) {
                m.insert(t.name.clone(), Value::String(t.status.to_string()));
            }
        }
        Value::Object(m)
    }

    fn inherited_context(&self, ctxs: &[usize]) -> Value {
        let mut acc = Value::Object(Map::new());
        for &i in ctxs {
            if let Some(c) = self.state.contexts.get(i) {
                acc = context::merge(&acc, c, &[]);
            }
        }
        acc
    }

    fn render_instance_context(
        &self,
        ctxs: &[usize],
        task_name: &str,
        item: Option<&Value>,
        result: Option<&Value>,
    ) -> Value {
        let inherited = self.inherited_context(ctxs);
        context::with_reserved(
            &inherited,
            task_name,
            self.state.status,
            &self.task_statuses_value(),
            item,
            result,
        )
    }

    fn start_if_needed(&mut self) -> Result<()> {
        if self.state.status != Status::Unset {
            return Ok(());
        }
        debug!("workflow unset, requesting start");
        self.state.set_workflow_status(Status::Requested)?;
        self.state.set_workflow_status(Status::Running)?;
        for (name, _expr, _condition) in self.spec.get_start_tasks() {
            let id = self.state.get_or_create_task(&name, 0, vec![0]);
            debug!(task = %name, %id, "staging start task");
            self.state.stage(&id);
        }
        Ok(())
    }

    /// Stage every task instance that became ready since the last call, rendering
    /// each one's input. With-items tasks are expanded up to their configured
    /// concurrency; plain tasks dispatch once.
    pub fn get_next_tasks(&mut self) -> Result<Vec<StagedTask>> {
        self.start_if_needed()?;

        if self.state.status != Status::Running {
            return Ok(Vec::new());
        }

        ensure!(
            self.state.staged.len() <= self.config.max_staged_backlog,
            StagedBacklogExceededSnafu {
                count: self.state.staged.len(),
                max: self.config.max_staged_backlog,
            }
        );

        let mut out = Vec::new();
        let staged_ids = std::mem::take(&mut self.state.staged);

        for id in staged_ids {
            let Some(entry) = self.state.task(&id).cloned() else {
                continue;
            };
            if entry.status.is_completed() {
                continue;
            }

            let task_spec = self.spec.get_task(&entry.name).cloned();

            if let Some(with_items) = task_spec.as_ref().and_then(|t| t.with_items.clone()) {
                self.stage_with_items(&id, &entry, &with_items, task_spec.as_ref(), &mut out)?;
                continue;
            }

            let delay = entry.pending_delay;
            if entry.status == Status::Requested {
                self.state.set_task_status(&id, Status::Scheduled)?;
            }
            if let Some(e) = self.state.task_mut(&id) {
                e.pending_delay = None;
            }
            let ctx = self.render_instance_context(&entry.ctxs, &entry.name, None, None);
            let input = match &task_spec {
                Some(t) => context::render_input(&self.registry, &ctx, &t.input)?,
                None => Value::Null,
            };
            out.push(StagedTask {
                id: id.clone(),
                name: entry.name.clone(),
                route: entry.route,
                input,
                item: None,
                item_index: None,
                delay,
            });
        }

        Ok(out)
    }

    fn stage_with_items(
        &mut self,
        id: &str,
        entry: &crate::state::TaskEntry,
        with_items: &crate::spec::WithItemsSpec,
        task_spec: Option<&crate::spec::TaskSpec>,
        out: &mut Vec<StagedTask>,
    ) -> Result<()> {
        if entry.status == Status::Canceling || entry.status.is_completed() {
            // Cancellation in flight: let already-dispatched items settle, but never
            // dispatch the remaining ones.
            return Ok(());
        }

        let ctx = self.render_instance_context(&entry.ctxs, &entry.name, None, None);
        let items_value = self.registry.evaluate(&with_items.items, &ctx)?;
        let items: Vec<Value> = items_value.as_array().cloned().unwrap_or_default();

        if entry.status == Status::Requested && items.is_empty() {
            // An empty sequence succeeds immediately with no dispatched action: there is
            // no item event to wait on, so staging it `Running` and returning would hang
            // the workflow forever.
            self.state.set_task_status(id, Status::Scheduled)?;
            self.state.set_task_status(id, Status::Running)?;
            if let Some(e) = self.state.task_mut(id) {
                e.items = Some(Vec::new());
            }
            self.state.set_task_status(id, Status::Succeeded)?;
            self.fire_transitions(id, Some(&Value::Array(Vec::new())))?;
            return Ok(());
        }

        let concurrency = with_items
            .concurrency
            .unwrap_or(self.config.default_with_items_concurrency)
            .max(1) as usize;

        if entry.status == Status::Requested {
            self.state.set_task_status(id, Status::Scheduled)?;
            self.state.set_task_status(id, Status::Running)?;
            if let Some(e) = self.state.task_mut(id) {
                e.items = Some(
                    items
                        .iter()
                        .enumerate()
                        .map(|(index, _)| crate::state::ItemEntry {
                            index,
                            status: Status::Requested,
                            result: None,
                        })
                        .collect(),
                );
            }
        }

        let running = self
            .state
            .task(id)
            .and_then(|e| e.items.as_ref())
            .map(|items| items.iter().filter(|i| i.status == Status::Running).count())
            .unwrap_or(0);
        let slots = concurrency.saturating_sub(running);

        let to_dispatch: Vec<usize> = self
            .state
            .task(id)
            .and_then(|e| e.items.as_ref())
            .map(|items| {
                items
                    .iter()
                    .filter(|i| i.status == Status::Requested)
                    .take(slots)
                    .map(|i| i.index)
                    .collect()
            })
            .unwrap_or_default();

        for idx in to_dispatch {
            let item_val = items.get(idx).cloned().unwrap_or(Value::Null);
            let item_ctx =
                self.render_instance_context(&entry.ctxs, &entry.name, Some(&item_val), None);
            let input = match task_spec {
                Some(t) => context::render_input(&self.registry, &item_ctx, &t.input)?,
                None => Value::Null,
            };
            if let Some(e) = self.state.task_mut(id) {
                if let Some(items_mut) = e.items.as_mut() {
                    if let Some(it) = items_mut.iter_mut().find(|i| i.index == idx) {
                        it.status = Status::Running;
                    }
                }
            }
            out.push(StagedTask {
                id: id.to_string(),
                name: entry.name.clone(),
                route: entry.route,
                input,
                item: Some(item_val),
                item_index: Some(idx),
                delay: None,
            });
        }
        Ok(())
    }

    /// Apply the outcome of one action execution. For a with-items item event, once
    /// every item has settled the task instance as a whole transitions to
    /// `Succeeded`/`Failed` and its transitions fire.
    pub fn update_task_state(&mut self, event: ActionExecutionEvent) -> Result<()> {
        let id = event.task_id.clone();
        debug!(%id, status = %event.status, item = ?event.item_index, "task event received");
        ensure!(
            self.state.task(&id).is_some(),
            UnknownTaskInstanceSnafu { id: id.clone() }
        );

        if let Some(idx) = event.item_index {
            self.apply_item_event(&id, idx, &event)?;
        } else {
            self.apply_task_event(&id, &event)?;
        }

        // A task canceling on its own (an item reported canceled/canceling without
        // the caller ever requesting it) still drags the workflow into `canceling`.
        if self.state.status == Status::Running
            && self.state.tasks.values().any(|t| t.status == Status::Canceling)
        {
            self.state.set_workflow_status(Status::Canceling)?;
        }

        if self.state.status == Status::Canceling && self.state.is_quiescent() {
            self.state.set_workflow_status(Status::Canceled)?;
        }
        self.maybe_complete_workflow()?;
        Ok(())
    }

    fn apply_item_event(&mut self, id: &str, idx: usize, event: &ActionExecutionEvent) -> Result<()> {
        if let Some(e) = self.state.task_mut(id) {
            if let Some(items) = e.items.as_mut() {
                if let Some(it) = items.iter_mut().find(|i| i.index == idx) {
                    it.status = event.status;
                    it.result = event.result.clone();
                }
            }
        }

        if matches!(event.status, Status::Canceling | Status::Canceled)
            && self.state.task(id).map(|e| e.status) == Some(Status::Running)
        {
            self.state.set_task_status(id, Status::Canceling)?;
        }
        let canceling = self.state.task(id).map(|e| e.status) == Some(Status::Canceling);

        // While canceling, items still `Requested` were never dispatched and never
        // will be (`stage_with_items` refuses to dispatch once canceling) — they're
        // abandoned, not awaited.
        let all_settled = self
            .state
            .task(id)
            .and_then(|e| e.items.as_ref())
            .map(|items| {
                items
                    .iter()
                    .all(|i| i.status.is_completed() || (canceling && i.status == Status::Requested))
            })
            .unwrap_or(false);
        if !all_settled {
            // A concurrency slot just freed; restage so the next `get_next_tasks`
            // call dispatches the next waiting item.
            self.state.stage(id);
            return Ok(());
        }

        let any_canceled = self
            .state
            .task(id)
            .and_then(|e| e.items.as_ref())
            .map(|items| items.iter().any(|i| i.status == Status::Canceled))
            .unwrap_or(false);
        let all_ok = self
            .state
            .task(id)
            .and_then(|e| e.items.as_ref())
            .map(|items| {
                items
                    .iter()
                    .filter(|i| i.status != Status::Requested)
                    .all(|i| i.status == Status::Succeeded)
            })
            .unwrap_or(false);
        let results = self
            .state
            .task(id)
            .and_then(|e| e.items.as_ref())
            .map(|items| items.iter().map(|i| i.result.clone().unwrap_or(Value::Null)).collect::<Vec<_>>())
            .unwrap_or_default();

        let overall = if canceling || any_canceled {
            Status::Canceled
        } else if all_ok {
            Status::Succeeded
        } else {
            Status::Failed
        };
        self.state.set_task_status(id, overall)?;
        if overall.is_abended() && self.maybe_retry(id)? {
            return Ok(());
        }
        self.fire_transitions(id, Some(&Value::Array(results)))?;
        Ok(())
    }

    fn apply_task_event(&mut self, id: &str, event: &ActionExecutionEvent) -> Result<()> {
        let current = self.state.task(id).map(|e| e.status).unwrap_or(Status::Requested);
        if current == Status::Requested || current == Status::Scheduled {
            self.state.set_task_status(id, Status::Running)?;
        }
        self.state.set_task_status(id, event.status)?;

        if let Some(published) = &event.context {
            let idx = self.state.add_context(published.clone());
            if let Some(e) = self.state.task_mut(id) {
                e.ctxs.push(idx);
            }
        }

        if event.status.is_completed() {
            if event.status.is_abended() && self.maybe_retry(id)? {
                return Ok(());
            }
            self.fire_transitions(id, event.result.as_ref())?;
        }
        Ok(())
    }

    /// If `id` just settled into an abended status and its spec carries a `retry`
    /// whose `when` (if any) is truthy and whose attempt count isn't exhausted, re-arm
    /// it for another attempt and report `true` so the caller skips firing outbound
    /// transitions for this (now-superseded) terminal status. Per the Open
    /// Question #1, retry is per-task: a with-items task's whole item list is
    /// re-evaluated from scratch, not just the items that failed.
    fn maybe_retry(&mut self, id: &str) -> Result<bool> {
        let Some(entry) = self.state.task(id).cloned() else {
            return Ok(false);
        };
        let Some(task_spec) = self.spec.get_task(&entry.name).cloned() else {
            return Ok(false);
        };
        let Some(retry) = task_spec.retry else {
            return Ok(false);
        };
        if entry.retries >= retry.count {
            return Ok(false);
        }

        let should_retry = match &retry.when {
            Some(expr) => {
                let ctx = self.render_instance_context(&entry.ctxs, &entry.name, None, None);
                matches!(self.registry.evaluate(expr, &ctx)?, Value::Bool(true))
            }
            None => true,
        };
        if !should_retry {
            return Ok(false);
        }

        debug!(%id, attempt = entry.retries + 1, limit = retry.count, "retrying abended task");
        self.state.retry_task(id, retry.delay)?;
        self.state.stage(id);
        Ok(true)
    }

    /// Evaluate `id`'s outbound transitions and stage whichever successors become
    /// ready, honoring join barriers and forking a new route when `id` has more than
    /// one outbound transition (route-fork rule).
    fn fire_transitions(&mut self, id: &str, result: Option<&Value>) -> Result<()> {
        let Some(entry) = self.state.task(id).cloned() else {
            return Ok(());
        };
        let successors: Vec<(String, Vec<String>)> = self
            .graph
            .successors(&entry.name)
            .into_iter()
            .map(|(n, c)| (n.to_string(), c.to_vec()))
            .collect();
        let forks = successors.len() > 1 && !self.spec.is_join_task(&entry.name);
        let task_spec = self.spec.get_task(&entry.name).cloned();

        let ctx = self.render_instance_context(&entry.ctxs, &entry.name, None, result);

        for (succ, criteria) in successors {
            let already_fired = self.state.task(id).map(|e| e.has_fired(&succ)).unwrap_or(true);
            if already_fired {
                continue;
            }
            if let Some(e) = self.state.task_mut(id) {
                e.mark_fired(&succ);
            }

            let satisfied = criteria
                .iter()
                .map(|c| self.registry.evaluate(c, &ctx))
                .collect::<std::result::Result<Vec<Value>, _>>()?
                .iter()
                .all(|v| matches!(v, Value::Bool(true)));
            if !satisfied {
                continue;
            }

            let route = if self.spec.is_join_task(&succ) {
                0
            } else if forks {
                self.state.add_route(entry.route, &entry.name)
            } else {
                entry.route
            };

            let succ_id = self.state.get_or_create_task(&succ, route, entry.ctxs.clone());
            trace!(from = %entry.name, to = %succ, route, "transition criteria satisfied");

            if let Some(ts) = &task_spec {
                let mut published = Map::new();
                for tr in ts.next.iter().filter(|tr| tr.next == succ) {
                    for (var, expr) in &tr.publish {
                        published.insert(var.clone(), self.registry.evaluate(expr, &ctx)?);
                    }
                }
                if !published.is_empty() {
                    let ctx_idx = self.state.add_context(Value::Object(published));
                    if let Some(se) = self.state.task_mut(&succ_id) {
                        se.ctxs.push(ctx_idx);
                    }
                }
            }

            let barrier = self
                .graph
                .node(&succ)
                .map(|n| n.barrier.clone())
                .unwrap_or(Barrier::Unset);

            let ready = match barrier {
                Barrier::Unset => true,
                Barrier::All => {
                    if let Some(se) = self.state.task_mut(&succ_id) {
                        se.prev.insert(entry.name.clone(), criteria.clone());
                    }
                    let total = self.graph.predecessors(&succ).len();
                    self.state.task(&succ_id).map(|se| se.prev.len()).unwrap_or(0) >= total
                }
                Barrier::Count(n) => {
                    if let Some(se) = self.state.task_mut(&succ_id) {
                        se.prev.insert(entry.name.clone(), criteria.clone());
                    }
                    self.state.task(&succ_id).map(|se| se.prev.len()).unwrap_or(0) >= n as usize
                }
            };

            if ready && self.state.task(&succ_id).map(|t| t.status == Status::Requested).unwrap_or(false) {
                self.state.stage(&succ_id);
            }
        }
        Ok(())
    }

    fn maybe_complete_workflow(&mut self) -> Result<()> {
        if self.state.status.is_completed() {
            return Ok(());
        }
        if !self.state.staged.is_empty() || !self.state.is_quiescent() {
            return Ok(());
        }

        if self.state.status == Status::Canceling {
            self.state.set_workflow_status(Status::Canceled)?;
            return Ok(());
        }

        let any_abended = self.state.tasks.values().any(|t| t.status.is_abended());
        let overall = if any_abended { Status::Failed } else { Status::Succeeded };
        debug!(status = %overall, "workflow quiescent, settling");
        self.state.set_workflow_status(overall)?;

        let outputs = self.spec.outputs();
        if !outputs.is_empty() {
            let all_ctx_indices: Vec<usize> = (0..self.state.contexts.len()).collect();
            let final_ctx = self.render_instance_context(&all_ctx_indices, "__workflow__", None, None);
            self.state.output = Some(context::render_outputs(&self.registry, &final_ctx, outputs)?);
        }
        Ok(())
    }

    #[must_use]
    pub fn get_workflow_output(&self) -> Option<&Value> {
        self.state.output.as_ref()
    }
}

impl<S> Conductor<S>
where
    S: WorkflowSpec + serde::Serialize + Clone,
{
    /// `{spec, graph, state}` serialized as one document — the unit the external
    /// caller persists between conductor cycles.
    pub fn serialize(&self) -> std::result::Result<Value, serde_json::Error> {
        serde_json::to_value(serde_json::json!({
            "spec": &self.spec,
            "graph": &self.graph,
            "state": &self.state,
        }))
    }
}

impl<S> Conductor<S>
where
    S: WorkflowSpec + serde::de::DeserializeOwned + Clone,
{
    pub fn deserialize(doc: Value) -> std::result::Result<Self, serde_json::Error> {
        let spec: S = serde_json::from_value(doc["spec"].clone())?;
        let graph: WorkflowGraph = serde_json::from_value(doc["graph"].clone())?;
        let mut state: WorkflowState = serde_json::from_value(doc["state"].clone())?;
        state.reindex();
        Ok(Self {
            spec,
            graph,
            state,
            registry: Registry::new(),
            config: ConductorConfig::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{NativeWorkflowSpec, TaskSpec, TransitionCondition, TransitionSpec};
    use serde_json::json;

    fn transition(next: &str, condition: TransitionCondition) -> TransitionSpec {
        TransitionSpec {
            next: next.to_string(),
            condition,
            expr: None,
            publish: Vec::new(),
        }
    }

    fn task(name: &str, next: Vec<TransitionSpec>) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            action: Some("noop".to_string()),
            input: Vec::new(),
            with_items: None,
            retry: None,
            join: None,
            next,
        }
    }

    #[test]
    fn linear_workflow_runs_start_to_finish() {
        let spec = NativeWorkflowSpec::builder()
            .task(task("t1", vec![transition("t2", TransitionCondition::OnSuccess)]))
            .task(task("t2", vec![]))
            .build();
        let mut conductor = Conductor::new(spec, json!({})).unwrap();

        let staged = conductor.get_next_tasks().unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].name, "t1");

        conductor
            .update_task_state(ActionExecutionEvent::new(staged[0].id.clone(), Status::Succeeded))
            .unwrap();

        let staged2 = conductor.get_next_tasks().unwrap();
        assert_eq!(staged2.len(), 1);
        assert_eq!(staged2[0].name, "t2");

        conductor
            .update_task_state(ActionExecutionEvent::new(staged2[0].id.clone(), Status::Succeeded))
            .unwrap();
        conductor.get_next_tasks().unwrap();

        assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
    }

    #[test]
    fn a_failed_task_fails_the_workflow() {
        let spec = NativeWorkflowSpec::builder()
            .task(task("t1", vec![transition("t2", TransitionCondition::OnSuccess)]))
            .task(task("t2", vec![]))
            .build();
        let mut conductor = Conductor::new(spec, json!({})).unwrap();
        let staged = conductor.get_next_tasks().unwrap();

        conductor
            .update_task_state(ActionExecutionEvent::new(staged[0].id.clone(), Status::Failed))
            .unwrap();
        conductor.get_next_tasks().unwrap();

        assert_eq!(conductor.get_workflow_status(), Status::Failed);
    }

    #[test]
    fn join_all_waits_for_every_branch() {
        let mut join_task = task("join", vec![]);
        join_task.join = Some(crate::spec::JoinSpec::All);

        let spec = NativeWorkflowSpec::builder()
            .task(task(
                "start",
                vec![
                    transition("a", TransitionCondition::OnSuccess),
                    transition("b", TransitionCondition::OnSuccess),
                ],
            ))
            .task(task("a", vec![transition("join", TransitionCondition::OnSuccess)]))
            .task(task("b", vec![transition("join", TransitionCondition::OnSuccess)]))
            .task(join_task)
            .build();

        let mut conductor = Conductor::new(spec, json!({})).unwrap();
        let staged = conductor.get_next_tasks().unwrap();
        assert_eq!(staged[0].name, "start");
        conductor
            .update_task_state(ActionExecutionEvent::new(staged[0].id.clone(), Status::Succeeded))
            .unwrap();

        let staged2 = conductor.get_next_tasks().unwrap();
        assert_eq!(staged2.len(), 2);

        conductor
            .update_task_state(ActionExecutionEvent::new(staged2[0].id.clone(), Status::Succeeded))
            .unwrap();
        let mid = conductor.get_next_tasks().unwrap();
        assert!(mid.is_empty(), "join must not fire after only one branch completes");

        conductor
            .update_task_state(ActionExecutionEvent::new(staged2[1].id.clone(), Status::Succeeded))
            .unwrap();
        let staged3 = conductor.get_next_tasks().unwrap();
        assert_eq!(staged3.len(), 1);
        assert_eq!(staged3[0].name, "join");
    }

    #[test]
    fn with_items_dispatches_one_action_per_item_and_aggregates() {
        let mut t1 = task("t1", vec![]);
        t1.with_items = Some(crate::spec::WithItemsSpec {
            items: "<% ctx(xs) %>".to_string(),
            concurrency: Some(2),
        });
        let spec = NativeWorkflowSpec::builder().task(t1).build();

        let mut conductor = Conductor::new(spec, json!({"xs": [1, 2, 3]})).unwrap();
        let staged = conductor.get_next_tasks().unwrap();
        assert_eq!(staged.len(), 2, "concurrency caps in-flight items");

        for s in &staged {
            conductor
                .update_task_state(
                    ActionExecutionEvent::new(s.id.clone(), Status::Succeeded)
                        .for_item(s.item_index.unwrap()),
                )
                .unwrap();
        }
        let staged2 = conductor.get_next_tasks().unwrap();
        assert_eq!(staged2.len(), 1, "remaining item dispatches once a slot frees");

        conductor
            .update_task_state(
                ActionExecutionEvent::new(staged2[0].id.clone(), Status::Succeeded)
                    .for_item(staged2[0].item_index.unwrap()),
            )
            .unwrap();
        conductor.get_next_tasks().unwrap();
        assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
    }

    #[test]
    fn cancel_request_drives_active_tasks_to_canceling() {
        let spec = NativeWorkflowSpec::builder().task(task("t1", vec![])).build();
        let mut conductor = Conductor::new(spec, json!({})).unwrap();
        let staged = conductor.get_next_tasks().unwrap();
        let id = staged[0].id.clone();

        conductor.request_workflow_status(Status::Canceling).unwrap();
        assert_eq!(conductor.state().task(&id).unwrap().status, Status::Canceling);
        assert_eq!(conductor.get_workflow_status(), Status::Canceling);

        conductor
            .update_task_state(ActionExecutionEvent::new(id, Status::Canceled))
            .unwrap();
        assert_eq!(conductor.get_workflow_status(), Status::Canceled);
    }

    #[test]
    fn retry_re_stages_task_up_to_count_then_gives_up() {
        let mut t1 = task("t1", vec![transition("t2", TransitionCondition::OnSuccess)]);
        t1.retry = Some(crate::spec::RetrySpec {
            count: 2,
            when: None,
            delay: Some(5.0),
        });
        let spec = NativeWorkflowSpec::builder()
            .task(t1)
            .task(task("t2", vec![]))
            .build();
        let mut conductor = Conductor::new(spec, json!({})).unwrap();

        let staged = conductor.get_next_tasks().unwrap();
        assert_eq!(staged[0].delay, None);
        conductor
            .update_task_state(ActionExecutionEvent::new(staged[0].id.clone(), Status::Failed))
            .unwrap();

        // First failure retries: t2 must not be staged yet, and the retry reports delay.
        let retried = conductor.get_next_tasks().unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].name, "t1");
        assert_eq!(retried[0].delay, Some(5.0));

        conductor
            .update_task_state(ActionExecutionEvent::new(retried[0].id.clone(), Status::Failed))
            .unwrap();

        // Second failure retries again (count = 2 means two total retries allowed).
        let retried2 = conductor.get_next_tasks().unwrap();
        assert_eq!(retried2.len(), 1);
        assert_eq!(retried2[0].name, "t1");

        conductor
            .update_task_state(ActionExecutionEvent::new(retried2[0].id.clone(), Status::Failed))
            .unwrap();

        // Retries exhausted: the abend is final and the workflow fails.
        let after = conductor.get_next_tasks().unwrap();
        assert!(after.is_empty());
        assert_eq!(conductor.get_workflow_status(), Status::Failed);
    }

    #[test]
    fn retry_when_expression_gates_reattempt() {
        let mut t1 = task("t1", vec![]);
        t1.retry = Some(crate::spec::RetrySpec {
            count: 3,
            when: Some("<% ctx(should_retry) %>".to_string()),
            delay: None,
        });
        let spec = NativeWorkflowSpec::builder().task(t1).build();
        let mut conductor = Conductor::new(spec, json!({"should_retry": false})).unwrap();

        let staged = conductor.get_next_tasks().unwrap();
        conductor
            .update_task_state(ActionExecutionEvent::new(staged[0].id.clone(), Status::Failed))
            .unwrap();

        assert!(conductor.get_next_tasks().unwrap().is_empty());
        assert_eq!(conductor.get_workflow_status(), Status::Failed);
    }

    #[test]
    fn serialize_then_deserialize_preserves_status() {
        let spec = NativeWorkflowSpec::builder().task(task("t1", vec![])).build();
        let mut conductor = Conductor::new(spec, json!({})).unwrap();
        conductor.get_next_tasks().unwrap();

        let doc = conductor.serialize().unwrap();
        let restored: Conductor<NativeWorkflowSpec> = Conductor::deserialize(doc).unwrap();
        assert_eq!(restored.get_workflow_status(), Status::Running);
    }
}
