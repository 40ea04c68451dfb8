//! # Baton — a workflow-orchestration conductor
//!
//! This crate is the CORE of a workflow orchestration engine: the **composer**, which
//! translates a declared workflow spec into an executable directed graph, and the
//! **conductor**, which drives that graph through completion by consuming
//! action-execution events and emitting the next tasks to run. The conductor owns all
//! ordering, join, branching, with-items, cancellation, and retry semantics.
//!
//! ## Scope
//!
//! - Expression *languages* (two dialects) are evaluated through [`expressions`], which
//!   dispatches to real third-party evaluators rather than hand-rolling a grammar.
//! - Spec *parsing* is out of scope; the conductor depends only on the [`spec::WorkflowSpec`]
//!   trait. [`spec::NativeWorkflowSpec`] is a minimal in-memory builder for embedding
//!   applications and tests, not a YAML/JSON front end.
//! - Persistence, network I/O, action execution, and CLI are out of scope. The
//!   conductor is synchronous and I/O-free; [`conductor::Conductor::serialize`] /
//!   [`conductor::Conductor::deserialize`] hand the caller a `serde_json::Value` to
//!   persist however it likes.
//!
//! ## Core modules
//!
//! - [`status`] — the task/workflow status lattice and transition tables.
//! - [`expressions`] — the two-dialect expression façade.
//! - [`graph`] — the composed, serializable workflow graph.
//! - [`composer`] — turns a [`spec::WorkflowSpec`] into a [`graph::WorkflowGraph`].
//! - [`spec`] — the `WorkflowSpec` trait and task/transition/retry/with-items shapes.
//! - [`state`] — the conductor's append-only execution record.
//! - [`context`] — context merge and input/output rendering.
//! - [`events`] — the single event type the conductor consumes.
//! - [`conductor`] — the event-driven state machine tying everything together.
//! - [`config`] — conductor-wide tunables (with-items concurrency, staged backlog).
//!
//! ## Example
//!
//! ```
//! use baton::conductor::Conductor;
//! use baton::events::ActionExecutionEvent;
//! use baton::spec::{NativeWorkflowSpec, TaskSpec, TransitionCondition, TransitionSpec};
//! use baton::status::Status;
//! use serde_json::json;
//!
//! let spec = NativeWorkflowSpec::builder()
//!     .task(TaskSpec {
//!         name: "greet".to_string(),
//!         action: Some("core.noop".to_string()),
//!         input: Vec::new(),
//!         with_items: None,
//!         retry: None,
//!         join: None,
//!         next: vec![TransitionSpec {
//!             next: "done".to_string(),
//!             condition: TransitionCondition::OnSuccess,
//!             expr: None,
//!             publish: Vec::new(),
//!         }],
//!     })
//!     .task(TaskSpec {
//!         name: "done".to_string(),
//!         action: None,
//!         input: Vec::new(),
//!         with_items: None,
//!         retry: None,
//!         join: None,
//!         next: Vec::new(),
//!     })
//!     .build();
//!
//! let mut conductor = Conductor::new(spec, json!({})).unwrap();
//! let staged = conductor.get_next_tasks().unwrap();
//! conductor
//!     .update_task_state(ActionExecutionEvent::new(staged[0].id.clone(), Status::Succeeded))
//!     .unwrap();
//! let staged = conductor.get_next_tasks().unwrap();
//! conductor
//!     .update_task_state(ActionExecutionEvent::new(staged[0].id.clone(), Status::Succeeded))
//!     .unwrap();
//! conductor.get_next_tasks().unwrap();
//! assert_eq!(conductor.get_workflow_status(), Status::Succeeded);
//! ```

pub mod composer;
pub mod conductor;
pub mod config;
pub mod context;
pub mod events;
pub mod expressions;
pub mod graph;
pub mod spec;
pub mod state;
pub mod status;
