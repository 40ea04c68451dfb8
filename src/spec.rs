//! The `WorkflowSpec` seam the composer and conductor depend on, plus a minimal
//! in-memory builder implementation good enough to construct specs programmatically.
//!
//! Spec *parsing* (YAML/JSON front ends for either source dialect) is out of scope —
//! [`NativeWorkflowSpec`] is a minimal concrete implementation of the trait, not a
//! parser, meant for tests and for embedding applications that already have a parsed
//! structure.

use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::status::Status;

/// Which predecessor statuses gate a transition. The foreign (Mistral) dialect fixes
/// this mapping; the native dialect reuses the same three named conditions plus
/// `Always` for a plain `next:` entry with no explicit condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionCondition {
    OnSuccess,
    OnError,
    OnComplete,
    Always,
}

impl TransitionCondition {
    #[must_use]
    pub fn statuses(self) -> &'static [Status] {
        match self {
            TransitionCondition::OnSuccess => &[Status::Succeeded],
            TransitionCondition::OnError => crate::status::ABENDED,
            TransitionCondition::OnComplete | TransitionCondition::Always => {
                crate::status::COMPLETED
            }
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            TransitionCondition::OnSuccess => "on-success",
            TransitionCondition::OnError => "on-error",
            TransitionCondition::OnComplete => "on-complete",
            TransitionCondition::Always => "always",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinSpec {
    All,
    Count(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithItemsSpec {
    /// Expression (either dialect) evaluating to the finite sequence to iterate.
    pub items: String,
    pub concurrency: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    pub count: u32,
    pub when: Option<String>,
    pub delay: Option<f64>,
}

/// An outbound transition from one task to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub next: String,
    pub condition: TransitionCondition,
    /// Author-supplied expression appended to the generated `task_status(..) in [..]`
    /// criterion.
    pub expr: Option<String>,
    /// `(var_name, expression)` pairs published into the successor's context when
    /// this transition fires.
    pub publish: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub action: Option<String>,
    /// Input parameter name -> expression (either dialect) rendered against the
    /// task's context when the task is staged.
    pub input: Vec<(String, String)>,
    pub with_items: Option<WithItemsSpec>,
    pub retry: Option<RetrySpec>,
    pub join: Option<JoinSpec>,
    pub next: Vec<TransitionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecValidationIssue {
    pub task: Option<String>,
    pub message: String,
}

/// Capability surface the composer (`composer.rs`) and conductor (`conductor.rs`)
/// depend on. Spec parsing itself — producing a value of a type implementing this
/// trait from workflow source text — is an external collaborator.
pub trait WorkflowSpec {
    fn get_start_tasks(&self) -> Vec<(String, Option<String>, TransitionCondition)>;
    fn get_next_tasks(&self, name: &str) -> Vec<(String, Option<String>, TransitionCondition)>;
    fn is_join_task(&self, name: &str) -> bool;
    fn is_split_task(&self, name: &str) -> bool;
    fn in_cycle(&self, name: &str) -> bool;
    fn get_task(&self, name: &str) -> Option<&TaskSpec>;
    /// Declared workflow variables (`vars:`), seeded into the initial context.
    fn vars(&self) -> &[(String, serde_json::Value)];
    /// `(output_name, expression)` pairs rendered against the final context on
    /// workflow completion.
    fn outputs(&self) -> &[(String, String)];
    /// Structural validation; empty when the spec is composable.
    fn inspect(&self) -> Vec<SpecValidationIssue>;
}

/// An in-memory, builder-constructed `WorkflowSpec`. Cycle/split membership is
/// precomputed once at `build()` time by walking the raw `next` adjacency, so the
/// composer can read `in_cycle`/`is_split_task` off each task rather than
/// recomputing graph topology itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NativeWorkflowSpec {
    tasks: HashMap<String, TaskSpec>,
    order: Vec<String>,
    vars: Vec<(String, serde_json::Value)>,
    outputs: Vec<(String, String)>,
    #[serde(skip)]
    cyclic: std::collections::HashSet<String>,
    #[serde(skip)]
    splits: std::collections::HashSet<String>,
}

impl NativeWorkflowSpec {
    #[must_use]
    pub fn builder() -> NativeWorkflowSpecBuilder {
        NativeWorkflowSpecBuilder::default()
    }

    fn recompute_topology(&mut self) {
        let mut g = DiGraph::<String, ()>::new();
        let mut idx = HashMap::new();
        for name in &self.order {
            idx.insert(name.clone(), g.add_node(name.clone()));
        }
        for name in &self.order {
            let Some(task) = self.tasks.get(name) else {
                continue;
            };
            for t in &task.next {
                if let (Some(&src), Some(&dst)) = (idx.get(name), idx.get(&t.next)) {
                    g.add_edge(src, dst, ());
                }
            }
        }

        self.cyclic.clear();
        for scc in petgraph::algo::tarjan_scc(&g) {
            if scc.len() > 1 {
                for n in scc {
                    self.cyclic.insert(g[n].clone());
                }
            }
        }
        for e in g.edge_indices() {
            let Some((s, t)) = g.edge_endpoints(e) else {
                continue;
            };
            if s == t {
                self.cyclic.insert(g[s].clone());
            }
        }

        self.splits.clear();
        let mut predecessor_counts: HashMap<String, std::collections::HashSet<String>> =
            HashMap::new();
        for name in &self.order {
            let Some(task) = self.tasks.get(name) else {
                continue;
            };
            for t in &task.next {
                predecessor_counts
                    .entry(t.next.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }
        for (task, preds) in &predecessor_counts {
            if self.cyclic.contains(task) {
                continue;
            }
            let non_cyclic_preds = preds.iter().filter(|p| !self.cyclic.contains(*p)).count();
            if non_cyclic_preds > 1 {
                self.splits.insert(task.clone());
            }
        }
    }
}

impl WorkflowSpec for NativeWorkflowSpec {
    fn get_start_tasks(&self) -> Vec<(String, Option<String>, TransitionCondition)> {
        let targeted: std::collections::HashSet<&str> = self
            .tasks
            .values()
            .flat_map(|t| t.next.iter().map(|n| n.next.as_str()))
            .collect();
        self.order
            .iter()
            .filter(|n| !targeted.contains(n.as_str()))
            .map(|n| (n.clone(), None, TransitionCondition::Always))
            .collect()
    }

    fn get_next_tasks(&self, name: &str) -> Vec<(String, Option<String>, TransitionCondition)> {
        self.tasks
            .get(name)
            .map(|t| {
                t.next
                    .iter()
                    .map(|n| (n.next.clone(), n.expr.clone(), n.condition))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_join_task(&self, name: &str) -> bool {
        self.tasks.get(name).is_some_and(|t| t.join.is_some())
    }

    fn is_split_task(&self, name: &str) -> bool {
        self.splits.contains(name)
    }

    fn in_cycle(&self, name: &str) -> bool {
        self.cyclic.contains(name)
    }

    fn get_task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    fn vars(&self) -> &[(String, serde_json::Value)] {
        &self.vars
    }

    fn outputs(&self) -> &[(String, String)] {
        &self.outputs
    }

    fn inspect(&self) -> Vec<SpecValidationIssue> {
        let mut issues = Vec::new();
        for name in &self.order {
            let task = &self.tasks[name];
            for t in &task.next {
                if !self.tasks.contains_key(&t.next) {
                    issues.push(SpecValidationIssue {
                        task: Some(name.clone()),
                        message: format!("transition to undeclared task `{}`", t.next),
                    });
                }
            }
            if let Some(JoinSpec::Count(n)) = &task.join {
                if *n == 0 {
                    issues.push(SpecValidationIssue {
                        task: Some(name.clone()),
                        message: "join count must be >= 1".to_string(),
                    });
                }
            }
            if let Some(w) = &task.with_items {
                if w.concurrency == Some(0) {
                    issues.push(SpecValidationIssue {
                        task: Some(name.clone()),
                        message: "with-items concurrency must be >= 1".to_string(),
                    });
                }
            }
        }
        issues
    }
}

#[derive(Debug, Default)]
pub struct NativeWorkflowSpecBuilder {
    spec: NativeWorkflowSpec,
}

impl NativeWorkflowSpecBuilder {
    #[must_use]
    pub fn task(mut self, task: TaskSpec) -> Self {
        if !self.spec.tasks.contains_key(&task.name) {
            self.spec.order.push(task.name.clone());
        }
        self.spec.tasks.insert(task.name.clone(), task);
        self
    }

    #[must_use]
    pub fn var(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.spec.vars.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn output(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.spec.outputs.push((name.into(), expr.into()));
        self
    }

    #[must_use]
    pub fn build(mut self) -> NativeWorkflowSpec {
        self.spec.recompute_topology();
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, next: Vec<TransitionSpec>) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            action: None,
            input: Vec::new(),
            with_items: None,
            retry: None,
            join: None,
            next,
        }
    }

    fn on_success(next: &str) -> TransitionSpec {
        TransitionSpec {
            next: next.to_string(),
            condition: TransitionCondition::OnSuccess,
            expr: None,
            publish: Vec::new(),
        }
    }

    #[test]
    fn linear_chain_has_single_start_task() {
        let spec = NativeWorkflowSpec::builder()
            .task(task("t1", vec![on_success("t2")]))
            .task(task("t2", vec![on_success("t3")]))
            .task(task("t3", vec![]))
            .build();

        assert_eq!(spec.get_start_tasks().len(), 1);
        assert_eq!(spec.get_start_tasks()[0].0, "t1");
    }

    #[test]
    fn split_task_detected_from_multiple_predecessors() {
        let spec = NativeWorkflowSpec::builder()
            .task(task("s", vec![on_success("a"), on_success("b")]))
            .task(task("a", vec![on_success("c")]))
            .task(task("b", vec![on_success("c")]))
            .task(task("c", vec![]))
            .build();

        assert!(spec.is_split_task("c"));
        assert!(!spec.is_split_task("a"));
    }

    #[test]
    fn self_loop_is_in_cycle() {
        let spec = NativeWorkflowSpec::builder()
            .task(task("loop", vec![on_success("loop")]))
            .build();
        assert!(spec.in_cycle("loop"));
    }

    #[test]
    fn inspect_flags_transition_to_undeclared_task() {
        let spec = NativeWorkflowSpec::builder()
            .task(task("t1", vec![on_success("missing")]))
            .build();
        assert!(!spec.inspect().is_empty());
    }

    #[test]
    fn inspect_is_empty_for_a_valid_spec() {
        let spec = NativeWorkflowSpec::builder()
            .task(task("t1", vec![on_success("t2")]))
            .task(task("t2", vec![]))
            .build();
        assert!(spec.inspect().is_empty());
    }
}
