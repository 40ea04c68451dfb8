//! Turns a [`WorkflowSpec`] into an executable [`WorkflowGraph`].
//!
//! A breadth-first walk starting from every task with no predecessors, carrying a
//! `splits` breadcrumb trail along each path and re-deriving transition criteria at
//! every edge.

use std::collections::VecDeque;

use snafu::prelude::*;

use crate::graph::{Barrier, WorkflowGraph};
use crate::spec::{JoinSpec, SpecValidationIssue, TransitionCondition, WorkflowSpec};
use crate::status::Status;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("workflow spec failed validation: {issues:?}"))]
    InvalidSpec { issues: Vec<SpecValidationIssue> },
}

pub type Result<T> = std::result::Result<T, Error>;

fn status_list_literal(statuses: &[Status]) -> String {
    let items: Vec<String> = statuses.iter().map(|s| format!("'{s}'")).collect();
    format!("[{}]", items.join(", "))
}

/// `task_status(name) in [...]`, wrapped in native-dialect markers, plus the
/// author-supplied expression (already carrying its own dialect markers) if present.
fn compose_transition_criteria(
    task_name: &str,
    condition: TransitionCondition,
    expr: Option<&str>,
) -> Vec<String> {
    let predicate = format!(
        "task_status({}) in {}",
        task_name,
        status_list_literal(condition.statuses())
    );
    let mut criteria = vec![format!("<% {predicate} %>")];
    if let Some(e) = expr {
        criteria.push(e.to_string());
    }
    criteria
}

/// Compose a [`WorkflowGraph`] from `spec`. Fails only if `spec` itself does not
/// validate (`WorkflowSpec::inspect`); the composition walk itself cannot fail —
/// every task reachable from a start task is visited at least once.
pub fn compose<S: WorkflowSpec>(spec: &S) -> Result<WorkflowGraph> {
    let issues = spec.inspect();
    ensure!(issues.is_empty(), InvalidSpecSnafu { issues });

    let mut graph = WorkflowGraph::new();
    let mut queue: VecDeque<(String, Vec<String>)> = VecDeque::new();

    for (task_name, _expr, _condition) in spec.get_start_tasks() {
        queue.push_back((task_name, Vec::new()));
    }

    while let Some((task_name, mut splits)) = queue.pop_front() {
        graph.add_task(&task_name);

        if spec.is_join_task(&task_name) {
            if let Some(task_spec) = spec.get_task(&task_name) {
                if let Some(join) = &task_spec.join {
                    let barrier = match join {
                        JoinSpec::All => Barrier::All,
                        JoinSpec::Count(n) => Barrier::Count(*n),
                    };
                    graph.set_barrier(&task_name, barrier);
                }
            }
        }

        if spec.is_split_task(&task_name) && !spec.in_cycle(&task_name) {
            splits.push(task_name.clone());
        }

        if !splits.is_empty() {
            graph.set_splits(&task_name, splits.clone());
        }
        graph.set_in_cycle(&task_name, spec.in_cycle(&task_name));

        for (next_name, expr, condition) in spec.get_next_tasks(&task_name) {
            if !graph.has_task(&next_name) || !spec.in_cycle(&next_name) {
                queue.push_back((next_name.clone(), splits.clone()));
            }

            let criteria = compose_transition_criteria(&task_name, condition, expr.as_deref());
            graph.add_transition(&task_name, &next_name, criteria);
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{NativeWorkflowSpec, TaskSpec, TransitionSpec};

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

    fn transition(next: &str, condition: TransitionCondition) -> TransitionSpec {
        TransitionSpec {
            next: next.to_string(),
            condition,
            expr: None,
            publish: Vec::new(),
        }
    }

    #[test]
    fn linear_chain_composes_two_edges() {
        let spec = NativeWorkflowSpec::builder()
            .task(task(
                "t1",
                vec![transition("t2", TransitionCondition::OnSuccess)],
            ))
            .task(task(
                "t2",
                vec![transition("t3", TransitionCondition::OnSuccess)],
            ))
            .task(task("t3", vec![]))
            .build();

        let graph = compose(&spec).unwrap();
        assert_eq!(graph.start_tasks(), vec!["t1"]);
        assert_eq!(graph.successors("t1").len(), 1);
        assert_eq!(graph.successors("t2").len(), 1);
        assert!(graph.successors("t3").is_empty());
    }

    #[test]
    fn diamond_join_gets_all_barrier() {
        let mut join_task = task(
            "join",
            vec![transition("end", TransitionCondition::OnComplete)],
        );
        join_task.join = Some(JoinSpec::All);

        let spec = NativeWorkflowSpec::builder()
            .task(task(
                "start",
                vec![
                    transition("a", TransitionCondition::OnSuccess),
                    transition("b", TransitionCondition::OnSuccess),
                ],
            ))
            .task(task(
                "a",
                vec![transition("join", TransitionCondition::OnSuccess)],
            ))
            .task(task(
                "b",
                vec![transition("join", TransitionCondition::OnSuccess)],
            ))
            .task(join_task)
            .task(task("end", vec![]))
            .build();

        let graph = compose(&spec).unwrap();
        assert_eq!(graph.node("join").unwrap().barrier, Barrier::All);
        assert_eq!(graph.node("join").unwrap().splits, vec!["start".to_string()]);
    }

    #[test]
    fn criteria_encode_task_status_predicate() {
        let spec = NativeWorkflowSpec::builder()
            .task(task(
                "t1",
                vec![transition("t2", TransitionCondition::OnSuccess)],
            ))
            .task(task("t2", vec![]))
            .build();

        let graph = compose(&spec).unwrap();
        let (_, criteria) = graph.successors("t1")[0];
        assert!(criteria[0].contains("task_status(t1)"));
        assert!(criteria[0].contains("'succeeded'"));
    }

    #[test]
    fn invalid_spec_is_rejected_before_composition() {
        let spec = NativeWorkflowSpec::builder()
            .task(task(
                "t1",
                vec![transition("missing", TransitionCondition::OnSuccess)],
            ))
            .build();
        assert!(compose(&spec).is_err());
    }

    #[test]
    fn self_loop_does_not_requeue_forever() {
        let spec = NativeWorkflowSpec::builder()
            .task(task(
                "loop",
                vec![
                    transition("loop", TransitionCondition::OnError),
                    transition("done", TransitionCondition::OnSuccess),
                ],
            ))
            .task(task("done", vec![]))
            .build();

        let graph = compose(&spec).unwrap();
        assert!(graph.node("loop").unwrap().in_cycle);
        assert_eq!(graph.successors("loop").len(), 2);
    }
}
