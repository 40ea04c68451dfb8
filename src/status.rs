//! Canonical task/workflow status values and the transition matrix.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid task status transition: {from} -> {to}"))]
    InvalidTaskTransition { from: Status, to: Status },

    #[snafu(display("invalid workflow status transition: {from} -> {to}"))]
    InvalidWorkflowTransition { from: Status, to: Status },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single status value shared by tasks and workflows. Not every value is legal in
/// both contexts; see [`is_valid_task_status`] / [`is_valid_workflow_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Requested,
    Scheduled,
    Delayed,
    Running,
    Pausing,
    Paused,
    Resuming,
    Canceling,
    Canceled,
    Succeeded,
    Failed,
    Expired,
    Abandoned,
    Unset,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Requested => "requested",
            Status::Scheduled => "scheduled",
            Status::Delayed => "delayed",
            Status::Running => "running",
            Status::Pausing => "pausing",
            Status::Paused => "paused",
            Status::Resuming => "resuming",
            Status::Canceling => "canceling",
            Status::Canceled => "canceled",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Expired => "expired",
            Status::Abandoned => "abandoned",
            Status::Unset => "unset",
        };
        f.write_str(s)
    }
}

/// Statuses that are abended: a terminal, non-successful outcome that is not a
/// cancellation.
pub const ABENDED: &[Status] = &[Status::Failed, Status::Expired, Status::Abandoned];

/// Terminal statuses: the task/workflow will never transition again.
pub const COMPLETED: &[Status] = &[
    Status::Succeeded,
    Status::Failed,
    Status::Expired,
    Status::Abandoned,
    Status::Canceled,
];

/// Statuses considered "active" — in flight, possibly mid-transition.
pub const ACTIVE: &[Status] = &[
    Status::Running,
    Status::Pausing,
    Status::Canceling,
    Status::Resuming,
];

impl Status {
    #[must_use]
    pub fn is_abended(self) -> bool {
        ABENDED.contains(&self)
    }

    #[must_use]
    pub fn is_completed(self) -> bool {
        COMPLETED.contains(&self)
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        ACTIVE.contains(&self)
    }
}

/// All statuses valid for a task instance.
const TASK_STATUSES: &[Status] = &[
    Status::Requested,
    Status::Scheduled,
    Status::Delayed,
    Status::Running,
    Status::Pausing,
    Status::Paused,
    Status::Resuming,
    Status::Canceling,
    Status::Canceled,
    Status::Succeeded,
    Status::Failed,
    Status::Expired,
    Status::Abandoned,
];

/// All statuses valid for a workflow.
const WORKFLOW_STATUSES: &[Status] = &[
    Status::Unset,
    Status::Requested,
    Status::Running,
    Status::Pausing,
    Status::Paused,
    Status::Resuming,
    Status::Canceling,
    Status::Canceled,
    Status::Succeeded,
    Status::Failed,
];

#[must_use]
pub fn is_valid_task_status(s: Status) -> bool {
    TASK_STATUSES.contains(&s)
}

#[must_use]
pub fn is_valid_workflow_status(s: Status) -> bool {
    WORKFLOW_STATUSES.contains(&s)
}

/// Static (from, to) transition table for task instances.
const TASK_TRANSITIONS: &[(Status, &[Status])] = &[
    (Status::Requested, &[Status::Scheduled, Status::Delayed, Status::Canceled]),
    (Status::Delayed, &[Status::Scheduled, Status::Canceled]),
    (
        Status::Scheduled,
        &[Status::Running, Status::Canceling, Status::Canceled],
    ),
    (
        Status::Running,
        &[
            Status::Succeeded,
            Status::Failed,
            Status::Expired,
            Status::Abandoned,
            Status::Pausing,
            Status::Canceling,
            Status::Canceled,
        ],
    ),
    (Status::Pausing, &[Status::Paused, Status::Running, Status::Canceling]),
    (Status::Paused, &[Status::Resuming, Status::Canceling, Status::Canceled]),
    (Status::Resuming, &[Status::Running, Status::Canceling]),
    (
        Status::Canceling,
        &[Status::Canceled, Status::Succeeded, Status::Failed, Status::Expired],
    ),
];

/// Static (from, to) transition table for the workflow as a whole.
const WORKFLOW_TRANSITIONS: &[(Status, &[Status])] = &[
    (Status::Unset, &[Status::Requested, Status::Running]),
    (
        Status::Requested,
        &[Status::Running, Status::Canceling, Status::Canceled],
    ),
    (
        Status::Running,
        &[
            Status::Succeeded,
            Status::Failed,
            Status::Pausing,
            Status::Canceling,
            Status::Canceled,
        ],
    ),
    (Status::Pausing, &[Status::Paused, Status::Running, Status::Canceling]),
    (Status::Paused, &[Status::Resuming, Status::Canceling, Status::Canceled]),
    (Status::Resuming, &[Status::Running, Status::Canceling]),
    (Status::Canceling, &[Status::Canceled]),
];

fn transition_allowed(table: &[(Status, &[Status])], from: Status, to: Status) -> bool {
    if from == to {
        return true;
    }
    table
        .iter()
        .find(|(f, _)| *f == from)
        .is_some_and(|(_, tos)| tos.contains(&to))
}

#[must_use]
pub fn is_valid_task_status_transition(from: Status, to: Status) -> bool {
    transition_allowed(TASK_TRANSITIONS, from, to)
}

#[must_use]
pub fn is_valid_workflow_status_transition(from: Status, to: Status) -> bool {
    transition_allowed(WORKFLOW_TRANSITIONS, from, to)
}

/// Validate and apply a task status transition.
pub fn check_task_transition(from: Status, to: Status) -> Result<()> {
    ensure!(
        is_valid_task_status_transition(from, to),
        InvalidTaskTransitionSnafu { from, to }
    );
    Ok(())
}

/// Validate and apply a workflow status transition.
pub fn check_workflow_transition(from: Status, to: Status) -> Result<()> {
    ensure!(
        is_valid_workflow_status_transition(from, to),
        InvalidWorkflowTransitionSnafu { from, to }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_are_disjoint_from_active() {
        for s in ACTIVE {
            assert!(!s.is_completed());
        }
    }

    #[test]
    fn abended_is_subset_of_completed() {
        for s in ABENDED {
            assert!(s.is_completed());
        }
    }

    #[test]
    fn task_linear_success_path_is_valid() {
        assert!(is_valid_task_status_transition(Status::Requested, Status::Scheduled));
        assert!(is_valid_task_status_transition(Status::Scheduled, Status::Running));
        assert!(is_valid_task_status_transition(Status::Running, Status::Succeeded));
    }

    #[test]
    fn task_cannot_skip_backwards() {
        assert!(!is_valid_task_status_transition(Status::Succeeded, Status::Running));
    }

    #[test]
    fn workflow_cancel_request_on_running_goes_to_canceling() {
        assert!(is_valid_workflow_status_transition(
            Status::Running,
            Status::Canceling
        ));
    }

    #[test]
    fn workflow_canceling_only_settles_to_canceled() {
        assert!(is_valid_workflow_status_transition(
            Status::Canceling,
            Status::Canceled
        ));
        assert!(!is_valid_workflow_status_transition(
            Status::Canceling,
            Status::Succeeded
        ));
    }

    #[test]
    fn check_task_transition_rejects_invalid() {
        let err = check_task_transition(Status::Succeeded, Status::Running).unwrap_err();
        assert!(matches!(err, Error::InvalidTaskTransition { .. }));
    }
}
