//! Deterministic milestone selection and status transitions.
//!
//! Storage backends (file, memory) load a snapshot, call into this module to
//! decide and apply a transition, then persist the result. Keeping the rules
//! here means every backend enforces the same compare-and-swap semantics.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::types::{Milestone, MilestoneStatus};

/// Edges the agent itself may take. `blocked -> todo` is deliberately absent.
const VALID_TRANSITIONS: &[(MilestoneStatus, MilestoneStatus)] = &[
    (MilestoneStatus::Todo, MilestoneStatus::InProgress),
    (MilestoneStatus::InProgress, MilestoneStatus::Done),
    (MilestoneStatus::InProgress, MilestoneStatus::Blocked),
];

/// Failure of a backlog transition.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("unknown milestone '{0}'")]
    UnknownMilestone(String),
    #[error("invalid transition for '{id}': expected {expected} -> {to}, found {actual}")]
    InvalidTransition {
        id: String,
        expected: MilestoneStatus,
        actual: MilestoneStatus,
        to: MilestoneStatus,
    },
    #[error("cannot start '{id}': milestone '{active}' is already in_progress")]
    AlreadyInProgress { id: String, active: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TransitionError {
    /// True when the failure means "someone else got there first" rather than
    /// a storage or configuration problem.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TransitionError::InvalidTransition { .. } | TransitionError::AlreadyInProgress { .. }
        )
    }
}

/// What a successful transition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEffect {
    /// Status changed and must be persisted.
    Applied,
    /// Same-state replay (`from == to ==` stored status); nothing to persist.
    Unchanged,
}

pub fn is_valid_transition(from: MilestoneStatus, to: MilestoneStatus) -> bool {
    VALID_TRANSITIONS.contains(&(from, to))
}

/// First milestone with `status = todo`, in stored order.
pub fn next_actionable(milestones: &[Milestone]) -> Option<&Milestone> {
    milestones
        .iter()
        .find(|milestone| milestone.status == MilestoneStatus::Todo)
}

/// The milestone currently `in_progress`, if any.
pub fn active_milestone(milestones: &[Milestone]) -> Option<&Milestone> {
    milestones
        .iter()
        .find(|milestone| milestone.status == MilestoneStatus::InProgress)
}

/// Compare-and-swap transition on an in-memory snapshot.
///
/// Succeeds only if the stored status of `id` still equals `from`. A replay of
/// the same state (`from == to`, stored status equal) is a no-op success so an
/// interrupted run can safely retry. `reason` is stored verbatim when moving to
/// `blocked`.
pub fn apply_transition(
    milestones: &mut [Milestone],
    id: &str,
    from: MilestoneStatus,
    to: MilestoneStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TransitionEffect, TransitionError> {
    let index = milestones
        .iter()
        .position(|milestone| milestone.id == id)
        .ok_or_else(|| TransitionError::UnknownMilestone(id.to_string()))?;

    let actual = milestones[index].status;
    if actual != from {
        return Err(TransitionError::InvalidTransition {
            id: id.to_string(),
            expected: from,
            actual,
            to,
        });
    }
    if from == to {
        return Ok(TransitionEffect::Unchanged);
    }
    if !is_valid_transition(from, to) {
        return Err(TransitionError::InvalidTransition {
            id: id.to_string(),
            expected: from,
            actual,
            to,
        });
    }
    if to == MilestoneStatus::InProgress
        && let Some(active) = milestones
            .iter()
            .find(|m| m.status == MilestoneStatus::InProgress && m.id != id)
    {
        return Err(TransitionError::AlreadyInProgress {
            id: id.to_string(),
            active: active.id.clone(),
        });
    }

    let milestone = &mut milestones[index];
    milestone.status = to;
    match to {
        MilestoneStatus::InProgress => {
            milestone.started_at = Some(now);
            milestone.completed_at = None;
            milestone.reason = None;
        }
        MilestoneStatus::Done => {
            milestone.completed_at = Some(now);
        }
        MilestoneStatus::Blocked => {
            milestone.completed_at = Some(now);
            milestone.reason = reason.map(str::to_string);
        }
        MilestoneStatus::Todo => {}
    }
    Ok(TransitionEffect::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{milestone, milestone_with_status};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-19T08:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn next_actionable_returns_first_todo_in_stored_order() {
        let backlog = vec![
            milestone_with_status("a", MilestoneStatus::Done),
            milestone_with_status("b", MilestoneStatus::Blocked),
            milestone("c"),
            milestone("d"),
        ];
        assert_eq!(next_actionable(&backlog).map(|m| m.id.as_str()), Some("c"));
    }

    #[test]
    fn next_actionable_none_when_nothing_todo() {
        assert!(next_actionable(&[]).is_none());
        let backlog = vec![
            milestone_with_status("a", MilestoneStatus::InProgress),
            milestone_with_status("b", MilestoneStatus::Done),
        ];
        assert!(next_actionable(&backlog).is_none());
    }

    #[test]
    fn only_forward_edges_are_valid() {
        use MilestoneStatus::{Blocked, Done, InProgress, Todo};
        assert!(is_valid_transition(Todo, InProgress));
        assert!(is_valid_transition(InProgress, Done));
        assert!(is_valid_transition(InProgress, Blocked));
        assert!(!is_valid_transition(Blocked, Todo));
        assert!(!is_valid_transition(Todo, Done));
        assert!(!is_valid_transition(Done, InProgress));
    }

    #[test]
    fn done_transition_is_not_repeatable() {
        let mut backlog = vec![milestone_with_status("a", MilestoneStatus::InProgress)];
        let first = apply_transition(
            &mut backlog,
            "a",
            MilestoneStatus::InProgress,
            MilestoneStatus::Done,
            None,
            now(),
        );
        assert_eq!(first.expect("first"), TransitionEffect::Applied);

        let second = apply_transition(
            &mut backlog,
            "a",
            MilestoneStatus::InProgress,
            MilestoneStatus::Done,
            None,
            now(),
        );
        assert!(matches!(
            second,
            Err(TransitionError::InvalidTransition {
                actual: MilestoneStatus::Done,
                ..
            })
        ));
        assert_eq!(backlog[0].status, MilestoneStatus::Done);
        assert_eq!(backlog[0].completed_at, Some(now()));
    }

    #[test]
    fn same_state_replay_is_noop_success() {
        let mut backlog = vec![milestone_with_status("a", MilestoneStatus::InProgress)];
        let effect = apply_transition(
            &mut backlog,
            "a",
            MilestoneStatus::InProgress,
            MilestoneStatus::InProgress,
            None,
            now(),
        )
        .expect("replay");
        assert_eq!(effect, TransitionEffect::Unchanged);
        assert_eq!(backlog[0].started_at, None);
    }

    #[test]
    fn blocked_stores_reason_verbatim() {
        let mut backlog = vec![milestone_with_status("a", MilestoneStatus::InProgress)];
        apply_transition(
            &mut backlog,
            "a",
            MilestoneStatus::InProgress,
            MilestoneStatus::Blocked,
            Some("file count exceeds limit (5 > 3)"),
            now(),
        )
        .expect("block");
        assert_eq!(
            backlog[0].reason.as_deref(),
            Some("file count exceeds limit (5 > 3)")
        );
    }

    #[test]
    fn cannot_start_while_another_is_in_progress() {
        let mut backlog = vec![
            milestone_with_status("a", MilestoneStatus::InProgress),
            milestone("b"),
        ];
        let err = apply_transition(
            &mut backlog,
            "b",
            MilestoneStatus::Todo,
            MilestoneStatus::InProgress,
            None,
            now(),
        )
        .expect_err("second in_progress");
        assert!(err.is_conflict());
        assert_eq!(backlog[1].status, MilestoneStatus::Todo);
    }

    #[test]
    fn unknown_milestone_is_not_a_conflict() {
        let mut backlog = vec![milestone("a")];
        let err = apply_transition(
            &mut backlog,
            "zzz",
            MilestoneStatus::Todo,
            MilestoneStatus::InProgress,
            None,
            now(),
        )
        .expect_err("unknown");
        assert!(!err.is_conflict());
    }

    #[test]
    fn blocked_to_todo_is_rejected() {
        let mut backlog = vec![milestone_with_status("a", MilestoneStatus::Blocked)];
        let err = apply_transition(
            &mut backlog,
            "a",
            MilestoneStatus::Blocked,
            MilestoneStatus::Todo,
            None,
            now(),
        )
        .expect_err("manual-only edge");
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }
}
