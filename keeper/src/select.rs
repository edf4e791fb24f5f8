//! Backlog selection report for `keeper select`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::selector::{active_milestone, next_actionable};
use crate::core::types::Milestone;
use crate::io::backlog::load_backlog;
use crate::io::init::KeeperPaths;

/// What the next milestone-mode run would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// A milestone is already `in_progress`; claims will fail until it finishes.
    Busy(Milestone),
    /// The next `todo` milestone.
    Next(Milestone),
    /// No `todo` milestone left.
    Empty,
}

pub fn select_milestone(milestones: &[Milestone]) -> SelectOutcome {
    if let Some(active) = active_milestone(milestones) {
        return SelectOutcome::Busy(active.clone());
    }
    match next_actionable(milestones) {
        Some(next) => SelectOutcome::Next(next.clone()),
        None => SelectOutcome::Empty,
    }
}

/// Load the backlog under `root` and select.
pub fn select_from_root(root: &Path) -> Result<SelectOutcome> {
    let paths = KeeperPaths::new(root);
    let milestones =
        load_backlog(&paths.backlog_path).context("load backlog for selection")?;
    Ok(select_milestone(&milestones))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MilestoneStatus;
    use crate::test_support::{milestone, milestone_with_status};

    #[test]
    fn selects_first_todo_in_stored_order() {
        let backlog = vec![
            milestone_with_status("done", MilestoneStatus::Done),
            milestone_with_status("stuck", MilestoneStatus::Blocked),
            milestone("second"),
            milestone("third"),
        ];
        assert_eq!(
            select_milestone(&backlog),
            SelectOutcome::Next(milestone("second"))
        );
    }

    #[test]
    fn in_progress_milestone_makes_backlog_busy() {
        let backlog = vec![
            milestone("first"),
            milestone_with_status("active", MilestoneStatus::InProgress),
        ];
        let SelectOutcome::Busy(active) = select_milestone(&backlog) else {
            panic!("expected busy");
        };
        assert_eq!(active.id, "active");
    }

    #[test]
    fn empty_when_nothing_todo() {
        let backlog = vec![milestone_with_status("done", MilestoneStatus::Done)];
        assert_eq!(select_milestone(&backlog), SelectOutcome::Empty);
        assert_eq!(select_milestone(&[]), SelectOutcome::Empty);
    }
}
