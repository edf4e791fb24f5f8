//! Semantic backlog invariants not expressible in the TOML shape.

use std::collections::HashSet;

use crate::core::types::{Milestone, MilestoneStatus};

/// Check backlog invariants:
/// - ids are non-empty and unique
/// - titles are non-empty
/// - `acceptance_commands` is non-empty and has no blank entries
/// - at most one milestone is `in_progress`
///
/// Returns stable error messages in backlog order (empty on success).
pub fn validate_backlog(milestones: &[Milestone]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut in_progress = Vec::new();

    for (index, milestone) in milestones.iter().enumerate() {
        let label = if milestone.id.trim().is_empty() {
            format!("milestones[{index}]")
        } else {
            milestone.id.clone()
        };

        if milestone.id.trim().is_empty() {
            errors.push(format!("{label}: id must be non-empty"));
        } else if !seen.insert(milestone.id.as_str()) {
            errors.push(format!("duplicate id '{}'", milestone.id));
        }

        if milestone.title.trim().is_empty() {
            errors.push(format!("{label}: title must be non-empty"));
        }

        if milestone.acceptance_commands.is_empty() {
            errors.push(format!("{label}: acceptance_commands must be non-empty"));
        } else if milestone
            .acceptance_commands
            .iter()
            .any(|cmd| cmd.trim().is_empty())
        {
            errors.push(format!("{label}: acceptance_commands contains a blank entry"));
        }

        if milestone.status == MilestoneStatus::InProgress {
            in_progress.push(label);
        }
    }

    if in_progress.len() > 1 {
        errors.push(format!(
            "at most one milestone may be in_progress (found: {})",
            in_progress.join(", ")
        ));
    }

    errors
}
