//! Shared deterministic types for keeper core logic.
//!
//! These types define stable contracts between core components and the
//! persisted artifacts (backlog, run log, summaries). They must not depend on
//! external state or I/O.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Backlog item category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneKind {
    Fix,
    Feature,
}

/// Lifecycle status of a milestone.
///
/// Valid edges are `todo -> in_progress -> {done, blocked}`. `blocked -> todo`
/// only happens through a manual edit of the backlog file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Todo,
    InProgress,
    Done,
    Blocked,
}

impl MilestoneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MilestoneStatus::Todo => "todo",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Done => "done",
            MilestoneStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backlog record (`[[milestones]]` in `.keeper/milestones.toml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub title: String,
    pub kind: MilestoneKind,
    pub status: MilestoneStatus,
    /// Free-form description handed to the planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Globs naming the files this milestone is expected to touch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_file_patterns: Vec<String>,
    pub acceptance_commands: Vec<String>,
    #[serde(default)]
    pub stop_after_completion: bool,
    pub created_at: NaiveDate,
    /// Last block reason, written by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Operating mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Repair failing truth checks on the default branch.
    Fix,
    /// Advance the next actionable milestone.
    Milestone,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Fix => "fix",
            RunMode::Milestone => "milestone",
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    PrCreated,
    Blocked,
    NoOp,
    Error,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::PrCreated => "pr_created",
            RunOutcome::Blocked => "blocked",
            RunOutcome::NoOp => "no_op",
            RunOutcome::Error => "error",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report for a single acceptance command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReport {
    pub command: String,
    /// Process exit code; `None` when the command timed out, was killed by a
    /// signal, or could not be spawned.
    pub exit_status: Option<i32>,
    pub passed: bool,
    #[serde(default)]
    pub timed_out: bool,
    /// True when `captured_output` was cut at the configured limit.
    #[serde(default)]
    pub truncated: bool,
    pub captured_output: String,
}

/// Ordered acceptance report. `all_passed` is the AND of every entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub entries: Vec<CommandReport>,
    pub all_passed: bool,
}

impl VerificationResult {
    pub fn from_entries(entries: Vec<CommandReport>) -> Self {
        let all_passed = entries.iter().all(|entry| entry.passed);
        Self {
            entries,
            all_passed,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &CommandReport> {
        self.entries.iter().filter(|entry| !entry.passed)
    }

    /// Render the report as markdown for PR bodies and block reasons.
    pub fn render_markdown(&self) -> String {
        let mut buf = String::new();
        for entry in &self.entries {
            let mark = if entry.passed { "PASS" } else { "FAIL" };
            let status = match (entry.timed_out, entry.exit_status) {
                (true, _) => "timed out".to_string(),
                (false, Some(code)) => format!("exit {code}"),
                (false, None) => "no exit status".to_string(),
            };
            buf.push_str(&format!("- `{}`: {mark} ({status})\n", entry.command));
            if !entry.passed && !entry.captured_output.trim().is_empty() {
                buf.push_str("\n```text\n");
                buf.push_str(entry.captured_output.trim_end());
                buf.push_str("\n```\n\n");
            }
        }
        buf
    }
}

/// Append-only record of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub date: NaiveDate,
    /// Absent when the run ended before a mode was chosen.
    pub mode: Option<RunMode>,
    pub milestone_id: Option<String>,
    pub outcome: RunOutcome,
    pub pr_url: Option<String>,
    pub branch: Option<String>,
    /// Human-readable reason; always present for `blocked` and `error`.
    pub reason: Option<String>,
    pub verification_result: Option<VerificationResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
