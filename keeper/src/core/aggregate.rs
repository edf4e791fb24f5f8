//! Daily aggregation of run records into a health summary.
//!
//! A pure fold: the same records, milestone snapshot and verification result
//! always produce the same summary and byte-identical markdown.

use chrono::NaiveDate;
use minijinja::Environment;
use serde::Serialize;

use crate::core::types::{
    Milestone, MilestoneStatus, RunOutcome, RunRecord, VerificationResult,
};

const SUMMARY_TEMPLATE: &str = "\
## {{ title }}

**Health:** {{ health | upper }}
{% if failing_checks %}
Failing on the default branch:
{% for command in failing_checks %}- `{{ command }}`
{% endfor %}{% endif %}
### Runs

- total: {{ run_count }}
- pr_created: {{ outcomes.pr_created }}
- blocked: {{ outcomes.blocked }}
- no_op: {{ outcomes.no_op }}
- error: {{ outcomes.error }}

### Pull requests

{% for pr in pr_links %}- {{ pr.url }}{% if pr.milestone_id %} (`{{ pr.milestone_id }}`){% endif %}
{% else %}- none
{% endfor %}
### Milestones

- todo: {{ milestones.todo }}
- in_progress: {{ milestones.in_progress }}
- done: {{ milestones.done }}
- blocked: {{ milestones.blocked }}

### Blocked

{% for item in blocked %}- `{{ item.milestone_id }}`: {{ item.reason }}
{% endfor %}{% for run in failed_runs %}- run `{{ run.run_id }}` ({{ run.outcome }}): {{ run.reason }}
{% endfor %}{% if not blocked and not failed_runs %}- none
{% endif %}";

/// Default-branch health from the latest truth-check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Green,
    Red,
    /// No default-branch verification has ever been recorded.
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub pr_created: usize,
    pub blocked: usize,
    pub no_op: usize,
    pub error: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub todo: usize,
    pub in_progress: usize,
    pub done: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrLink {
    pub run_id: String,
    pub milestone_id: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedItem {
    pub milestone_id: String,
    pub reason: String,
}

/// A `blocked` or `error` run with no milestone to carry its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRun {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub reason: String,
}

/// One day's roll-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub title: String,
    pub run_count: usize,
    pub outcomes: OutcomeCounts,
    pub pr_links: Vec<PrLink>,
    pub milestones: StatusCounts,
    pub blocked: Vec<BlockedItem>,
    pub failed_runs: Vec<FailedRun>,
    pub health: Health,
    /// Commands failing in the latest default-branch verification.
    pub failing_checks: Vec<String>,
}

/// Issue title used to upsert the summary.
pub fn summary_title(date: NaiveDate) -> String {
    format!("Keeper Daily Summary ({})", date.format("%Y-%m-%d"))
}

/// Fold the day's records into a [`DailySummary`].
///
/// Records are ordered by `(started_at, run_id)` first so the result does not
/// depend on log line order.
pub fn aggregate(
    date: NaiveDate,
    records: &[RunRecord],
    milestones: &[Milestone],
    latest_default: Option<&VerificationResult>,
) -> DailySummary {
    let mut ordered: Vec<&RunRecord> = records.iter().collect();
    ordered.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });

    let mut outcomes = OutcomeCounts::default();
    let mut pr_links = Vec::new();
    let mut failed_runs = Vec::new();
    for record in &ordered {
        match record.outcome {
            RunOutcome::PrCreated => outcomes.pr_created += 1,
            RunOutcome::Blocked => outcomes.blocked += 1,
            RunOutcome::NoOp => outcomes.no_op += 1,
            RunOutcome::Error => outcomes.error += 1,
        }
        if record.outcome == RunOutcome::PrCreated
            && let Some(url) = &record.pr_url
        {
            pr_links.push(PrLink {
                run_id: record.run_id.clone(),
                milestone_id: record.milestone_id.clone(),
                url: url.clone(),
            });
        }
        if matches!(record.outcome, RunOutcome::Blocked | RunOutcome::Error)
            && record.milestone_id.is_none()
        {
            failed_runs.push(FailedRun {
                run_id: record.run_id.clone(),
                outcome: record.outcome,
                reason: record
                    .reason
                    .clone()
                    .unwrap_or_else(|| "no reason recorded".to_string()),
            });
        }
    }

    let mut counts = StatusCounts::default();
    let mut blocked = Vec::new();
    for milestone in milestones {
        match milestone.status {
            MilestoneStatus::Todo => counts.todo += 1,
            MilestoneStatus::InProgress => counts.in_progress += 1,
            MilestoneStatus::Done => counts.done += 1,
            MilestoneStatus::Blocked => {
                counts.blocked += 1;
                blocked.push(BlockedItem {
                    milestone_id: milestone.id.clone(),
                    reason: milestone
                        .reason
                        .clone()
                        .unwrap_or_else(|| "no reason recorded".to_string()),
                });
            }
        }
    }

    let (health, failing_checks) = match latest_default {
        Some(result) if result.all_passed => (Health::Green, Vec::new()),
        Some(result) => (
            Health::Red,
            result.failed().map(|entry| entry.command.clone()).collect(),
        ),
        None => (Health::Unknown, Vec::new()),
    };

    DailySummary {
        date,
        title: summary_title(date),
        run_count: ordered.len(),
        outcomes,
        pr_links,
        milestones: counts,
        blocked,
        failed_runs,
        health,
        failing_checks,
    }
}

/// Render the summary as markdown.
pub fn render_markdown(summary: &DailySummary) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("daily_summary", SUMMARY_TEMPLATE)?;
    let mut rendered = env.get_template("daily_summary")?.render(summary)?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}
