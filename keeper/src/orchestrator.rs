//! One `keeper run`: mode selection → planning → applying → verifying →
//! publishing → finalizing.
//!
//! Every failure after the run starts converges on finalizing with a
//! `blocked` or `error` outcome and a reason; the record is appended to the
//! day's run log, uncommitted patch changes are dropped and the working copy
//! is returned to the default branch. The day's summary issue is then refreshed.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::branch::{base_branch_name, unique_branch_name};
use crate::core::policy::PolicyContext;
use crate::core::types::{
    Milestone, MilestoneStatus, RunMode, RunOutcome, RunRecord, VerificationResult,
};
use crate::io::backlog::MilestoneStore;
use crate::io::config::KeeperConfig;
use crate::io::context::gather_target_files;
use crate::io::forge::{Forge, PullRequest};
use crate::io::git::Git;
use crate::io::init::KeeperPaths;
use crate::io::planner::{PatchPlan, PlanRequest, PlanResponse, Planner};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::run_log::{append_record, is_halted, save_default_verification, set_halt};
use crate::io::verify::Verifier;
use crate::io::worktree::{AppliedChangeSet, apply_patch};
use crate::summary::{build_summary, publish_summary};

/// Working-tree paths a run may find dirty without refusing to start.
const KEEPER_DIR_PREFIX: &str = ".keeper/";

/// Mode requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    /// Fix when truth checks fail, otherwise advance the backlog.
    Auto,
    Fix,
    Milestone,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: ModeRequest,
    /// Lift the file and line limits of the safety policy.
    pub escalate: bool,
    pub ignore_halt: bool,
    pub date: NaiveDate,
}

/// External services a run talks to.
pub struct Collaborators<'a> {
    pub planner: &'a dyn Planner,
    pub forge: &'a dyn Forge,
    pub verifier: &'a dyn Verifier,
    pub backlog: &'a dyn MilestoneStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// The halt flag for the day is set; nothing ran and nothing was logged.
    Halted { date: NaiveDate },
    Finished(RunRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SelectingMode,
    Planning,
    Applying,
    Verifying,
    Publishing,
    Finalizing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::SelectingMode => "selecting_mode",
            Stage::Planning => "planning",
            Stage::Applying => "applying",
            Stage::Verifying => "verifying",
            Stage::Publishing => "publishing",
            Stage::Finalizing => "finalizing",
        }
    }
}

/// Terminal state reached before finalizing.
#[derive(Debug, Clone)]
struct Finish {
    outcome: RunOutcome,
    reason: Option<String>,
    pr_url: Option<String>,
    verification: Option<VerificationResult>,
}

impl Finish {
    fn no_op(reason: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::NoOp,
            reason: Some(reason.into()),
            pr_url: None,
            verification: None,
        }
    }

    fn blocked(reason: impl Into<String>, verification: Option<VerificationResult>) -> Self {
        Self {
            outcome: RunOutcome::Blocked,
            reason: Some(reason.into()),
            pr_url: None,
            verification,
        }
    }

    fn error(reason: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::Error,
            reason: Some(reason.into()),
            pr_url: None,
            verification: None,
        }
    }
}

struct Run<'a> {
    root: &'a Path,
    paths: KeeperPaths,
    cfg: &'a KeeperConfig,
    git: Git,
    deps: &'a Collaborators<'a>,
    options: &'a RunOptions,
    run_id: String,
    stage: Stage,
    mode: Option<RunMode>,
    /// Milestone claimed by this run (moved to `in_progress`).
    milestone: Option<Milestone>,
    /// Run branch while it exists.
    branch: Option<String>,
    /// Files written to the run branch by the applier.
    applied_paths: Vec<String>,
}

/// Execute one logical run against the repository at `root`.
#[instrument(skip_all, fields(root = %root.display(), mode = ?options.mode, date = %options.date))]
pub fn run_once(
    root: &Path,
    cfg: &KeeperConfig,
    deps: &Collaborators<'_>,
    options: &RunOptions,
) -> Result<RunResult> {
    let paths = KeeperPaths::new(root);
    if !options.ignore_halt && is_halted(&paths, options.date) {
        info!(date = %options.date, "runs halted for today");
        return Ok(RunResult::Halted { date: options.date });
    }

    let started_at = Utc::now();
    let mut run = Run {
        root,
        paths,
        cfg,
        git: Git::new(root, cfg.git_timeout()),
        deps,
        options,
        run_id: new_run_id(started_at),
        stage: Stage::SelectingMode,
        mode: None,
        milestone: None,
        branch: None,
        applied_paths: Vec::new(),
    };
    info!(run_id = %run.run_id, "run started");

    let finish = match run.drive() {
        Ok(finish) => finish,
        Err(err) => {
            warn!(stage = run.stage.as_str(), err = %format!("{err:#}"), "run failed");
            Finish::error(format!("{}: {err:#}", run.stage.as_str()))
        }
    };
    let record = run.finalize(finish, started_at)?;
    refresh_summary(root, options.date, deps.forge);
    Ok(RunResult::Finished(record))
}

/// Recompute the day's summary and upsert its issue. Failures only warn; the
/// run outcome is already recorded.
fn refresh_summary(root: &Path, date: NaiveDate, forge: &dyn Forge) {
    let published = build_summary(root, date).and_then(|rendered| publish_summary(forge, &rendered));
    if let Err(err) = published {
        warn!(err = %format!("{err:#}"), "failed to refresh daily summary");
    }
}

/// Run the configured truth checks on the current checkout and record the
/// result as the latest default-branch verification.
pub fn check_truth(root: &Path, cfg: &KeeperConfig, verifier: &dyn Verifier) -> Result<VerificationResult> {
    let result = verifier.verify(&cfg.truth_check_commands(), root);
    save_default_verification(&KeeperPaths::new(root), &result)?;
    Ok(result)
}

impl Run<'_> {
    fn enter(&mut self, stage: Stage) {
        debug!(stage = stage.as_str(), "entering stage");
        self.stage = stage;
    }

    fn drive(&mut self) -> Result<Finish> {
        self.enter(Stage::SelectingMode);
        self.git.ensure_clean_except_prefixes(&[KEEPER_DIR_PREFIX])?;
        self.git.checkout_branch(&self.cfg.default_branch)?;
        if self.cfg.sync_default_branch {
            self.git
                .pull_ff_only(&self.cfg.remote, &self.cfg.default_branch)?;
        }
        let head_sha = self.git.head_sha()?;

        let failure = match self.options.mode {
            ModeRequest::Milestone => None,
            ModeRequest::Auto | ModeRequest::Fix => {
                let result = check_truth(self.root, self.cfg, self.deps.verifier)?;
                (!result.all_passed).then_some(result)
            }
        };

        let mode = match (self.options.mode, failure.is_some()) {
            (ModeRequest::Fix | ModeRequest::Auto, true) => RunMode::Fix,
            (ModeRequest::Fix, false) => {
                return Ok(Finish::no_op(format!(
                    "truth checks pass on {}",
                    self.cfg.default_branch
                )));
            }
            (ModeRequest::Auto | ModeRequest::Milestone, _) => RunMode::Milestone,
        };
        self.mode = Some(mode);
        info!(mode = mode.as_str(), "mode selected");

        match mode {
            RunMode::Fix => {
                let base = self.base_branch();
                if let Some(url) = self.deps.forge.find_pull_request(&base)? {
                    return Ok(Finish::no_op(format!(
                        "pull request for {base} already exists: {url}"
                    )));
                }
            }
            RunMode::Milestone => {
                let Some(candidate) = self.deps.backlog.next_actionable()? else {
                    return Ok(Finish::no_op("no actionable milestone"));
                };
                match self.deps.backlog.transition(
                    &candidate.id,
                    MilestoneStatus::Todo,
                    MilestoneStatus::InProgress,
                    None,
                ) {
                    Ok(_) => {
                        info!(milestone = %candidate.id, "milestone claimed");
                        self.milestone = Some(candidate);
                    }
                    Err(err) if err.is_conflict() => {
                        return Ok(Finish::no_op(format!(
                            "lost claim on milestone '{}': {err}",
                            candidate.id
                        )));
                    }
                    Err(err) => return Err(anyhow!(err)),
                }
            }
        }

        self.enter(Stage::Planning);
        let prompt = self.build_prompt(&head_sha, failure.as_ref())?;
        let request = PlanRequest {
            mode,
            prompt,
            head_sha,
        };
        let backoff = Duration::from_secs(self.cfg.planner.retry_backoff_secs);
        let plan = match with_retry("planning", backoff, || self.deps.planner.plan(&request))? {
            PlanResponse::NoChange { reason } => return Ok(Finish::no_op(reason)),
            PlanResponse::Patch(plan) if plan.diff.trim().is_empty() => {
                return Ok(Finish::no_op("planner returned an empty diff"));
            }
            PlanResponse::Patch(plan) => plan,
        };

        self.enter(Stage::Applying);
        let applied = match self.apply(&plan)? {
            Ok(applied) => applied,
            Err(reason) => return Ok(Finish::blocked(reason, None)),
        };

        self.enter(Stage::Verifying);
        let commands = match &self.milestone {
            Some(milestone) => milestone.acceptance_commands.clone(),
            None => self.cfg.truth_check_commands(),
        };
        let verification = self.deps.verifier.verify(&commands, self.root);
        if !verification.all_passed {
            self.commit(&applied, &plan)?;
            let failed: Vec<String> = verification
                .failed()
                .map(|entry| format!("`{}`", entry.command))
                .collect();
            return Ok(Finish::blocked(
                format!("acceptance commands failed: {}", failed.join(", ")),
                Some(verification),
            ));
        }

        self.enter(Stage::Publishing);
        if !self.commit(&applied, &plan)? {
            self.discard_branch();
            return Ok(Finish::no_op("patch produced no changes"));
        }
        let branch = self
            .branch
            .clone()
            .ok_or_else(|| anyhow!("run branch missing before publishing"))?;
        let request = PullRequest {
            head: branch.clone(),
            base: self.cfg.default_branch.clone(),
            title: self.title(&plan),
            body: self.pr_body(&plan, &verification),
        };
        let backoff = Duration::from_secs(self.cfg.publish.retry_backoff_secs);
        let url = with_retry("publishing", backoff, || {
            self.deps.forge.push_branch(&branch)?;
            if let Some(url) = self.deps.forge.find_pull_request(&branch)? {
                return Ok(url);
            }
            self.deps.forge.open_pull_request(&request)
        })?;
        info!(url = %url, "pull request ready");
        Ok(Finish {
            outcome: RunOutcome::PrCreated,
            reason: None,
            pr_url: Some(url),
            verification: Some(verification),
        })
    }

    fn base_branch(&self) -> String {
        base_branch_name(
            &self.cfg.branch_prefix,
            self.options.date,
            self.mode.unwrap_or(RunMode::Fix),
            self.milestone.as_ref().map(|m| m.id.as_str()),
        )
    }

    fn build_prompt(&self, head_sha: &str, failure: Option<&VerificationResult>) -> Result<String> {
        let files = match &self.milestone {
            Some(milestone) => gather_target_files(
                &self.git,
                &milestone.target_file_patterns,
                &self.cfg.context,
            )?,
            None => Vec::new(),
        };
        let inputs = PromptInputs {
            head_sha: head_sha.to_string(),
            repo_rules: self.cfg.repo_rules.clone(),
            max_files: self.cfg.policy.max_files,
            max_lines: self.cfg.policy.max_lines,
            files,
        };
        let builder = PromptBuilder::new(self.cfg.planner.prompt_budget_bytes);
        match (&self.milestone, failure) {
            (Some(milestone), _) => builder.build_milestone(&inputs, milestone),
            (None, Some(failure)) => builder.build_fix(&inputs, failure),
            (None, None) => Err(anyhow!("fix mode without a failing truth check")),
        }
    }

    /// Create the run branch and apply the plan. `Ok(Err(reason))` is a
    /// rejected patch; the branch is discarded and the tree is unchanged.
    fn apply(&mut self, plan: &PatchPlan) -> Result<std::result::Result<AppliedChangeSet, String>> {
        let base = self.base_branch();
        let mut lookup_error = None;
        let branch = unique_branch_name(&base, |candidate| {
            match self.git.branch_exists(&self.cfg.remote, candidate) {
                Ok(taken) => taken,
                Err(err) => {
                    lookup_error.get_or_insert(err);
                    false
                }
            }
        });
        if let Some(err) = lookup_error {
            return Err(err);
        }
        self.git.checkout_new_branch(&branch)?;
        self.branch = Some(branch);

        let targets: &[String] = self
            .milestone
            .as_ref()
            .map(|m| m.target_file_patterns.as_slice())
            .unwrap_or_default();
        let ctx = PolicyContext {
            escalate: self.options.escalate,
            target_patterns: targets,
        };
        match apply_patch(self.root, &plan.diff, &self.cfg.policy, &ctx) {
            Ok(applied) => {
                self.applied_paths.clone_from(&applied.files_touched);
                Ok(Ok(applied))
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(%reason, "patch rejected");
                self.discard_branch();
                Ok(Err(reason))
            }
        }
    }

    /// Commit the touched files to the run branch. False when nothing was staged.
    fn commit(&self, applied: &AppliedChangeSet, plan: &PatchPlan) -> Result<bool> {
        self.git.add_paths(&applied.files_touched)?;
        let message = format!("{}\n\n{}\n\nKeeper run {}", self.title(plan), plan.summary, self.run_id);
        self.git.commit_staged(&message)
    }

    /// Leave the run branch and safe-delete it. Only used while it has no commits.
    fn discard_branch(&mut self) {
        let Some(branch) = self.branch.take() else {
            return;
        };
        if let Err(err) = self.git.checkout_branch(&self.cfg.default_branch) {
            warn!(err = %format!("{err:#}"), "failed to leave run branch");
            self.branch = Some(branch);
            return;
        }
        if let Err(err) = self.git.delete_branch_safe(&branch) {
            warn!(branch = %branch, err = %format!("{err:#}"), "failed to delete run branch");
        }
    }

    /// Drop uncommitted patch changes, then return to the default branch. A run
    /// branch left without commits is deleted.
    fn leave_branch(&mut self) -> Result<()> {
        self.git.restore_paths(&self.applied_paths)?;
        self.git.checkout_branch(&self.cfg.default_branch)?;
        if let Some(branch) = self.branch.clone()
            && self.git.commits_ahead(&self.cfg.default_branch, &branch)? == 0
        {
            self.git.delete_branch_safe(&branch)?;
            info!(branch = %branch, "deleted run branch without commits");
            self.branch = None;
        }
        Ok(())
    }

    fn title(&self, plan: &PatchPlan) -> String {
        match &self.milestone {
            Some(milestone) => format!("keeper: {} ({})", milestone.title, milestone.id),
            None => {
                let summary = plan.summary.lines().next().unwrap_or_default().trim();
                if summary.is_empty() {
                    "keeper: fix failing truth checks".to_string()
                } else {
                    format!("keeper: fix {summary}")
                }
            }
        }
    }

    fn pr_body(&self, plan: &PatchPlan, verification: &VerificationResult) -> String {
        let mut body = format!(
            "## Summary\n\n{}\n\n## Root cause\n\n{}\n\n## Verification\n\n{}\n---\n\nRun `{}`",
            plan.summary.trim(),
            if plan.root_cause.trim().is_empty() {
                "n/a"
            } else {
                plan.root_cause.trim()
            },
            verification.render_markdown(),
            self.run_id,
        );
        if let Some(milestone) = &self.milestone {
            body.push_str(&format!(", milestone `{}`", milestone.id));
        }
        body.push('\n');
        body
    }

    fn finalize(&mut self, finish: Finish, started_at: DateTime<Utc>) -> Result<RunRecord> {
        self.enter(Stage::Finalizing);
        let mut reason = finish.reason;

        if self.branch.is_some()
            && let Err(err) = self.leave_branch()
        {
            warn!(err = %format!("{err:#}"), "failed to return to default branch");
            append_note(&mut reason, &format!("failed to return to {}: {err:#}", self.cfg.default_branch));
        }

        if let Some(milestone) = &self.milestone {
            let (to, note) = match finish.outcome {
                RunOutcome::PrCreated => (MilestoneStatus::Done, None),
                _ => (
                    MilestoneStatus::Blocked,
                    Some(reason.clone().unwrap_or_else(|| "run ended without a change".to_string())),
                ),
            };
            match self.deps.backlog.transition(
                &milestone.id,
                MilestoneStatus::InProgress,
                to,
                note.as_deref(),
            ) {
                Ok(_) => {
                    if to == MilestoneStatus::Done && milestone.stop_after_completion {
                        set_halt(
                            &self.paths,
                            self.options.date,
                            &format!("milestone '{}' completed with stop_after_completion", milestone.id),
                        )?;
                    }
                }
                Err(err) => {
                    warn!(milestone = %milestone.id, err = %err, "milestone update failed");
                    append_note(&mut reason, &format!("milestone update failed: {err}"));
                }
            }
        }

        let record = RunRecord {
            run_id: self.run_id.clone(),
            date: self.options.date,
            mode: self.mode,
            milestone_id: self.milestone.as_ref().map(|m| m.id.clone()),
            outcome: finish.outcome,
            pr_url: finish.pr_url,
            branch: self.branch.clone(),
            reason,
            verification_result: finish.verification,
            started_at,
            finished_at: Utc::now(),
        };
        append_record(&self.paths, &record)?;
        info!(
            run_id = %record.run_id,
            outcome = %record.outcome,
            reason = record.reason.as_deref().unwrap_or(""),
            "run finished"
        );
        Ok(record)
    }
}

fn append_note(reason: &mut Option<String>, note: &str) {
    *reason = Some(match reason.take() {
        Some(existing) => format!("{existing}; {note}"),
        None => note.to_string(),
    });
}

/// Run `op`, retrying once after `backoff` on failure.
fn with_retry<T>(what: &str, backoff: Duration, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(step = what, err = %format!("{first:#}"), backoff_secs = backoff.as_secs(), "retrying");
            if !backoff.is_zero() {
                thread::sleep(backoff);
            }
            op().map_err(|second| second.context(format!("{what} failed twice (first: {first:#})")))
        }
    }
}

fn new_run_id(at: DateTime<Utc>) -> String {
    format!("run-{}-{}", at.format("%Y%m%dT%H%M%S%3fZ"), std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_runs_twice_at_most() {
        let mut calls = 0;
        let result: Result<()> = with_retry("planning", Duration::ZERO, || {
            calls += 1;
            Err(anyhow!("boom {calls}"))
        });
        assert_eq!(calls, 2);
        let message = format!("{:#}", result.expect_err("fails"));
        assert!(message.contains("planning failed twice"));
        assert!(message.contains("boom 1"));
        assert!(message.contains("boom 2"));

        let mut calls = 0;
        let value = with_retry("publishing", Duration::ZERO, || {
            calls += 1;
            if calls == 1 { Err(anyhow!("flaky")) } else { Ok(7) }
        })
        .expect("second attempt");
        assert_eq!(value, 7);
    }

    #[test]
    fn run_ids_are_sortable_timestamps() {
        let at = DateTime::parse_from_rfc3339("2026-10-19T06:05:04.123Z")
            .expect("time")
            .with_timezone(&Utc);
        let id = new_run_id(at);
        assert!(id.starts_with("run-20261019T060504123Z-"));
    }

    #[test]
    fn notes_append_to_existing_reason() {
        let mut reason = None;
        append_note(&mut reason, "first");
        append_note(&mut reason, "second");
        assert_eq!(reason.as_deref(), Some("first; second"));
    }
}
