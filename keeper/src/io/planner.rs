//! Patch-plan service abstraction.
//!
//! The [`Planner`] trait decouples the orchestrator from the model backend
//! (currently `codex exec`). Tests use scripted planners that return
//! predetermined plans without spawning processes. Retries belong to the
//! orchestrator; one `plan` call is one attempt.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::diff::parse_diff;
use crate::core::types::RunMode;
use crate::io::init::PATCH_PLAN_SCHEMA;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Literal some models emit in place of a diff when they find nothing to do.
const NO_PATCH_SIGNAL: &str = "NO_PATCH";

/// Input to one planning attempt.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub mode: RunMode,
    /// Rendered prompt (context, rules, failure output or milestone details).
    pub prompt: String,
    /// Repository snapshot the plan must apply to.
    pub head_sha: String,
}

/// A proposed change. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    pub summary: String,
    pub root_cause: String,
    pub diff: String,
    /// Derived from `diff`; empty when the diff does not parse.
    pub files_touched: Vec<String>,
    /// Derived from `diff`; 0 when the diff does not parse.
    pub line_delta: usize,
}

impl PatchPlan {
    pub fn new(summary: impl Into<String>, root_cause: impl Into<String>, diff: impl Into<String>) -> Self {
        let diff = diff.into();
        let (files_touched, line_delta) = match parse_diff(&diff) {
            Ok(patch) => (patch.files_touched().into_iter().collect(), patch.line_delta()),
            Err(_) => (Vec::new(), 0),
        };
        Self {
            summary: summary.into(),
            root_cause: root_cause.into(),
            diff,
            files_touched,
            line_delta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanResponse {
    Patch(PatchPlan),
    /// The planner found no safe change.
    NoChange { reason: String },
}

/// Abstraction over patch-plan backends.
pub trait Planner {
    fn plan(&self, request: &PlanRequest) -> Result<PlanResponse>;
}

/// Raw planner output, shaped by `schemas/patch_plan/v1.schema.json`.
#[derive(Debug, Deserialize)]
struct RawPlan {
    status: String,
    summary: String,
    root_cause: String,
    diff: String,
}

/// Planner that spawns `codex exec` (or a compatible command).
#[derive(Debug, Clone)]
pub struct CodexPlanner {
    pub command: Vec<String>,
    pub model: Option<String>,
    pub workdir: PathBuf,
    pub schema_path: PathBuf,
    pub output_path: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Planner for CodexPlanner {
    #[instrument(skip_all, fields(mode = request.mode.as_str(), head = %request.head_sha, timeout_secs = self.timeout.as_secs()))]
    fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("planner command is empty"))?;
        for dir in [self.schema_path.parent(), self.output_path.parent()]
            .into_iter()
            .flatten()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        fs::write(&self.schema_path, PATCH_PLAN_SCHEMA)
            .with_context(|| format!("write schema {}", self.schema_path.display()))?;
        if self.output_path.exists() {
            fs::remove_file(&self.output_path).with_context(|| {
                format!("remove stale planner output {}", self.output_path.display())
            })?;
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--sandbox")
            .arg("read-only")
            .arg("--skip-git-repo-check");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("--output-schema")
            .arg(&self.schema_path)
            .arg("--output-last-message")
            .arg(&self.output_path)
            .arg("-")
            .current_dir(&self.workdir);

        info!(program = %program, "requesting patch plan");
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run planner")?;
        write_planner_log(&self.log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "planner timed out");
            bail!("planner timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "planner failed");
            bail!(
                "planner exited with status {:?} (log: {})",
                output.status.code(),
                self.log_path.display()
            );
        }
        if !self.output_path.exists() {
            bail!("missing planner output {}", self.output_path.display());
        }

        let contents = fs::read_to_string(&self.output_path)
            .with_context(|| format!("read planner output {}", self.output_path.display()))?;
        let response = parse_plan_output(&contents)?;
        debug!(no_change = matches!(response, PlanResponse::NoChange { .. }), "parsed plan");
        Ok(response)
    }
}

/// Validate planner JSON against the patch-plan schema and map it to a
/// [`PlanResponse`].
pub fn parse_plan_output(contents: &str) -> Result<PlanResponse> {
    let value: Value = serde_json::from_str(contents.trim()).context("parse planner output json")?;
    let schema: Value =
        serde_json::from_str(PATCH_PLAN_SCHEMA).context("parse patch plan schema")?;
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile patch plan schema")?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "planner output failed schema validation:\n- {}",
            messages.join("\n- ")
        );
    }

    let raw: RawPlan = serde_json::from_value(value).context("deserialize planner output")?;
    let diff = raw.diff.trim();
    if raw.status == "no_patch" || diff.is_empty() || diff == NO_PATCH_SIGNAL {
        let reason = if raw.summary.trim().is_empty() {
            "planner found no safe change".to_string()
        } else {
            raw.summary.trim().to_string()
        };
        return Ok(PlanResponse::NoChange { reason });
    }
    Ok(PlanResponse::Patch(PatchPlan::new(
        raw.summary.trim(),
        raw.root_cause.trim(),
        raw.diff,
    )))
}

fn write_planner_log(path: &std::path::Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create planner log dir {}", parent.display()))?;
    }
    fs::write(path, output.combined())
        .with_context(|| format!("write planner log {}", path.display()))
}
