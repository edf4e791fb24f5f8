//! `.keeper/` layout and `keeper init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use tracing::info;

use crate::io::config::{KeeperConfig, write_config};

pub const PATCH_PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/patch_plan/v1.schema.json"
));

/// Canonical paths within `.keeper/` for a repository root.
#[derive(Debug, Clone)]
pub struct KeeperPaths {
    pub root: PathBuf,
    pub keeper_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub planner_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub backlog_path: PathBuf,
    pub backlog_lock_path: PathBuf,
    pub run_log_lock_path: PathBuf,
    pub default_verification_path: PathBuf,
    pub plan_schema_path: PathBuf,
    pub planner_output_path: PathBuf,
    pub planner_log_path: PathBuf,
}

impl KeeperPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let keeper_dir = root.join(".keeper");
        let state_dir = keeper_dir.join("state");
        let runs_dir = keeper_dir.join("runs");
        let planner_dir = state_dir.join("planner");
        Self {
            root: root.clone(),
            keeper_dir: keeper_dir.clone(),
            state_dir: state_dir.clone(),
            runs_dir,
            planner_dir: planner_dir.clone(),
            gitignore_path: keeper_dir.join(".gitignore"),
            config_path: keeper_dir.join("config.toml"),
            backlog_path: keeper_dir.join("milestones.toml"),
            backlog_lock_path: state_dir.join("backlog.lock"),
            run_log_lock_path: state_dir.join("runs.lock"),
            default_verification_path: state_dir.join("default_branch.json"),
            plan_schema_path: state_dir.join("patch_plan.schema.json"),
            planner_output_path: planner_dir.join("last_message.json"),
            planner_log_path: planner_dir.join("planner.log"),
        }
    }

    /// Append-only run log for one day.
    pub fn run_log_path(&self, date: NaiveDate) -> PathBuf {
        self.runs_dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Presence means "no further runs today".
    pub fn halt_flag_path(&self, date: NaiveDate) -> PathBuf {
        self.state_dir
            .join(format!("halt-{}", date.format("%Y-%m-%d")))
    }
}

/// Options for `init_keeper`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Rewrite config, `.gitignore` and schema if `.keeper/` exists. The
    /// backlog is never overwritten.
    pub force: bool,
}

/// Create `.keeper/` scaffolding in `root`.
pub fn init_keeper(root: &Path, options: &InitOptions) -> Result<KeeperPaths> {
    let paths = KeeperPaths::new(root);
    if paths.keeper_dir.exists() && !paths.keeper_dir.is_dir() {
        return Err(anyhow!("keeper init: .keeper exists but is not a directory"));
    }
    if paths.keeper_dir.exists() && !options.force {
        return Err(anyhow!(
            "keeper init: .keeper already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.runs_dir)?;
    write_file(&paths.gitignore_path, KEEPER_GITIGNORE)?;
    write_config(&paths.config_path, &KeeperConfig::default())?;
    write_file(&paths.plan_schema_path, PATCH_PLAN_SCHEMA)?;
    if !paths.backlog_path.exists() {
        write_file(&paths.backlog_path, BACKLOG_TEMPLATE)?;
    }

    info!(root = %root.display(), "initialized .keeper");
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const KEEPER_GITIGNORE: &str = "runs/\nstate/\n";

const BACKLOG_TEMPLATE: &str = r#"# Milestone backlog. Keeper works on the first `todo` entry, top to bottom.
#
# [[milestones]]
# id = "retry-fetch"
# title = "Retry transient fetch failures"
# kind = "feature"            # fix | feature
# status = "todo"             # todo | in_progress | done | blocked
# description = "Wrap fetch() in a bounded retry with backoff."
# target_file_patterns = ["src/fetch/**"]
# acceptance_commands = ["cargo test fetch"]
# stop_after_completion = false
# created_at = "2026-01-01"
"#;
