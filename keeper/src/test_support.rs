//! Test-only helpers: scratch git repositories, milestone builders and
//! scripted collaborators for the orchestrator.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use tempfile::TempDir;

use crate::core::types::{Milestone, MilestoneKind, MilestoneStatus};
use crate::io::backlog::write_backlog;
use crate::io::config::{KeeperConfig, write_config};
use crate::io::forge::{Forge, PullRequest};
use crate::io::git::Git;
use crate::io::init::{InitOptions, KeeperPaths, init_keeper};
use crate::io::planner::{PlanRequest, PlanResponse, Planner};

/// A throwaway git repository on `main` with one initial commit.
pub struct TestRepo {
    _dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let root = dir
            .path()
            .canonicalize()
            .context("canonicalize tempdir")?;
        let repo = Self { _dir: dir, root };
        repo.run_git(&["init", "-q"])?;
        repo.run_git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.run_git(&["config", "user.name", "Keeper Test"])?;
        repo.run_git(&["config", "user.email", "keeper@example.com"])?;
        repo.run_git(&["config", "commit.gpgsign", "false"])?;
        repo.write_file("README.md", "# scratch\n")?;
        repo.commit_all("initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root, Duration::from_secs(30))
    }

    pub fn paths(&self) -> KeeperPaths {
        KeeperPaths::new(&self.root)
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.run_git(&["add", "-A"])?;
        self.run_git(&["commit", "-q", "--allow-empty", "-m", message])?;
        Ok(())
    }

    /// Scaffold `.keeper/` with `cfg` and `milestones`, then commit it.
    pub fn init_keeper(&self, cfg: &KeeperConfig, milestones: &[Milestone]) -> Result<KeeperPaths> {
        let paths = init_keeper(&self.root, &InitOptions { force: false })?;
        write_config(&paths.config_path, cfg)?;
        write_backlog(&paths.backlog_path, milestones)?;
        self.commit_all("chore: keeper setup")?;
        Ok(paths)
    }

    pub fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("run git {args:?}"))?;
        if !output.status.success() {
            bail!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// A `todo` feature milestone with deterministic fields and `true` as its
/// only acceptance command.
pub fn milestone(id: &str) -> Milestone {
    Milestone {
        id: id.to_string(),
        title: format!("{id} title"),
        kind: MilestoneKind::Feature,
        status: MilestoneStatus::Todo,
        description: None,
        target_file_patterns: Vec::new(),
        acceptance_commands: vec!["true".to_string()],
        stop_after_completion: false,
        created_at: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap_or_default(),
        reason: None,
        started_at: None,
        completed_at: None,
    }
}

pub fn milestone_with_status(id: &str, status: MilestoneStatus) -> Milestone {
    Milestone {
        status,
        ..milestone(id)
    }
}

/// Planner that replays queued responses in order. An `Err(message)` entry
/// becomes a planning failure.
pub struct ScriptedPlanner {
    responses: Mutex<VecDeque<Result<PlanResponse, String>>>,
    requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedPlanner {
    pub fn new(responses: Vec<Result<PlanResponse, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().expect("planner requests lock").clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let left = self.responses.lock().expect("planner queue lock").len();
        if left > 0 {
            bail!("scripted planner has {left} unused responses");
        }
        Ok(())
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        self.requests
            .lock()
            .expect("planner requests lock")
            .push(request.clone());
        match self.responses.lock().expect("planner queue lock").pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted planner exhausted")),
        }
    }
}

#[derive(Debug, Default)]
struct ForgeState {
    pushed: Vec<String>,
    pull_requests: Vec<(PullRequest, String)>,
    issues: Vec<(String, String)>,
    push_failures: VecDeque<String>,
}

/// In-memory forge. Pull request URLs are `https://forge.test/pull/<n>`.
#[derive(Debug, Default)]
pub struct ScriptedForge {
    state: Mutex<ForgeState>,
}

impl ScriptedForge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `push_branch` call with `message`.
    pub fn fail_next_push(&self, message: &str) {
        self.lock().push_failures.push_back(message.to_string());
    }

    pub fn pushed(&self) -> Vec<String> {
        self.lock().pushed.clone()
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.lock()
            .pull_requests
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    /// `(title, body)` per issue, in creation order.
    pub fn issues(&self) -> Vec<(String, String)> {
        self.lock().issues.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ForgeState> {
        self.state.lock().expect("forge state lock")
    }
}

impl Forge for ScriptedForge {
    fn push_branch(&self, branch: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(message) = state.push_failures.pop_front() {
            return Err(anyhow!(message));
        }
        state.pushed.push(branch.to_string());
        Ok(())
    }

    fn find_pull_request(&self, branch: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .pull_requests
            .iter()
            .find(|(request, _)| request.head == branch)
            .map(|(_, url)| url.clone()))
    }

    fn open_pull_request(&self, request: &PullRequest) -> Result<String> {
        let mut state = self.lock();
        let url = format!("https://forge.test/pull/{}", state.pull_requests.len() + 1);
        state.pull_requests.push((request.clone(), url.clone()));
        Ok(url)
    }

    fn upsert_issue(&self, title: &str, body: &str) -> Result<String> {
        let mut state = self.lock();
        let index = match state.issues.iter().position(|(existing, _)| existing == title) {
            Some(index) => {
                state.issues[index].1 = body.to_string();
                index
            }
            None => {
                state.issues.push((title.to_string(), body.to_string()));
                state.issues.len() - 1
            }
        };
        Ok(format!("https://forge.test/issues/{}", index + 1))
    }
}
