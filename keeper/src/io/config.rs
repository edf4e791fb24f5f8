//! Keeper configuration stored under `.keeper/config.toml`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::{PolicyLimits, compile_globs};
use crate::io::atomic::write_atomic;

/// Keeper configuration (TOML).
///
/// Edited by humans; missing fields take defaults so a near-empty file works.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeeperConfig {
    /// Branch that truth checks run against and PRs target.
    pub default_branch: String,

    /// Remote used for pushes and remote-tracking branch lookups.
    pub remote: String,

    /// `owner/name` on the forge. Required for publishing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Run branches are named `<branch_prefix>/<YYYYMMDD>-<suffix>`.
    pub branch_prefix: String,

    /// `git pull --ff-only` the default branch before running truth checks.
    pub sync_default_branch: bool,

    /// Timeout applied to every git subprocess.
    pub git_timeout_secs: u64,

    /// Free-form repository rules included in every planner prompt.
    pub repo_rules: Vec<String>,

    pub policy: PolicyLimits,
    pub verify: VerifyConfig,
    pub planner: PlannerConfig,
    pub publish: PublishConfig,
    pub context: ContextConfig,

    /// Commands that define "the default branch is healthy".
    pub truth_checks: Vec<TruthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Per-command timeout for acceptance commands and truth checks.
    pub timeout_secs: u64,
    /// Captured output kept per stream.
    pub output_limit_bytes: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10 * 60,
            output_limit_bytes: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TruthCheck {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Planner command; the prompt is fed on stdin.
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timeout_secs: u64,
    /// Wait before the single planning retry.
    pub retry_backoff_secs: u64,
    pub output_limit_bytes: usize,
    /// Rendered prompt budget in bytes; droppable sections go first.
    pub prompt_budget_bytes: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string()],
            model: None,
            timeout_secs: 15 * 60,
            retry_backoff_secs: 30,
            output_limit_bytes: 200_000,
            prompt_budget_bytes: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublishConfig {
    /// Timeout for forge API requests.
    pub timeout_secs: u64,
    /// Wait before the single publishing retry.
    pub retry_backoff_secs: u64,
    pub api_base: String,
    /// Environment variable holding the forge token.
    pub token_env: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            retry_backoff_secs: 10,
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Files matching the milestone's target patterns included in the prompt.
    pub max_files: usize,
    pub max_chars_per_file: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_chars_per_file: 2000,
        }
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            remote: "origin".to_string(),
            repository: None,
            branch_prefix: "keeper".to_string(),
            sync_default_branch: false,
            git_timeout_secs: 120,
            repo_rules: Vec::new(),
            policy: PolicyLimits::default(),
            verify: VerifyConfig::default(),
            planner: PlannerConfig::default(),
            publish: PublishConfig::default(),
            context: ContextConfig::default(),
            truth_checks: Vec::new(),
        }
    }
}

impl KeeperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_branch.trim().is_empty() {
            return Err(anyhow!("default_branch must be non-empty"));
        }
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must be non-empty"));
        }
        if self.branch_prefix.contains("..")
            || self.branch_prefix.chars().any(char::is_whitespace)
        {
            return Err(anyhow!(
                "branch_prefix '{}' is not a valid ref prefix",
                self.branch_prefix
            ));
        }
        if let Some(repo) = &self.repository
            && repo.split('/').filter(|part| !part.is_empty()).count() != 2
        {
            return Err(anyhow!("repository must be 'owner/name', got '{repo}'"));
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        if self.policy.max_files == 0 || self.policy.max_lines == 0 {
            return Err(anyhow!("policy.max_files and policy.max_lines must be > 0"));
        }
        compile_globs(&self.policy.forbidden_paths).context("policy.forbidden_paths")?;
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        if self.verify.output_limit_bytes == 0 {
            return Err(anyhow!("verify.output_limit_bytes must be > 0"));
        }
        if self.planner.command.is_empty() || self.planner.command[0].trim().is_empty() {
            return Err(anyhow!("planner.command must be a non-empty array"));
        }
        if self.planner.timeout_secs == 0 || self.planner.output_limit_bytes == 0 {
            return Err(anyhow!(
                "planner.timeout_secs and planner.output_limit_bytes must be > 0"
            ));
        }
        if self.publish.timeout_secs == 0 {
            return Err(anyhow!("publish.timeout_secs must be > 0"));
        }
        let mut names = HashSet::new();
        for check in &self.truth_checks {
            if check.name.trim().is_empty() || check.command.trim().is_empty() {
                return Err(anyhow!("truth_checks entries need a name and a command"));
            }
            if !names.insert(check.name.as_str()) {
                return Err(anyhow!("duplicate truth check name '{}'", check.name));
            }
        }
        Ok(())
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn truth_check_commands(&self) -> Vec<String> {
        self.truth_checks
            .iter()
            .map(|check| check.command.clone())
            .collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KeeperConfig::default()`.
pub fn load_config(path: &Path) -> Result<KeeperConfig> {
    if !path.exists() {
        let cfg = KeeperConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KeeperConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KeeperConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
