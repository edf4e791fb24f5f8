//! Git-hosting platform adapter (branch push, pull requests, issues).
//!
//! The [`Forge`] contract has no branch deletion and no force push.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};
use ureq::Agent;

use crate::io::config::KeeperConfig;
use crate::io::git::Git;

/// Pull request to open for a run branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

pub trait Forge {
    /// Push `branch` to the remote, never forced.
    fn push_branch(&self, branch: &str) -> Result<()>;
    /// URL of a pull request (any state) whose head is `branch`.
    fn find_pull_request(&self, branch: &str) -> Result<Option<String>>;
    /// Open a pull request and return its URL.
    fn open_pull_request(&self, request: &PullRequest) -> Result<String>;
    /// Update the issue titled `title`, or create it. Returns its URL.
    fn upsert_issue(&self, title: &str, body: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct PullSummary {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct IssueSummary {
    number: u64,
    title: String,
    html_url: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

/// GitHub REST adapter. Pushes go through git; everything else through the
/// API with a bearer token.
pub struct GitHubForge {
    git: Git,
    remote: String,
    api_base: String,
    repository: String,
    token: String,
    agent: Agent,
}

impl std::fmt::Debug for GitHubForge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubForge")
            .field("remote", &self.remote)
            .field("api_base", &self.api_base)
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

impl GitHubForge {
    /// Build from config; the token is read from `publish.token_env`.
    pub fn from_config(cfg: &KeeperConfig, git: Git) -> Result<Self> {
        let repository = cfg
            .repository
            .clone()
            .ok_or_else(|| anyhow!("config: `repository` (owner/name) is required to publish"))?;
        let token = std::env::var(&cfg.publish.token_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("{} is not set", cfg.publish.token_env))?;
        Ok(Self::new(
            git,
            cfg.remote.clone(),
            cfg.publish.api_base.clone(),
            repository,
            token,
            Duration::from_secs(cfg.publish.timeout_secs),
        ))
    }

    pub fn new(
        git: Git,
        remote: String,
        api_base: String,
        repository: String,
        token: String,
        timeout: Duration,
    ) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            git,
            remote,
            api_base: api_base.trim_end_matches('/').to_string(),
            repository,
            token,
            agent,
        }
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, self.repository, tail)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl Forge for GitHubForge {
    #[instrument(skip_all, fields(branch = %branch))]
    fn push_branch(&self, branch: &str) -> Result<()> {
        self.git.push_branch(&self.remote, branch)
    }

    #[instrument(skip_all, fields(branch = %branch))]
    fn find_pull_request(&self, branch: &str) -> Result<Option<String>> {
        let head = format!("{}:{branch}", repo_owner(&self.repository)?);
        let response = self
            .agent
            .get(&self.url("pulls"))
            .header("Authorization", &self.auth())
            .header("Accept", "application/vnd.github+json")
            .query("head", &head)
            .query("state", "all")
            .call()
            .context("list pull requests")?;
        let status = response.status().as_u16();
        if status != 200 {
            bail!("list pull requests: unexpected status {status}");
        }
        let pulls: Vec<PullSummary> = response
            .into_body()
            .read_json()
            .context("parse pull request list")?;
        debug!(found = pulls.len(), "pull requests for head");
        Ok(pulls.into_iter().next().map(|pull| pull.html_url))
    }

    #[instrument(skip_all, fields(head = %request.head, base = %request.base))]
    fn open_pull_request(&self, request: &PullRequest) -> Result<String> {
        let response = self
            .agent
            .post(&self.url("pulls"))
            .header("Authorization", &self.auth())
            .header("Accept", "application/vnd.github+json")
            .send_json(json!({
                "title": request.title,
                "body": request.body,
                "head": request.head,
                "base": request.base,
            }))
            .context("create pull request")?;
        let status = response.status().as_u16();
        if status != 201 {
            let detail = response.into_body().read_to_string().unwrap_or_default();
            bail!("create pull request: unexpected status {status}: {}", detail.trim());
        }
        let pull: PullSummary = response
            .into_body()
            .read_json()
            .context("parse created pull request")?;
        info!(url = %pull.html_url, "opened pull request");
        Ok(pull.html_url)
    }

    #[instrument(skip_all, fields(title = %title))]
    fn upsert_issue(&self, title: &str, body: &str) -> Result<String> {
        let response = self
            .agent
            .get(&self.url("issues"))
            .header("Authorization", &self.auth())
            .header("Accept", "application/vnd.github+json")
            .query("state", "all")
            .query("per_page", "100")
            .call()
            .context("list issues")?;
        let status = response.status().as_u16();
        if status != 200 {
            bail!("list issues: unexpected status {status}");
        }
        let issues: Vec<IssueSummary> = response
            .into_body()
            .read_json()
            .context("parse issue list")?;

        let response = match find_issue(&issues, title) {
            Some(issue) => self
                .agent
                .patch(&self.url(&format!("issues/{}", issue.number)))
                .header("Authorization", &self.auth())
                .header("Accept", "application/vnd.github+json")
                .send_json(json!({ "body": body }))
                .context("update issue")?,
            None => self
                .agent
                .post(&self.url("issues"))
                .header("Authorization", &self.auth())
                .header("Accept", "application/vnd.github+json")
                .send_json(json!({ "title": title, "body": body }))
                .context("create issue")?,
        };
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            bail!("upsert issue: unexpected status {status}");
        }
        let issue: IssueSummary = response
            .into_body()
            .read_json()
            .context("parse issue")?;
        info!(url = %issue.html_url, "upserted issue");
        Ok(issue.html_url)
    }
}

fn repo_owner(repository: &str) -> Result<&str> {
    match repository.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => Ok(owner),
        _ => bail!("repository must be `owner/name`, got '{repository}'"),
    }
}

/// Exact-title match, ignoring pull requests (which the issues API also lists).
fn find_issue<'a>(issues: &'a [IssueSummary], title: &str) -> Option<&'a IssueSummary> {
    issues
        .iter()
        .find(|issue| issue.title == title && issue.pull_request.is_none())
}
