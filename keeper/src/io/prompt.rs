//! Prompt builder for planner requests.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable sections go
//! first and the last remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Milestone, MilestoneKind, VerificationResult};
use crate::io::context::FileSnippet;

const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const MILESTONE_TEMPLATE: &str = include_str!("prompts/milestone.md");

/// Drop order when over budget.
const DROP_ORDER: [&str; 2] = ["files", "rules"];

const TRUNCATION_MARKER: &str = "\n[truncated]";

#[derive(Debug, Clone, Serialize)]
struct FailingCheck {
    command: String,
    timed_out: bool,
    output: String,
}

#[derive(Debug, Clone, Serialize)]
struct MilestoneContext {
    id: String,
    title: String,
    kind: &'static str,
    description: Option<String>,
    acceptance: Vec<String>,
    targets: Vec<String>,
}

impl MilestoneContext {
    fn from_milestone(milestone: &Milestone) -> Self {
        Self {
            id: milestone.id.clone(),
            title: milestone.title.clone(),
            kind: match milestone.kind {
                MilestoneKind::Fix => "fix",
                MilestoneKind::Feature => "feature",
            },
            description: milestone
                .description
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            acceptance: milestone.acceptance_commands.clone(),
            targets: milestone.target_file_patterns.clone(),
        }
    }
}

/// Inputs shared by both prompt kinds.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub head_sha: String,
    pub repo_rules: Vec<String>,
    pub max_files: usize,
    pub max_lines: usize,
    pub files: Vec<FileSnippet>,
}

/// Builds planner prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Prompt asking for a repair of the failed truth checks in `failure`.
    pub fn build_fix(&self, input: &PromptInputs, failure: &VerificationResult) -> Result<String> {
        let failing: Vec<FailingCheck> = failure
            .failed()
            .map(|entry| FailingCheck {
                command: entry.command.clone(),
                timed_out: entry.timed_out,
                output: entry.captured_output.trim_end().to_string(),
            })
            .collect();
        let env = environment()?;
        let rendered = env
            .get_template("fix")?
            .render(context! {
                head_sha => &input.head_sha,
                max_files => input.max_files,
                max_lines => input.max_lines,
                failing => failing,
                rules => non_empty_rules(&input.repo_rules),
                files => &input.files,
            })
            .context("render fix prompt")?;
        Ok(self.fit(&rendered))
    }

    /// Prompt asking for the next step of `milestone`.
    pub fn build_milestone(&self, input: &PromptInputs, milestone: &Milestone) -> Result<String> {
        let env = environment()?;
        let rendered = env
            .get_template("milestone")?
            .render(context! {
                head_sha => &input.head_sha,
                max_files => input.max_files,
                max_lines => input.max_lines,
                milestone => MilestoneContext::from_milestone(milestone),
                rules => non_empty_rules(&input.repo_rules),
                files => &input.files,
            })
            .context("render milestone prompt")?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("fix", FIX_TEMPLATE)
        .context("load fix template")?;
    env.add_template("milestone", MILESTONE_TEMPLATE)
        .context("load milestone template")?;
    Ok(env)
}

fn non_empty_rules(rules: &[String]) -> Vec<&str> {
    rules
        .iter()
        .map(|rule| rule.trim())
        .filter(|rule| !rule.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid section regex")
});

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let others = total - last.content.len();
    let allowed = budget.saturating_sub(others);
    let before_len = last.content.len();
    let keep = if allowed > TRUNCATION_MARKER.len() {
        allowed - TRUNCATION_MARKER.len()
    } else {
        allowed
    };
    let cut = floor_char_boundary(&last.content, keep);
    last.content.truncate(cut);
    if allowed > TRUNCATION_MARKER.len() {
        last.content.push_str(TRUNCATION_MARKER);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut idx = index;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
