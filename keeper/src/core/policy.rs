//! Safety policy: pure predicates over a proposed change set.
//!
//! Rules are checked in order and the first violation wins. The denial reason
//! is surfaced verbatim on the milestone and in the daily summary, so reason
//! prefixes are part of the contract.

use std::collections::BTreeSet;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::core::diff::PatchSet;

pub const DEFAULT_MAX_FILES: usize = 3;
pub const DEFAULT_MAX_LINES: usize = 150;

/// `[policy]` section of `.keeper/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyLimits {
    pub max_files: usize,
    pub max_lines: usize,
    /// Globs a change may not touch unless the active milestone targets them.
    pub forbidden_paths: Vec<String>,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_lines: DEFAULT_MAX_LINES,
            forbidden_paths: vec![
                "**/migrations/**".to_string(),
                "**/migrate/**".to_string(),
                "**/auth/**".to_string(),
                "**/authentication/**".to_string(),
                ".keeper/**".to_string(),
            ],
        }
    }
}

/// A ref-level side effect attached to a change set.
///
/// A diff cannot express ref operations, so [`ChangeSet::from_patch`] leaves
/// them empty. Callers attach them with [`ChangeSet::with_ref_operation`]. The
/// destructive variants exist so the policy can reject them explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefOperation {
    CreateBranch(String),
    Push(String),
    ForcePush(String),
    DeleteBranch(String),
}

impl RefOperation {
    fn is_destructive(&self) -> bool {
        matches!(self, RefOperation::ForcePush(_) | RefOperation::DeleteBranch(_))
    }
}

/// What a proposed change would do, as seen by the policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub files_touched: BTreeSet<String>,
    /// Added + removed lines.
    pub line_delta: usize,
    pub ref_operations: Vec<RefOperation>,
}

impl ChangeSet {
    pub fn from_patch(patch: &PatchSet) -> Self {
        Self {
            files_touched: patch.files_touched(),
            line_delta: patch.line_delta(),
            ref_operations: Vec::new(),
        }
    }

    pub fn with_ref_operation(mut self, op: RefOperation) -> Self {
        self.ref_operations.push(op);
        self
    }
}

/// Run-specific inputs to a policy decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyContext<'a> {
    /// Operator explicitly lifted the size limits for this run.
    pub escalate: bool,
    /// `target_file_patterns` of the active milestone (empty in fix mode).
    pub target_patterns: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Compile glob patterns into a matcher.
pub fn compile_globs(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

/// Evaluate a change set against the policy.
///
/// Invalid glob patterns deny the change rather than silently matching
/// nothing.
pub fn evaluate(limits: &PolicyLimits, change: &ChangeSet, ctx: &PolicyContext<'_>) -> Decision {
    let file_count = change.files_touched.len();
    if !ctx.escalate && file_count > limits.max_files {
        return Decision::Denied(format!(
            "file count exceeds limit ({file_count} > {})",
            limits.max_files
        ));
    }

    if !ctx.escalate && change.line_delta > limits.max_lines {
        return Decision::Denied(format!(
            "line count exceeds limit ({} > {})",
            change.line_delta, limits.max_lines
        ));
    }

    let forbidden = match compile_globs(&limits.forbidden_paths) {
        Ok(set) => set,
        Err(err) => return Decision::Denied(format!("invalid forbidden path pattern: {err}")),
    };
    let targets = match compile_globs(ctx.target_patterns) {
        Ok(set) => set,
        Err(err) => return Decision::Denied(format!("invalid target file pattern: {err}")),
    };
    if let Some(path) = change
        .files_touched
        .iter()
        .find(|path| forbidden.is_match(path.as_str()) && !targets.is_match(path.as_str()))
    {
        return Decision::Denied(format!("forbidden path touched: {path}"));
    }

    if let Some(op) = change.ref_operations.iter().find(|op| op.is_destructive()) {
        return Decision::Denied(format!("destructive ref operation not allowed: {op:?}"));
    }

    Decision::Allowed
}
