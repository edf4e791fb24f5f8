//! Run branch naming.

use chrono::NaiveDate;

use crate::core::types::RunMode;

/// Base branch name for a run: `<prefix>/<YYYYMMDD>-fix` or
/// `<prefix>/<YYYYMMDD>-<milestone slug>`.
pub fn base_branch_name(
    prefix: &str,
    date: NaiveDate,
    mode: RunMode,
    milestone_id: Option<&str>,
) -> String {
    let stamp = date.format("%Y%m%d");
    let suffix = match (mode, milestone_id) {
        (RunMode::Milestone, Some(id)) => slug(id),
        _ => "fix".to_string(),
    };
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{stamp}-{suffix}")
    } else {
        format!("{prefix}/{stamp}-{suffix}")
    }
}

/// First of `base`, `base-2`, `base-3`, ... for which `taken` is false.
pub fn unique_branch_name(base: &str, mut taken: impl FnMut(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 2usize;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Lowercase, ref-safe form of a milestone id.
pub fn slug(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for ch in id.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    let collapsed = trimmed.replace("..", ".");
    if collapsed.is_empty() {
        "milestone".to_string()
    } else {
        collapsed
    }
}
