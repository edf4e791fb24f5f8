//! Target-file context for planner prompts.

use std::collections::BTreeSet;
use std::fs;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::io::config::ContextConfig;
use crate::io::git::Git;

/// A tracked file's contents, cut at the configured character limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSnippet {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

/// Collect up to `limits.max_files` tracked files matching `patterns`, in
/// pattern order then git order. Unreadable or non-UTF-8 files are skipped.
#[instrument(skip_all, fields(patterns = patterns.len(), max_files = limits.max_files))]
pub fn gather_target_files(
    git: &Git,
    patterns: &[String],
    limits: &ContextConfig,
) -> Result<Vec<FileSnippet>> {
    let mut seen = BTreeSet::new();
    let mut snippets = Vec::new();
    for pattern in patterns {
        if snippets.len() >= limits.max_files {
            break;
        }
        let pathspec = format!(":(glob){pattern}");
        for path in git.ls_files(&pathspec)? {
            if snippets.len() >= limits.max_files {
                break;
            }
            if !seen.insert(path.clone()) {
                continue;
            }
            let absolute = git.workdir().join(&path);
            let text = match fs::read_to_string(&absolute) {
                Ok(text) => text,
                Err(err) => {
                    debug!(path = %path, err = %err, "skipping unreadable context file");
                    continue;
                }
            };
            snippets.push(snippet(path, &text, limits.max_chars_per_file));
        }
    }
    debug!(files = snippets.len(), "gathered context files");
    Ok(snippets)
}

fn snippet(path: String, text: &str, max_chars: usize) -> FileSnippet {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => FileSnippet {
            path,
            content: text[..cut].to_string(),
            truncated: true,
        },
        None => FileSnippet {
            path,
            content: text.to_string(),
            truncated: false,
        },
    }
}
