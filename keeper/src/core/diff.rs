//! Unified-diff model and parser.
//!
//! Planner output is untrusted data. It is parsed into a tagged sequence of
//! per-file hunks and fully validated before anything touches the filesystem.
//! The parser is strict: anything it does not understand is an error rather
//! than something to skip.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@(.*)$").expect("valid hunk regex")
});

const DEV_NULL: &str = "/dev/null";

/// Header lines that may appear between file sections and carry no content.
const IGNORED_HEADER_PREFIXES: &[&str] = &[
    "diff --git ",
    "index ",
    "new file mode ",
    "deleted file mode ",
    "old mode ",
    "new mode ",
];

/// Structurally invalid diff text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed diff at line {line}: {message}")]
pub struct ParseError {
    /// 1-based line number in the planner's raw text.
    pub line: usize,
    pub message: String,
}

/// A target path that would resolve outside the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path '{path}' escapes the repository: {reason}")]
pub struct PathEscapeError {
    pub path: String,
    pub reason: String,
}

/// Parse failure, split by how the orchestrator reports it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),
}

/// How a file section changes its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Modify,
    Create,
    Delete,
}

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Removed(String),
    Added(String),
}

/// A single `@@ -a,b +c,d @@` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based anchor line in the current file (0 for an empty file).
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
    /// `\ No newline at end of file` followed an old-side line.
    pub old_missing_newline: bool,
    /// `\ No newline at end of file` followed a new-side line.
    pub new_missing_newline: bool,
}

impl Hunk {
    /// Lines expected at the anchor (context + removed), in order.
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Removed(text) => Some(text.as_str()),
                HunkLine::Added(_) => None,
            })
            .collect()
    }

    /// Lines that replace the anchor (context + added), in order.
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Added(text) => Some(text.as_str()),
                HunkLine::Removed(_) => None,
            })
            .collect()
    }

    pub fn added(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, HunkLine::Added(_)))
            .count()
    }

    pub fn removed(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, HunkLine::Removed(_)))
            .count()
    }
}

/// All hunks for one target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Normalized repository-relative path.
    pub path: String,
    pub change: FileChange,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn line_delta(&self) -> usize {
        self.hunks.iter().map(|h| h.added() + h.removed()).sum()
    }
}

/// Parsed diff: ordered file sections, each path at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSet {
    pub files: Vec<FilePatch>,
}

impl PatchSet {
    /// Touched paths, sorted.
    pub fn files_touched(&self) -> BTreeSet<String> {
        self.files.iter().map(|file| file.path.clone()).collect()
    }

    /// Total added + removed lines.
    pub fn line_delta(&self) -> usize {
        self.files.iter().map(FilePatch::line_delta).sum()
    }
}

/// Parse planner output into a [`PatchSet`].
///
/// Leading prose or a markdown fence before the first file header is
/// discarded; a closing fence ends the diff.
pub fn parse_diff(text: &str) -> Result<PatchSet, DiffError> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|line| line.starts_with("diff --git ") || line.starts_with("--- "))
        .ok_or_else(|| ParseError {
            line: 1,
            message: "no file header ('--- a/<path>') found".to_string(),
        })?;

    let mut parser = Parser {
        lines: &lines,
        pos: start,
    };
    let files = parser.parse_files()?;
    if files.is_empty() {
        return Err(parser.error("diff contains no file sections").into());
    }
    Ok(PatchSet { files })
}

struct Parser<'a> {
    lines: &'a [&'a str],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.pos + 1,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    fn parse_files(&mut self) -> Result<Vec<FilePatch>, DiffError> {
        let mut files: Vec<FilePatch> = Vec::new();
        let mut seen = HashSet::new();

        while let Some(line) = self.peek() {
            if line.trim_start().starts_with("```") {
                break;
            }
            if line.trim().is_empty()
                || IGNORED_HEADER_PREFIXES
                    .iter()
                    .any(|prefix| line.starts_with(prefix))
            {
                self.pos += 1;
                continue;
            }
            if line.starts_with("rename from ")
                || line.starts_with("rename to ")
                || line.starts_with("copy from ")
                || line.starts_with("copy to ")
            {
                return Err(self.error("renames and copies are not supported").into());
            }
            if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
                return Err(self.error("binary patches are not supported").into());
            }
            if !line.starts_with("--- ") {
                return Err(self.error(format!("unexpected line outside a hunk: '{line}'")).into());
            }

            let file = self.parse_file()?;
            if !seen.insert(file.path.clone()) {
                return Err(self
                    .error(format!("file '{}' appears more than once", file.path))
                    .into());
            }
            files.push(file);
        }

        Ok(files)
    }

    fn parse_file(&mut self) -> Result<FilePatch, DiffError> {
        let header_line = self.pos;
        let old = header_path(self.lines[self.pos], "--- ");
        self.pos += 1;
        let new = match self.peek() {
            Some(line) if line.starts_with("+++ ") => header_path(line, "+++ "),
            _ => return Err(self.error("expected '+++ ' header after '--- '").into()),
        };
        self.pos += 1;

        let (path, change) = match (old, new) {
            (None, None) => {
                return Err(self.error("both sides of the file header are /dev/null").into());
            }
            (None, Some(new)) => (new, FileChange::Create),
            (Some(old), None) => (old, FileChange::Delete),
            (Some(old), Some(new)) if old != new => {
                return Err(self
                    .error(format!("renames are not supported ('{old}' -> '{new}')"))
                    .into());
            }
            (Some(_), Some(new)) => (new, FileChange::Modify),
        };
        let path = normalize_path(&path)?;
        if is_placeholder_path(&path) {
            return Err(ParseError {
                line: header_line + 1,
                message: format!("placeholder file path '{path}'"),
            }
            .into());
        }

        let mut hunks: Vec<Hunk> = Vec::new();
        while let Some(line) = self.peek() {
            if !line.starts_with("@@") {
                break;
            }
            let hunk = self.parse_hunk()?;
            if let Some(prev) = hunks.last()
                && hunk.old_start < prev.old_start + prev.old_len
            {
                return Err(self
                    .error(format!("hunks for '{path}' overlap or are out of order"))
                    .into());
            }
            hunks.push(hunk);
        }

        if hunks.is_empty() {
            return Err(self.error(format!("file '{path}' has no hunks")).into());
        }
        match change {
            FileChange::Create if hunks.len() != 1 || hunks[0].old_len != 0 => {
                return Err(self
                    .error(format!("new file '{path}' must be a single hunk from -0,0"))
                    .into());
            }
            FileChange::Delete if hunks.iter().any(|h| h.new_len != 0) => {
                return Err(self
                    .error(format!("deleted file '{path}' must not add lines"))
                    .into());
            }
            _ => {}
        }

        Ok(FilePatch {
            path,
            change,
            hunks,
        })
    }

    fn parse_hunk(&mut self) -> Result<Hunk, DiffError> {
        let header = self.lines[self.pos];
        let caps = HUNK_HEADER_RE.captures(header).ok_or_else(|| {
            if header.contains("...") {
                self.error("placeholder hunk header; real line numbers are required")
            } else {
                self.error(format!("invalid hunk header '{header}'"))
            }
        })?;
        let number = |idx: usize, default: usize| -> Result<usize, ParseError> {
            match caps.get(idx) {
                Some(m) => m
                    .as_str()
                    .parse()
                    .map_err(|_| self.error(format!("hunk number out of range in '{header}'"))),
                None => Ok(default),
            }
        };
        let old_start = number(1, 0)?;
        let old_len = number(2, 1)?;
        let new_start = number(3, 0)?;
        let new_len = number(4, 1)?;
        if old_len == 0 && new_len == 0 {
            return Err(self.error("zero-length hunk").into());
        }
        self.pos += 1;

        let mut hunk = Hunk {
            old_start,
            old_len,
            new_start,
            new_len,
            lines: Vec::new(),
            old_missing_newline: false,
            new_missing_newline: false,
        };
        let mut old_remaining = old_len;
        let mut new_remaining = new_len;

        while old_remaining > 0 || new_remaining > 0 {
            let Some(line) = self.peek() else {
                return Err(self.error("hunk ended before its declared line counts").into());
            };
            if line.starts_with('\\') {
                self.mark_missing_newline(&mut hunk);
                self.pos += 1;
                continue;
            }
            let (kind, text) = match line.chars().next() {
                Some(' ') => (' ', &line[1..]),
                Some('-') => ('-', &line[1..]),
                Some('+') => ('+', &line[1..]),
                // Blank context lines frequently lose their leading space.
                None => (' ', ""),
                Some(_) => {
                    return Err(self
                        .error(format!("unexpected line inside hunk: '{line}'"))
                        .into());
                }
            };
            match kind {
                '-' => {
                    old_remaining = old_remaining
                        .checked_sub(1)
                        .ok_or_else(|| self.error("more removed lines than declared"))?;
                    hunk.lines.push(HunkLine::Removed(text.to_string()));
                }
                '+' => {
                    new_remaining = new_remaining
                        .checked_sub(1)
                        .ok_or_else(|| self.error("more added lines than declared"))?;
                    hunk.lines.push(HunkLine::Added(text.to_string()));
                }
                _ => {
                    if old_remaining == 0 || new_remaining == 0 {
                        return Err(self.error("more context lines than declared").into());
                    }
                    old_remaining -= 1;
                    new_remaining -= 1;
                    hunk.lines.push(HunkLine::Context(text.to_string()));
                }
            }
            self.pos += 1;
        }

        if let Some(line) = self.peek()
            && line.starts_with('\\')
        {
            self.mark_missing_newline(&mut hunk);
            self.pos += 1;
        }

        if hunk.added() == 0 && hunk.removed() == 0 {
            return Err(self.error("hunk adds and removes nothing").into());
        }
        Ok(hunk)
    }

    fn mark_missing_newline(&self, hunk: &mut Hunk) {
        match hunk.lines.last() {
            Some(HunkLine::Removed(_)) => hunk.old_missing_newline = true,
            Some(HunkLine::Added(_)) => hunk.new_missing_newline = true,
            Some(HunkLine::Context(_)) => {
                hunk.old_missing_newline = true;
                hunk.new_missing_newline = true;
            }
            None => {}
        }
    }
}

/// Extract the path from a `--- `/`+++ ` header; `None` for `/dev/null`.
fn header_path(line: &str, prefix: &str) -> Option<String> {
    let raw = line[prefix.len()..].split('\t').next().unwrap_or("").trim();
    if raw == DEV_NULL {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

/// Normalize a repository-relative path, rejecting anything that could leave
/// the root or reach git metadata.
pub fn normalize_path(path: &str) -> Result<String, PathEscapeError> {
    let escape = |reason: &str| PathEscapeError {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Err(escape("empty path"));
    }
    if path.contains('\\') {
        return Err(escape("backslashes are not allowed"));
    }
    if path.contains('\0') {
        return Err(escape("NUL byte in path"));
    }
    if path.starts_with('/') || path.as_bytes().get(1) == Some(&b':') {
        return Err(escape("absolute paths are not allowed"));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(escape("parent directory traversal")),
            ".git" => return Err(escape("git metadata is off limits")),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(escape("path has no file component"));
    }
    Ok(segments.join("/"))
}

fn is_placeholder_path(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    let file_name = lowered.rsplit('/').next().unwrap_or(&lowered);
    lowered == "example"
        || file_name.contains("placeholder")
        || file_name.starts_with("dummy")
        || lowered.starts_with("path/to/")
}
