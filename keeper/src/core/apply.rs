//! Strict, anchored hunk application on in-memory file contents.
//!
//! Every hunk must match its anchor exactly: no fuzz and no offset search.
//! Callers stage the results and only write once every file applied. Files
//! with CRLF line endings are refused outright.

use thiserror::Error;

use crate::core::diff::{FileChange, FilePatch, Hunk};

/// A hunk did not match the current file contents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflict in '{path}' (hunk {hunk}): {message}")]
pub struct ConflictError {
    pub path: String,
    /// 1-based hunk index within the file section.
    pub hunk: usize,
    pub message: String,
}

/// Line view of a text file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Lines {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl Lines {
    fn split(text: &str) -> Self {
        if text.is_empty() {
            return Self {
                lines: Vec::new(),
                trailing_newline: true,
            };
        }
        let trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);
        Self {
            lines: body.split('\n').map(str::to_string).collect(),
            trailing_newline,
        }
    }

    fn join(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// Apply one file section to `original` (None when the file does not exist).
///
/// Returns the new contents, or `None` when the file is deleted.
pub fn apply_file(original: Option<&str>, patch: &FilePatch) -> Result<Option<String>, ConflictError> {
    let conflict = |hunk: usize, message: String| ConflictError {
        path: patch.path.clone(),
        hunk,
        message,
    };

    let source = match (patch.change, original) {
        (FileChange::Create, Some(_)) => {
            return Err(conflict(1, "file already exists".to_string()));
        }
        (FileChange::Create, None) => Lines::split(""),
        (_, None) => return Err(conflict(1, "file does not exist".to_string())),
        (_, Some(text)) if text.contains("\r\n") => {
            return Err(conflict(1, "CRLF line endings are not supported".to_string()));
        }
        (_, Some(text)) => Lines::split(text),
    };

    let mut output: Vec<String> = Vec::with_capacity(source.lines.len());
    let mut trailing_newline = source.trailing_newline;
    let mut cursor = 0usize;

    for (index, hunk) in patch.hunks.iter().enumerate() {
        let number = index + 1;
        let anchor = anchor_index(hunk).map_err(|message| conflict(number, message))?;
        if anchor < cursor {
            return Err(conflict(number, "hunk overlaps the previous hunk".to_string()));
        }
        let end = anchor + hunk.old_len;
        if end > source.lines.len() {
            return Err(conflict(
                number,
                format!(
                    "hunk expects lines {}..{} but file has {} lines",
                    anchor + 1,
                    end,
                    source.lines.len()
                ),
            ));
        }

        let expected = hunk.old_lines();
        if let Some(offset) = source.lines[anchor..end]
            .iter()
            .zip(&expected)
            .position(|(actual, expected)| actual != expected)
        {
            return Err(conflict(
                number,
                format!(
                    "line {} does not match: expected '{}', found '{}'",
                    anchor + offset + 1,
                    expected[offset],
                    source.lines[anchor + offset]
                ),
            ));
        }

        let reaches_eof = end == source.lines.len();
        if reaches_eof && hunk.old_len > 0 {
            if hunk.old_missing_newline == source.trailing_newline {
                return Err(conflict(
                    number,
                    "end-of-file newline does not match the file".to_string(),
                ));
            }
        } else if hunk.old_missing_newline {
            return Err(conflict(
                number,
                "'No newline at end of file' marker before end of file".to_string(),
            ));
        }
        if reaches_eof {
            trailing_newline = !hunk.new_missing_newline;
        } else if hunk.new_missing_newline {
            return Err(conflict(
                number,
                "'No newline at end of file' marker before end of file".to_string(),
            ));
        }

        output.extend(source.lines[cursor..anchor].iter().cloned());
        output.extend(hunk.new_lines().into_iter().map(str::to_string));
        cursor = end;
    }
    output.extend(source.lines[cursor..].iter().cloned());

    if patch.change == FileChange::Delete {
        if !output.is_empty() {
            return Err(conflict(
                patch.hunks.len(),
                format!("deletion leaves {} lines behind", output.len()),
            ));
        }
        return Ok(None);
    }

    Ok(Some(
        Lines {
            lines: output,
            trailing_newline,
        }
        .join(),
    ))
}

/// 0-based index of the first old line a hunk covers. Pure insertions
/// (`-n,0`) insert after line `n`.
fn anchor_index(hunk: &Hunk) -> Result<usize, String> {
    if hunk.old_len == 0 {
        return Ok(hunk.old_start);
    }
    hunk.old_start
        .checked_sub(1)
        .ok_or_else(|| "hunk starts at line 0 but removes or keeps lines".to_string())
}
