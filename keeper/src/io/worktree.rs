//! All-or-nothing application of an untrusted diff to a working tree.
//!
//! Pipeline: parse → resolve paths → stage every hunk in memory → policy →
//! write. A stale diff therefore reports its conflict ahead of any limit. Nothing touches the filesystem until every file has staged. If a
//! write fails midway, files already written are restored from their
//! snapshot and anything newly created is removed.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::apply::{ConflictError, apply_file};
use crate::core::diff::{DiffError, FilePatch, ParseError, PathEscapeError, parse_diff};
use crate::core::policy::{ChangeSet, Decision, PolicyContext, PolicyLimits, evaluate};

/// Why a diff could not be applied. The tree is unchanged in every case.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    /// Policy reason, verbatim.
    #[error("{0}")]
    PolicyDenied(String),
    #[error("failed to write patch (changes rolled back): {0:#}")]
    Io(anyhow::Error),
}

impl From<DiffError> for PatchError {
    fn from(err: DiffError) -> Self {
        match err {
            DiffError::Parse(e) => PatchError::Parse(e),
            DiffError::PathEscape(e) => PatchError::PathEscape(e),
        }
    }
}

/// Result of a successful application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChangeSet {
    /// Repository-relative paths, sorted.
    pub files_touched: Vec<String>,
    pub line_delta: usize,
}

struct StagedFile {
    relative: String,
    absolute: PathBuf,
    original: Option<Vec<u8>>,
    updated: Option<String>,
}

/// Parse `diff_text`, check it against `limits`, and apply it under `root`.
#[instrument(skip_all, fields(root = %root.display(), escalate = ctx.escalate))]
pub fn apply_patch(
    root: &Path,
    diff_text: &str,
    limits: &PolicyLimits,
    ctx: &PolicyContext<'_>,
) -> Result<AppliedChangeSet, PatchError> {
    let patch = parse_diff(diff_text)?;
    let root = root
        .canonicalize()
        .with_context(|| format!("resolve repository root {}", root.display()))
        .map_err(PatchError::Io)?;

    let mut resolved = Vec::with_capacity(patch.files.len());
    for file in &patch.files {
        resolved.push((file, resolve_inside(&root, &file.path)?));
    }

    let mut staged = Vec::with_capacity(resolved.len());
    for (file, absolute) in resolved {
        staged.push(stage_file(file, absolute)?);
    }

    let change = ChangeSet::from_patch(&patch);
    if let Decision::Denied(reason) = evaluate(limits, &change, ctx) {
        warn!(%reason, "policy denied patch");
        return Err(PatchError::PolicyDenied(reason));
    }

    write_staged(&staged).map_err(PatchError::Io)?;

    let applied = AppliedChangeSet {
        files_touched: change.files_touched.into_iter().collect(),
        line_delta: change.line_delta,
    };
    info!(
        files = applied.files_touched.len(),
        line_delta = applied.line_delta,
        "patch applied"
    );
    Ok(applied)
}

/// Join `relative` onto `root`, refusing anything that lands outside it,
/// including through symlinked directories.
fn resolve_inside(root: &Path, relative: &str) -> Result<PathBuf, PathEscapeError> {
    let escape = |reason: &str| PathEscapeError {
        path: relative.to_string(),
        reason: reason.to_string(),
    };
    let candidate = Path::new(relative);
    if candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(escape("path must be relative and normalized"));
    }
    let absolute = root.join(candidate);

    if let Ok(meta) = fs::symlink_metadata(&absolute)
        && meta.file_type().is_symlink()
    {
        return Err(escape("target is a symlink"));
    }

    let mut ancestor = absolute.parent();
    while let Some(dir) = ancestor {
        if dir.exists() {
            let canonical = dir
                .canonicalize()
                .map_err(|_| escape("parent directory cannot be resolved"))?;
            if !canonical.starts_with(root) {
                return Err(escape("parent directory resolves outside the repository"));
            }
            break;
        }
        ancestor = dir.parent();
    }
    Ok(absolute)
}

fn stage_file(file: &FilePatch, absolute: PathBuf) -> Result<StagedFile, PatchError> {
    let original = match fs::read(&absolute) {
        Ok(bytes) => Some(bytes),
        Err(_) if absolute.is_dir() => {
            return Err(ConflictError {
                path: file.path.clone(),
                hunk: 1,
                message: "target is a directory".to_string(),
            }
            .into());
        }
        Err(err) if err.kind() == ErrorKind::NotFound || !absolute.exists() => None,
        Err(err) => {
            return Err(PatchError::Io(
                anyhow!(err).context(format!("read {}", absolute.display())),
            ));
        }
    };

    let text = match &original {
        Some(bytes) => Some(String::from_utf8(bytes.clone()).map_err(|_| ConflictError {
            path: file.path.clone(),
            hunk: 1,
            message: "file is not valid UTF-8".to_string(),
        })?),
        None => None,
    };
    let updated = apply_file(text.as_deref(), file)?;
    debug!(path = %file.path, change = ?file.change, "staged file");

    Ok(StagedFile {
        relative: file.path.clone(),
        absolute,
        original,
        updated,
    })
}

fn write_staged(staged: &[StagedFile]) -> anyhow::Result<()> {
    let mut written: Vec<&StagedFile> = Vec::new();
    let mut created_dirs: Vec<PathBuf> = Vec::new();

    for file in staged {
        if let Err(err) = write_one(file, &mut created_dirs) {
            warn!(path = %file.relative, err = %format!("{err:#}"), "write failed, rolling back");
            rollback(&written, &created_dirs);
            return Err(err);
        }
        written.push(file);
    }
    Ok(())
}

fn write_one(file: &StagedFile, created_dirs: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    match &file.updated {
        Some(contents) => {
            if let Some(parent) = file.absolute.parent() {
                create_dirs_tracked(parent, created_dirs)?;
            }
            fs::write(&file.absolute, contents)
                .with_context(|| format!("write {}", file.absolute.display()))
        }
        None => fs::remove_file(&file.absolute)
            .with_context(|| format!("delete {}", file.absolute.display())),
    }
}

/// `create_dir_all` that records every directory it creates, outermost first.
fn create_dirs_tracked(dir: &Path, created: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path.exists() {
            break;
        }
        missing.push(path.to_path_buf());
        cursor = path.parent();
    }
    for path in missing.into_iter().rev() {
        fs::create_dir(&path).with_context(|| format!("create directory {}", path.display()))?;
        created.push(path);
    }
    Ok(())
}

fn rollback(written: &[&StagedFile], created_dirs: &[PathBuf]) {
    for file in written.iter().rev() {
        let restored = match &file.original {
            Some(bytes) => fs::write(&file.absolute, bytes),
            None => fs::remove_file(&file.absolute),
        };
        if let Err(err) = restored {
            warn!(path = %file.relative, %err, "rollback could not restore file");
        }
    }
    for dir in created_dirs.iter().rev() {
        if let Err(err) = fs::remove_dir(dir) {
            warn!(path = %dir.display(), %err, "rollback could not remove directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
        fn walk(dir: &Path, root: &Path, out: &mut BTreeMap<PathBuf, Option<Vec<u8>>>) {
            for entry in fs::read_dir(dir).expect("read dir") {
                let path = entry.expect("entry").path();
                let rel = path.strip_prefix(root).expect("prefix").to_path_buf();
                if path.is_dir() {
                    out.insert(rel, None);
                    walk(&path, root, out);
                } else {
                    out.insert(rel, Some(fs::read(&path).expect("read")));
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::write(dir.path().join("src/a.txt"), "one\ntwo\nthree\n").expect("write");
        fs::write(dir.path().join("src/b.txt"), "alpha\nbeta\n").expect("write");
        dir
    }

    fn apply(root: &Path, diff: &str) -> Result<AppliedChangeSet, PatchError> {
        apply_patch(root, diff, &PolicyLimits::default(), &PolicyContext::default())
    }

    #[test]
    fn applies_modify_create_delete() {
        let dir = setup();
        let diff = "\
--- a/src/a.txt
+++ b/src/a.txt
@@ -2,1 +2,1 @@
-two
+TWO
--- /dev/null
+++ b/docs/new/notes.md
@@ -0,0 +1,1 @@
+# notes
--- a/src/b.txt
+++ /dev/null
@@ -1,2 +0,0 @@
-alpha
-beta
";
        let applied = apply(dir.path(), diff).expect("apply");
        assert_eq!(
            applied.files_touched,
            vec!["docs/new/notes.md", "src/a.txt", "src/b.txt"]
        );
        assert_eq!(applied.line_delta, 5);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/a.txt")).expect("read"),
            "one\nTWO\nthree\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("docs/new/notes.md")).expect("read"),
            "# notes\n"
        );
        assert!(!dir.path().join("src/b.txt").exists());
    }

    #[test]
    fn conflict_in_later_file_leaves_tree_identical() {
        let dir = setup();
        let before = snapshot(dir.path());
        let diff = "\
--- a/src/a.txt
+++ b/src/a.txt
@@ -1,1 +1,1 @@
-one
+ONE
--- a/src/b.txt
+++ b/src/b.txt
@@ -2,1 +2,1 @@
-stale
+fresh
";
        let err = apply(dir.path(), diff).expect_err("stale anchor");
        assert!(matches!(err, PatchError::Conflict(_)));
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn policy_denial_has_no_side_effects() {
        let dir = setup();
        let before = snapshot(dir.path());
        let mut diff = String::new();
        for i in 0..5 {
            diff.push_str(&format!("--- /dev/null\n+++ b/gen/f{i}.txt\n@@ -0,0 +1 @@\n+x\n"));
        }
        let err = apply(dir.path(), &diff).expect_err("too many files");
        match err {
            PatchError::PolicyDenied(reason) => {
                assert_eq!(reason, "file count exceeds limit (5 > 3)")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn stale_diff_reports_conflict_before_size_limits() {
        let dir = setup();
        let before = snapshot(dir.path());
        let mut diff = String::from("--- a/src/a.txt\n+++ b/src/a.txt\n@@ -1,1 +1,1 @@\n-not what is there\n+ONE\n");
        for i in 0..4 {
            diff.push_str(&format!("--- /dev/null\n+++ b/gen/f{i}.txt\n@@ -0,0 +1 @@\n+x\n"));
        }
        let err = apply(dir.path(), &diff).expect_err("stale anchor");
        assert!(matches!(err, PatchError::Conflict(_)), "{err:?}");
        assert!(err.to_string().starts_with("conflict in 'src/a.txt'"), "{err}");
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn write_failure_rolls_back_earlier_files() {
        let dir = setup();
        fs::write(dir.path().join("blocker"), "i am a file\n").expect("write");
        let before = snapshot(dir.path());
        let diff = "\
--- a/src/a.txt
+++ b/src/a.txt
@@ -1,1 +1,1 @@
-one
+ONE
--- /dev/null
+++ b/fresh/dir/created.txt
@@ -0,0 +1 @@
+new
--- /dev/null
+++ b/blocker/inner.txt
@@ -0,0 +1 @@
+never written
";
        let err = apply(dir.path(), diff).expect_err("write failure");
        assert!(matches!(err, PatchError::Io(_)));
        assert_eq!(snapshot(dir.path()), before);
        assert!(!dir.path().join("fresh").exists());
    }

    #[test]
    fn rejects_symlinked_directory_escape() {
        let dir = setup();
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).expect("symlink");
        let diff = "--- /dev/null\n+++ b/link/pwned.txt\n@@ -0,0 +1 @@\n+x\n";
        let err = apply(dir.path(), diff).expect_err("escape");
        assert!(matches!(err, PatchError::PathEscape(_)));
        assert!(!outside.path().join("pwned.txt").exists());
    }

    #[test]
    fn rejects_symlink_target() {
        let dir = setup();
        std::os::unix::fs::symlink("src/a.txt", dir.path().join("alias.txt")).expect("symlink");
        let diff = "--- a/alias.txt\n+++ b/alias.txt\n@@ -1 +1 @@\n-one\n+ONE\n";
        let err = apply(dir.path(), diff).expect_err("symlink target");
        assert!(matches!(err, PatchError::PathEscape(_)));
    }

    #[test]
    fn parse_errors_surface_as_parse_variant() {
        let dir = setup();
        let err = apply(dir.path(), "no diff here").expect_err("parse");
        assert!(matches!(err, PatchError::Parse(_)));
    }
}
