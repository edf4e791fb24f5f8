//! Persisted milestone backlog (`.keeper/milestones.toml`).
//!
//! The store is the only shared mutable state between concurrent runs. All
//! writes go through [`MilestoneStore::transition`], which is compare-and-swap
//! on the stored status and serialised by an exclusive file lock. A
//! transition edits only the agent-owned keys of one milestone in place, so
//! comments, layout and keys keeper does not model survive.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use toml_edit::{DocumentMut, Item, TableLike, Value};
use tracing::{debug, info, instrument};

use crate::core::invariants::validate_backlog;
use crate::core::selector::{self, TransitionEffect, TransitionError};
use crate::core::types::{Milestone, MilestoneStatus};
use crate::io::atomic::write_atomic;
use crate::io::lock::FileLock;

const LOCK_WAIT: Duration = Duration::from_secs(10);

/// Backlog access used by the orchestrator.
///
/// Write-back is limited to `transition`; milestones are created and removed
/// by editing the backlog file.
pub trait MilestoneStore {
    /// All milestones in stored order.
    fn list(&self) -> Result<Vec<Milestone>>;

    /// First `todo` milestone in stored order.
    fn next_actionable(&self) -> Result<Option<Milestone>> {
        Ok(selector::next_actionable(&self.list()?).cloned())
    }

    /// Compare-and-swap status change. See [`selector::apply_transition`].
    fn transition(
        &self,
        id: &str,
        from: MilestoneStatus,
        to: MilestoneStatus,
        reason: Option<&str>,
    ) -> Result<TransitionEffect, TransitionError>;
}

/// On-disk shape of the backlog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BacklogFile {
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

/// Parse the backlog without checking invariants. Missing file → empty.
pub fn read_backlog(path: &Path) -> Result<Vec<Milestone>> {
    parse_backlog(path, &read_backlog_text(path)?)
}

fn read_backlog_text(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn parse_backlog(path: &Path, contents: &str) -> Result<Vec<Milestone>> {
    let file: BacklogFile =
        toml::from_str(contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(file.milestones)
}

/// Parse the backlog and enforce [`validate_backlog`].
pub fn load_backlog(path: &Path) -> Result<Vec<Milestone>> {
    check_backlog(path, read_backlog(path)?)
}

fn check_backlog(path: &Path, milestones: Vec<Milestone>) -> Result<Vec<Milestone>> {
    let errors = validate_backlog(&milestones);
    if !errors.is_empty() {
        return Err(anyhow!(
            "invalid backlog {}:\n- {}",
            path.display(),
            errors.join("\n- ")
        ));
    }
    Ok(milestones)
}

/// Atomically write a whole backlog. Used for scaffolding; runs only ever
/// patch status fields through [`MilestoneStore::transition`].
pub fn write_backlog(path: &Path, milestones: &[Milestone]) -> Result<()> {
    let file = BacklogFile {
        milestones: milestones.to_vec(),
    };
    let mut buf = toml::to_string_pretty(&file).context("serialize backlog toml")?;
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    write_atomic(path, buf.as_bytes())
}

/// Rewrite the agent-owned keys (`status`, `reason`, `started_at`,
/// `completed_at`) of `updated` inside `text`. Everything else is kept verbatim.
fn patch_status_fields(text: &str, updated: &Milestone) -> Result<String> {
    let mut doc: DocumentMut = text.parse().context("parse backlog toml for editing")?;
    let entry = milestone_entry(&mut doc, &updated.id)
        .ok_or_else(|| anyhow!("milestone '{}' not found in backlog document", updated.id))?;
    entry.insert("status", toml_edit::value(updated.status.as_str()));
    set_optional(entry, "reason", updated.reason.clone());
    set_optional(entry, "started_at", updated.started_at.map(format_timestamp));
    set_optional(entry, "completed_at", updated.completed_at.map(format_timestamp));
    Ok(doc.to_string())
}

/// The `[[milestones]]` table (or inline table) whose `id` is `id`.
fn milestone_entry<'a>(doc: &'a mut DocumentMut, id: &str) -> Option<&'a mut dyn TableLike> {
    let item = doc.get_mut("milestones")?;
    if item.is_array_of_tables() {
        item.as_array_of_tables_mut()?
            .iter_mut()
            .find(|table| table.get("id").and_then(Item::as_str) == Some(id))
            .map(|table| table as &mut dyn TableLike)
    } else {
        item.as_array_mut()?
            .iter_mut()
            .filter_map(Value::as_inline_table_mut)
            .find(|table| table.get("id").and_then(Value::as_str) == Some(id))
            .map(|table| table as &mut dyn TableLike)
    }
}

fn set_optional(entry: &mut dyn TableLike, key: &str, value: Option<String>) {
    match value {
        Some(value) => {
            entry.insert(key, toml_edit::value(value));
        }
        None => {
            entry.remove(key);
        }
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// File-backed store with an exclusive lock around read-modify-write.
#[derive(Debug, Clone)]
pub struct FileBacklog {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileBacklog {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MilestoneStore for FileBacklog {
    fn list(&self) -> Result<Vec<Milestone>> {
        load_backlog(&self.path)
    }

    #[instrument(skip_all, fields(id = %id, from = %from, to = %to))]
    fn transition(
        &self,
        id: &str,
        from: MilestoneStatus,
        to: MilestoneStatus,
        reason: Option<&str>,
    ) -> Result<TransitionEffect, TransitionError> {
        let _lock = FileLock::acquire(&self.lock_path, LOCK_WAIT)?;
        let text = read_backlog_text(&self.path)?;
        let mut milestones = check_backlog(&self.path, parse_backlog(&self.path, &text)?)?;
        let effect = selector::apply_transition(&mut milestones, id, from, to, reason, Utc::now())?;
        match effect {
            TransitionEffect::Applied => {
                let updated = milestones
                    .iter()
                    .find(|m| m.id == id)
                    .ok_or_else(|| anyhow!("milestone '{id}' vanished during transition"))?;
                let patched = patch_status_fields(&text, updated)?;
                write_atomic(&self.path, patched.as_bytes())?;
                info!(id, from = %from, to = %to, "milestone transitioned");
            }
            TransitionEffect::Unchanged => debug!(id, "same-state transition replay"),
        }
        Ok(effect)
    }
}

/// In-memory store with the same semantics as [`FileBacklog`].
#[derive(Debug, Default)]
pub struct MemoryBacklog {
    milestones: Mutex<Vec<Milestone>>,
}

impl MemoryBacklog {
    pub fn new(milestones: Vec<Milestone>) -> Self {
        Self {
            milestones: Mutex::new(milestones),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Vec<Milestone>>> {
        self.milestones
            .lock()
            .map_err(|_| anyhow!("backlog mutex poisoned"))
    }
}

impl MilestoneStore for MemoryBacklog {
    fn list(&self) -> Result<Vec<Milestone>> {
        Ok(self.guard()?.clone())
    }

    fn transition(
        &self,
        id: &str,
        from: MilestoneStatus,
        to: MilestoneStatus,
        reason: Option<&str>,
    ) -> Result<TransitionEffect, TransitionError> {
        let mut milestones = self.guard()?;
        selector::apply_transition(&mut milestones, id, from, to, reason, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::test_support::{milestone, milestone_with_status};

    fn file_store(dir: &Path, milestones: &[Milestone]) -> FileBacklog {
        let path = dir.join("milestones.toml");
        write_backlog(&path, milestones).expect("write backlog");
        FileBacklog::new(path, dir.join("state/backlog.lock"))
    }

    #[test]
    fn missing_file_is_empty_backlog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileBacklog::new(temp.path().join("nope.toml"), temp.path().join("lock"));
        assert!(store.list().expect("list").is_empty());
        assert!(store.next_actionable().expect("next").is_none());
    }

    #[test]
    fn parses_hand_written_backlog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("milestones.toml");
        std::fs::write(
            &path,
            r#"
[[milestones]]
id = "m1"
title = "Add retry to fetch"
kind = "feature"
status = "todo"
description = "Wrap fetch in a bounded retry."
target_file_patterns = ["src/fetch/*.rs"]
acceptance_commands = ["cargo test fetch"]
created_at = "2026-10-01"

[[milestones]]
id = "m2"
title = "Fix flaky test"
kind = "fix"
status = "blocked"
acceptance_commands = ["cargo test"]
stop_after_completion = true
created_at = "2026-10-02"
reason = "verification failed"
"#,
        )
        .expect("write");
        let milestones = load_backlog(&path).expect("load");
        assert_eq!(milestones.len(), 2);
        assert_eq!(milestones[0].target_file_patterns, vec!["src/fetch/*.rs"]);
        assert!(milestones[1].stop_after_completion);
        assert_eq!(milestones[1].reason.as_deref(), Some("verification failed"));
    }

    #[test]
    fn load_rejects_invariant_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("milestones.toml");
        write_backlog(&path, &[milestone("a"), milestone("a")]).expect("write");
        let err = load_backlog(&path).expect_err("duplicate ids");
        assert!(format!("{err:#}").contains("duplicate id 'a'"));
    }

    #[test]
    fn file_transition_persists_and_is_cas() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = file_store(temp.path(), &[milestone("a"), milestone("b")]);

        let effect = store
            .transition("a", MilestoneStatus::Todo, MilestoneStatus::InProgress, None)
            .expect("claim");
        assert_eq!(effect, TransitionEffect::Applied);
        assert_eq!(
            store.next_actionable().expect("next").map(|m| m.id),
            Some("b".to_string())
        );

        store
            .transition(
                "a",
                MilestoneStatus::InProgress,
                MilestoneStatus::Blocked,
                Some("conflict in 'src/lib.rs'"),
            )
            .expect("block");
        let err = store
            .transition("a", MilestoneStatus::InProgress, MilestoneStatus::Done, None)
            .expect_err("stale from");
        assert!(err.is_conflict());

        let reloaded = load_backlog(store.path()).expect("reload");
        assert_eq!(reloaded[0].status, MilestoneStatus::Blocked);
        assert_eq!(reloaded[0].reason.as_deref(), Some("conflict in 'src/lib.rs'"));
        assert!(reloaded[0].started_at.is_some());
        assert_eq!(reloaded[1].status, MilestoneStatus::Todo);
    }

    #[test]
    fn transition_keeps_comments_and_unmodelled_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("milestones.toml");
        let original = r#"# Q4 roadmap
[[milestones]]
id = "m1"
title = "Add retry to fetch"
kind = "feature"
status = "todo"   # flipped by the agent
owner = "alice"
acceptance_commands = ["cargo test fetch"]
created_at = "2026-10-01"
spec = { scope_out = ["rewrite the client"] }

# parked until the API settles
[[milestones]]
id = "m2"
title = "Fix flaky test"
kind = "fix"
status = "blocked"
acceptance_commands = ["cargo test"]
created_at = "2026-10-02"
reason = "verification failed"
"#;
        std::fs::write(&path, original).expect("write");
        let store = FileBacklog::new(&path, temp.path().join("state/backlog.lock"));

        store
            .transition("m1", MilestoneStatus::Todo, MilestoneStatus::InProgress, None)
            .expect("claim");
        store
            .transition("m1", MilestoneStatus::InProgress, MilestoneStatus::Blocked, Some("red"))
            .expect("block");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("# Q4 roadmap\n"), "{text}");
        assert!(text.contains("owner = \"alice\""), "{text}");
        assert!(text.contains("spec = { scope_out = [\"rewrite the client\"] }"), "{text}");
        assert!(text.contains("# parked until the API settles"), "{text}");
        assert!(!text.contains("stop_after_completion"), "{text}");
        assert!(text.contains("status = \"blocked\""), "{text}");
        assert!(text.contains("reason = \"red\""), "{text}");
        assert!(text.contains("reason = \"verification failed\""), "{text}");

        let reloaded = load_backlog(&path).expect("reload");
        assert_eq!(reloaded[0].status, MilestoneStatus::Blocked);
        assert_eq!(reloaded[0].reason.as_deref(), Some("red"));
        assert!(reloaded[0].started_at.is_some());
        assert_eq!(reloaded[1].status, MilestoneStatus::Blocked);
    }

    #[test]
    fn transition_edits_inline_milestone_arrays() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("milestones.toml");
        std::fs::write(
            &path,
            "milestones = [\n  { id = \"a\", title = \"A\", kind = \"fix\", status = \"todo\", acceptance_commands = [\"true\"], created_at = \"2026-10-01\" },\n]\n",
        )
        .expect("write");
        let store = FileBacklog::new(&path, temp.path().join("lock"));

        store
            .transition("a", MilestoneStatus::Todo, MilestoneStatus::InProgress, None)
            .expect("claim");

        let reloaded = load_backlog(&path).expect("reload");
        assert_eq!(reloaded[0].status, MilestoneStatus::InProgress);
        assert!(reloaded[0].started_at.is_some());
    }

    #[test]
    fn concurrent_identical_transitions_have_one_winner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(file_store(
            temp.path(),
            &[milestone_with_status("a", MilestoneStatus::InProgress)],
        ));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.transition("a", MilestoneStatus::InProgress, MilestoneStatus::Done, None)
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_conflict()))
            .count();
        assert_eq!((ok, conflicts), (1, 1));
        assert_eq!(store.list().expect("list")[0].status, MilestoneStatus::Done);
    }

    #[test]
    fn concurrent_claims_of_different_milestones_keep_single_in_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(file_store(temp.path(), &[milestone("a"), milestone("b")]));

        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.transition(id, MilestoneStatus::Todo, MilestoneStatus::InProgress, None)
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(wins, 1);

        let in_progress = store
            .list()
            .expect("list")
            .iter()
            .filter(|m| m.status == MilestoneStatus::InProgress)
            .count();
        assert_eq!(in_progress, 1);
    }

    #[test]
    fn memory_store_matches_file_semantics() {
        let store = MemoryBacklog::new(vec![milestone("a")]);
        store
            .transition("a", MilestoneStatus::Todo, MilestoneStatus::InProgress, None)
            .expect("claim");
        assert_eq!(
            store
                .transition("a", MilestoneStatus::InProgress, MilestoneStatus::InProgress, None)
                .expect("replay"),
            TransitionEffect::Unchanged
        );
        store
            .transition("a", MilestoneStatus::InProgress, MilestoneStatus::Done, None)
            .expect("done");
        assert!(
            store
                .transition("a", MilestoneStatus::InProgress, MilestoneStatus::Done, None)
                .is_err()
        );
    }
}
