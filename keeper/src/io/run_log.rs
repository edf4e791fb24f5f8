//! Run log (`.keeper/runs/<date>.jsonl`) and small run-state files.
//!
//! The run log is append-only; each record is one JSON line written under an
//! exclusive lock so concurrent runs never interleave partial lines.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, info, instrument};

use crate::core::types::{RunRecord, VerificationResult};
use crate::io::atomic::write_atomic;
use crate::io::init::KeeperPaths;
use crate::io::lock::FileLock;

const LOCK_WAIT: Duration = Duration::from_secs(10);

/// Append `record` to the run log for `record.date`.
#[instrument(skip_all, fields(run_id = %record.run_id, outcome = %record.outcome))]
pub fn append_record(paths: &KeeperPaths, record: &RunRecord) -> Result<()> {
    let mut line = serde_json::to_string(record).context("serialize run record")?;
    line.push('\n');
    let path = paths.run_log_path(record.date);

    let _lock = FileLock::acquire(&paths.run_log_lock_path, LOCK_WAIT)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create run log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open run log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append run log {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync run log {}", path.display()))?;
    debug!(path = %path.display(), "run record appended");
    Ok(())
}

/// Records for `date` in append order. A missing log means no runs.
pub fn load_day(paths: &KeeperPaths, date: NaiveDate) -> Result<Vec<RunRecord>> {
    let path = paths.run_log_path(date);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read run log {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

/// Persist the latest default-branch truth-check result.
pub fn save_default_verification(paths: &KeeperPaths, result: &VerificationResult) -> Result<()> {
    let json =
        serde_json::to_string_pretty(result).context("serialize default branch verification")?;
    write_atomic(&paths.default_verification_path, json.as_bytes())
}

/// Latest default-branch truth-check result, if one was ever recorded.
pub fn load_default_verification(paths: &KeeperPaths) -> Result<Option<VerificationResult>> {
    let path = &paths.default_verification_path;
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let result = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(result))
}

/// Stop further runs on `date`. The file body records why.
pub fn set_halt(paths: &KeeperPaths, date: NaiveDate, reason: &str) -> Result<()> {
    let path = paths.halt_flag_path(date);
    write_atomic(&path, format!("{}\n", reason.trim()).as_bytes())?;
    info!(path = %path.display(), "halt flag set");
    Ok(())
}

pub fn is_halted(paths: &KeeperPaths, date: NaiveDate) -> bool {
    paths.halt_flag_path(date).exists()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::core::types::{RunMode, RunOutcome};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).expect("date")
    }

    fn record(run_id: &str, outcome: RunOutcome) -> RunRecord {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 6, 0, 0).single().expect("time");
        RunRecord {
            run_id: run_id.to_string(),
            date: date(),
            mode: Some(RunMode::Milestone),
            milestone_id: Some("m1".to_string()),
            outcome,
            pr_url: None,
            branch: None,
            reason: None,
            verification_result: None,
            started_at: at,
            finished_at: at,
        }
    }

    #[test]
    fn appends_and_loads_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = KeeperPaths::new(temp.path());
        assert!(load_day(&paths, date()).expect("empty").is_empty());

        append_record(&paths, &record("run-1", RunOutcome::NoOp)).expect("append");
        append_record(&paths, &record("run-2", RunOutcome::Blocked)).expect("append");

        let records = load_day(&paths, date()).expect("load");
        let ids: Vec<_> = records.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-1", "run-2"]);
        assert_eq!(records[1].outcome, RunOutcome::Blocked);
    }

    #[test]
    fn concurrent_appends_produce_whole_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = Arc::new(KeeperPaths::new(temp.path()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let paths = Arc::clone(&paths);
                thread::spawn(move || {
                    append_record(&paths, &record(&format!("run-{i}"), RunOutcome::NoOp))
                        .expect("append");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(load_day(&paths, date()).expect("load").len(), 8);
    }

    #[test]
    fn malformed_line_reports_position() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = KeeperPaths::new(temp.path());
        append_record(&paths, &record("run-1", RunOutcome::NoOp)).expect("append");
        let path = paths.run_log_path(date());
        let mut contents = fs::read_to_string(&path).expect("read");
        contents.push_str("{not json\n");
        fs::write(&path, contents).expect("write");

        let err = load_day(&paths, date()).expect_err("malformed");
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn default_verification_round_trips_and_halt_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = KeeperPaths::new(temp.path());
        assert!(load_default_verification(&paths).expect("load").is_none());
        let result = VerificationResult::from_entries(Vec::new());
        save_default_verification(&paths, &result).expect("save");
        assert_eq!(load_default_verification(&paths).expect("load"), Some(result));

        assert!(!is_halted(&paths, date()));
        set_halt(&paths, date(), "milestone m1 requested a stop").expect("halt");
        assert!(is_halted(&paths, date()));
        assert!(!is_halted(&paths, date().succ_opt().expect("next day")));
    }
}
