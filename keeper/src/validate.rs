//! Validation of the `.keeper/` layout, config and backlog.

use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::policy::compile_globs;
use crate::io::backlog::load_backlog;
use crate::io::config::load_config;
use crate::io::init::KeeperPaths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub milestones: usize,
    pub truth_checks: usize,
}

/// Validate `.keeper/` under `root`: layout, config, backlog invariants and
/// every milestone's target patterns.
pub fn validate_keeper(root: &Path) -> Result<ValidateOutcome> {
    let paths = KeeperPaths::new(root);

    ensure_dir(&paths.keeper_dir)?;
    ensure_file(&paths.config_path)?;
    ensure_file(&paths.backlog_path)?;
    ensure_gitignore(&paths.gitignore_path)?;

    let cfg = load_config(&paths.config_path).context("load config.toml")?;
    let milestones = load_backlog(&paths.backlog_path).context("load milestones.toml")?;
    for milestone in &milestones {
        compile_globs(&milestone.target_file_patterns)
            .with_context(|| format!("milestone '{}': target_file_patterns", milestone.id))?;
    }

    Ok(ValidateOutcome {
        milestones: milestones.len(),
        truth_checks: cfg.truth_checks.len(),
    })
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing directory {} (run `keeper init`)", path.display()));
    }
    if !path.is_dir() {
        return Err(anyhow!("expected directory {}", path.display()));
    }
    Ok(())
}

fn ensure_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing file {}", path.display()));
    }
    if !path.is_file() {
        return Err(anyhow!("expected file {}", path.display()));
    }
    Ok(())
}

fn ensure_gitignore(path: &Path) -> Result<()> {
    ensure_file(path)?;
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    for required in ["runs/", "state/"] {
        if !contents.lines().any(|line| line.trim() == required) {
            return Err(anyhow!("missing '{}' in {}", required, path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::io::init::{InitOptions, init_keeper};

    #[test]
    fn fresh_init_validates() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_keeper(temp.path(), &InitOptions { force: false }).expect("init");
        let outcome = validate_keeper(temp.path()).expect("validate");
        assert_eq!(
            outcome,
            ValidateOutcome {
                milestones: 0,
                truth_checks: 0
            }
        );
    }

    #[test]
    fn missing_layout_points_at_init() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_keeper(temp.path()).expect_err("missing");
        assert!(err.to_string().contains("keeper init"));
    }

    #[test]
    fn backlog_invariants_are_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_keeper(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(
            &paths.backlog_path,
            r#"
[[milestones]]
id = "a"
title = "A"
kind = "feature"
status = "in_progress"
acceptance_commands = ["true"]
created_at = "2026-10-01"

[[milestones]]
id = "a"
title = "B"
kind = "fix"
status = "in_progress"
acceptance_commands = ["true"]
created_at = "2026-10-01"
"#,
        )
        .expect("write backlog");

        let message = format!("{:#}", validate_keeper(temp.path()).expect_err("invalid"));
        assert!(message.contains("duplicate id 'a'"));
        assert!(message.contains("at most one milestone may be in_progress"));
    }

    #[test]
    fn bad_target_pattern_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_keeper(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(
            &paths.backlog_path,
            r#"
[[milestones]]
id = "globby"
title = "Globby"
kind = "feature"
status = "todo"
target_file_patterns = ["src/[unclosed"]
acceptance_commands = ["true"]
created_at = "2026-10-01"
"#,
        )
        .expect("write backlog");

        let message = format!("{:#}", validate_keeper(temp.path()).expect_err("invalid"));
        assert!(message.contains("milestone 'globby'"));
    }
}
