//! `keeper summary`: recompute a day's summary from the run log.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::info;

use crate::core::aggregate::{DailySummary, aggregate, render_markdown};
use crate::io::backlog::load_backlog;
use crate::io::forge::Forge;
use crate::io::init::KeeperPaths;
use crate::io::run_log::{load_day, load_default_verification};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSummary {
    pub summary: DailySummary,
    pub markdown: String,
}

/// Fold the run log for `date`, the current backlog and the latest
/// default-branch verification into a summary.
pub fn build_summary(root: &Path, date: NaiveDate) -> Result<RenderedSummary> {
    let paths = KeeperPaths::new(root);
    let records = load_day(&paths, date)?;
    let milestones = load_backlog(&paths.backlog_path)?;
    let latest = load_default_verification(&paths)?;
    let summary = aggregate(date, &records, &milestones, latest.as_ref());
    let markdown = render_markdown(&summary).context("render daily summary")?;
    Ok(RenderedSummary { summary, markdown })
}

/// Update or create the summary issue. Returns its URL.
pub fn publish_summary(forge: &dyn Forge, rendered: &RenderedSummary) -> Result<String> {
    let url = forge
        .upsert_issue(&rendered.summary.title, &rendered.markdown)
        .context("publish daily summary")?;
    info!(url = %url, "daily summary published");
    Ok(url)
}
