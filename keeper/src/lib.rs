//! Autonomous repository-maintenance agent.
//!
//! `keeper` either repairs failing truth checks on the default branch or
//! advances the next milestone in a backlog, and always delivers the result as
//! a pull request. Model output is treated as untrusted: diffs are parsed,
//! checked against a safety policy and applied all-or-nothing before any
//! acceptance command runs.
//!
//! - **[`core`]**: pure logic (diff model, hunk application, policy, milestone
//!   transitions, aggregation).
//! - **[`io`]**: side effects (git, subprocesses, backlog file, forge, planner).
//!
//! [`orchestrator`], [`summary`], [`select`] and [`validate`] back the CLI
//! commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod select;
pub mod summary;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
