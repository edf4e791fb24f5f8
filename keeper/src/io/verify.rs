//! Acceptance-command verification.

use std::path::Path;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::types::{CommandReport, VerificationResult};
use crate::io::process::run_shell;

/// Runs acceptance commands against a working tree.
///
/// Implementations run every command in order with no short-circuit, and
/// report failures (including spawn errors and timeouts) as failed entries.
pub trait Verifier {
    fn verify(&self, commands: &[String], workdir: &Path) -> VerificationResult;
}

/// `sh -c` verifier with a per-command timeout and bounded output.
#[derive(Debug, Clone)]
pub struct ShellVerifier {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ShellVerifier {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
        }
    }
}

impl Verifier for ShellVerifier {
    #[instrument(skip_all, fields(commands = commands.len(), workdir = %workdir.display()))]
    fn verify(&self, commands: &[String], workdir: &Path) -> VerificationResult {
        let entries = commands
            .iter()
            .map(|command| self.run_one(command, workdir))
            .collect();
        let result = VerificationResult::from_entries(entries);
        info!(all_passed = result.all_passed, "verification finished");
        result
    }
}

impl ShellVerifier {
    fn run_one(&self, command: &str, workdir: &Path) -> CommandReport {
        match run_shell(command, workdir, self.timeout, self.output_limit_bytes) {
            Ok(output) => {
                let passed = output.success();
                if !passed {
                    warn!(command, exit_code = ?output.exit_code(), timed_out = output.timed_out, "command failed");
                }
                CommandReport {
                    command: command.to_string(),
                    exit_status: output.exit_code(),
                    passed,
                    timed_out: output.timed_out,
                    truncated: output.truncated(),
                    captured_output: output.combined(),
                }
            }
            Err(err) => {
                warn!(command, err = %format!("{err:#}"), "command could not be started");
                CommandReport {
                    command: command.to_string(),
                    exit_status: None,
                    passed: false,
                    timed_out: false,
                    truncated: false,
                    captured_output: format!("failed to run command: {err:#}"),
                }
            }
        }
    }
}
