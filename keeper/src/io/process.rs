//! Child process execution with timeouts and bounded output capture.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped from stdout past the output limit.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, or `None` if the process was killed or ended by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        if self.timed_out {
            None
        } else {
            self.status.code()
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated > 0 || self.stderr_truncated > 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, each with a truncation marker when cut.
    pub fn combined(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            out.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if !self.stderr.is_empty() || self.stderr_truncated > 0 {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("--- stderr ---\n");
            out.push_str(&String::from_utf8_lossy(&self.stderr));
            if self.stderr_truncated > 0 {
                out.push_str(&format!(
                    "\n[stderr truncated {} bytes]\n",
                    self.stderr_truncated
                ));
            }
        }
        if self.timed_out {
            out.push_str("\n[command timed out]\n");
        }
        out
    }
}

/// Run `command` through `sh -c` in `cwd`.
pub fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(cwd);
    run_command_with_timeout(cmd, None, timeout, output_limit_bytes)
        .with_context(|| format!("run shell command `{command}`"))
}

/// How long readers may keep draining after the child is gone. Descendants that
/// escaped the process group can hold the pipes open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

type ReadResult = Result<(Vec<u8>, usize)>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr kept in memory; the rest is drained and counted. The child leads its own
/// process group; on timeout the whole group is killed and the result is reported with
/// `timed_out = true` rather than as an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // Broken pipe means the child exited early; its status reports that.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "failed to write child stdin");
        }
    }

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;
    let drain_deadline = Instant::now() + OUTPUT_DRAIN_GRACE;
    let (stdout, stdout_truncated) = collect_output(&stdout_rx, drain_deadline, "stdout")?;
    let (stderr, stderr_truncated) = collect_output(&stderr_rx, drain_deadline, "stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Ok((status, false)),
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            kill_process_group(child);
            if let Err(e) = child.kill() {
                debug!(err = %e, "child already gone after group kill");
            }
            let status = child.wait().context("wait command after kill")?;
            Ok((status, true))
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        warn!(pid = child.id(), "pid out of range, cannot signal its group");
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created by `process_group(0)` at spawn
    // and is led by a child we have not yet reaped, so the id cannot have been reused.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        warn!(
            pgid,
            err = %std::io::Error::last_os_error(),
            "failed to kill process group"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> mpsc::Receiver<ReadResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone only if the caller stopped waiting.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// Wait for a reader until `deadline`. A reader still blocked by then is abandoned
/// and its stream reported as empty.
fn collect_output(
    rx: &mpsc::Receiver<ReadResult>,
    deadline: Instant,
    stream: &str,
) -> Result<(Vec<u8>, usize)> {
    let wait = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(wait) {
        Ok(result) => result.with_context(|| format!("read {stream}")),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(stream, "output still open after the command ended, abandoning reader");
            Ok((Vec::new(), 0))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(anyhow!("{stream} reader thread panicked"))
        }
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_exit_code_and_both_streams() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run_shell(
            "echo out; echo err >&2; exit 3",
            dir.path(),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert_eq!(out.exit_code(), Some(3));
        assert!(!out.success());
        let combined = out.combined();
        assert!(combined.starts_with("out\n"));
        assert!(combined.contains("--- stderr ---\nerr"));
    }

    #[test]
    fn truncates_output_with_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run_shell(
            "printf '%0200d' 0",
            dir.path(),
            Duration::from_secs(10),
            50,
        )
        .expect("run");
        assert_eq!(out.stdout.len(), 50);
        assert_eq!(out.stdout_truncated, 150);
        assert!(out.combined().contains("[stdout truncated 150 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run_shell("sleep 5", dir.path(), Duration::from_millis(200), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code(), None);
        assert!(out.combined().contains("[command timed out]"));
    }

    #[test]
    fn timeout_kills_commands_started_by_the_shell() {
        let dir = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let out = run_shell(
            "sleep 6; echo done",
            dir.path(),
            Duration::from_millis(300),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "took {:?}",
            started.elapsed()
        );
        assert!(!out.stdout_lossy().contains("done"));
    }

    #[test]
    fn background_descendant_holding_pipes_does_not_block_return() {
        let dir = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let out = run_shell(
            "(sleep 8 &) ; echo ready",
            dir.path(),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.exit_code(), Some(0));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn feeds_stdin() {
        let mut cmd = Command::new("cat");
        cmd.current_dir(std::env::temp_dir());
        let out = run_command_with_timeout(cmd, Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run");
        assert_eq!(out.stdout_lossy(), "hello");
    }
}
