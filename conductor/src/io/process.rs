//! Helpers for running child processes with timeouts and bounded output.
//!
//! Every collaborator adapter (git, gt, bd, the model CLI, validation) goes
//! through [`run_command_with_timeout`], so timeouts and output bounds are
//! enforced in one place.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Exit code reported for a command that was killed on timeout (as `timeout(1)` does).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

impl CommandOutput {
    /// Exit code, mapping timeouts to [`TIMEOUT_EXIT_CODE`] and signals to `-1`.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        self.status.code().unwrap_or(-1)
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).to_string();
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&stderr);
        }
        buf
    }
}

/// Run `cmd` to completion or until `timeout`, capturing bounded stdout/stderr.
///
/// The child leads its own process group so a timeout kills everything it
/// spawned; otherwise a grandchild holding the pipes would outlive the kill.
/// Stdin is fed and both pipes are drained on their own threads, so a child
/// that ignores its input cannot stall the timeout. At most
/// `output_limit_bytes` of each stream is kept.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .process_group(0);

    let mut child = cmd
        .spawn()
        .inspect_err(|err| error!(err = %err, "spawn failed"))
        .context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    let stdout = drain_on_thread(child.stdout.take(), "stdout", output_limit_bytes)?;
    let stderr = drain_on_thread(child.stderr.take(), "stderr", output_limit_bytes)?;
    let feeder = match stdin {
        Some(input) => {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(err) = pipe.write_all(&input) {
                    // A child that exits without reading its input closes the pipe early.
                    warn!(err = %err, "child stopped reading stdin");
                }
            }))
        }
        None => None,
    };

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing its process group"
            );
            kill_group(child.id());
            (child.wait().context("reap timed-out command")?, true)
        }
    };

    if let Some(feeder) = feeder
        && feeder.join().is_err()
    {
        warn!("stdin writer panicked");
    }
    let stdout = stdout.finish()?;
    let stderr = stderr.finish()?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
    })
}

fn kill_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(err = %err, pid, "could not kill process group"),
    }
}

/// Bytes kept from one pipe and the count dropped past the limit.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

impl Captured {
    fn drain(mut reader: impl Read, limit: usize) -> std::io::Result<Self> {
        let mut captured = Self::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => return Ok(captured),
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            let keep = n.min(limit.saturating_sub(captured.bytes.len()));
            captured.bytes.extend_from_slice(&chunk[..keep]);
            captured.dropped += n - keep;
        }
    }
}

struct PipeReader {
    name: &'static str,
    handle: JoinHandle<std::io::Result<Captured>>,
}

impl PipeReader {
    fn finish(self) -> Result<Captured> {
        self.handle
            .join()
            .map_err(|_| anyhow!("{} reader panicked", self.name))?
            .with_context(|| format!("read {}", self.name))
    }
}

fn drain_on_thread<R: Read + Send + 'static>(
    pipe: Option<R>,
    name: &'static str,
    limit: usize,
) -> Result<PipeReader> {
    let pipe = pipe.ok_or_else(|| anyhow!("{name} was not piped"))?;
    Ok(PipeReader {
        name,
        handle: thread::spawn(move || Captured::drain(pipe, limit)),
    })
}

/// Last `max_lines` lines of `text`, trimmed.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
