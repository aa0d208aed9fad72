//! Supervision of auxiliary background processes (the preview server).
//!
//! The process is started in its own process group so everything it spawns can
//! be stopped together. Stopping escalates: SIGTERM to the leader, SIGTERM to
//! the group, then SIGKILL to the group, with a short grace period between.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct BackgroundProcess {
    child: Child,
    label: String,
    grace: Duration,
    stopped: bool,
}

impl BackgroundProcess {
    /// Spawn `command` via `sh -c` in a fresh process group.
    pub fn spawn(label: &str, command: &str, workdir: &Path, grace: Duration) -> Result<Self> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .with_context(|| format!("spawn {label}"))?;
        info!(label, pid = child.id(), "background process started");
        Ok(Self {
            child,
            label: label.to_string(),
            grace,
            stopped: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Stop the process group with the graduated kill sequence.
    pub fn stop(mut self) -> Result<()> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let Ok(raw) = i32::try_from(self.child.id()) else {
            self.child.kill().context("kill background process")?;
            self.child.wait().context("reap background process")?;
            return Ok(());
        };
        let pid = Pid::from_raw(raw);

        let steps = [
            ("terminate", Target::Leader(pid), Signal::SIGTERM),
            ("terminate group", Target::Group(pid), Signal::SIGTERM),
            ("kill group", Target::Group(pid), Signal::SIGKILL),
        ];
        for (step, target, signal) in steps {
            if self.child.try_wait().context("poll background process")?.is_some() {
                break;
            }
            debug!(label = %self.label, step, "stopping background process");
            target.send(signal);
            if self
                .child
                .wait_timeout(self.grace)
                .context("wait background process")?
                .is_some()
            {
                // The leader is gone; make sure nothing it spawned lingers.
                Target::Group(pid).send(Signal::SIGKILL);
                info!(label = %self.label, step, "background process stopped");
                return Ok(());
            }
        }
        if self.child.try_wait().context("poll background process")?.is_none() {
            warn!(label = %self.label, "background process survived group kill, killing leader");
            self.child.kill().context("kill background process")?;
            self.child.wait().context("reap background process")?;
        }
        Ok(())
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if let Err(err) = self.stop_inner() {
            warn!(label = %self.label, err = %err, "failed to stop background process");
        }
    }
}

#[derive(Clone, Copy)]
enum Target {
    Leader(Pid),
    Group(Pid),
}

impl Target {
    fn send(self, signal: Signal) {
        let result = match self {
            Self::Leader(pid) => kill(pid, signal),
            Self::Group(pid) => killpg(pid, signal),
        };
        match result {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(
                err = %err,
                signal = signal.as_str(),
                "failed to signal background process"
            ),
        }
    }
}
