//! TTL-bounded single-worker lock for a working tree.
//!
//! The lock file holds one line, `<pid> <rfc3339 acquisition time>`, and is
//! created with `create_new` so two racing loops have exactly one winner. A lock
//! whose holder is dead, or whose timestamp is older than the TTL, is stale and
//! gets reclaimed. The running loop refreshes the timestamp every iteration.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// Parsed contents of a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn render(&self) -> String {
        format!("{} {}\n", self.pid, self.acquired_at.to_rfc3339())
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let pid = parts.next()?.parse().ok()?;
        let acquired_at = DateTime::parse_from_rfc3339(parts.next()?)
            .ok()?
            .with_timezone(&Utc);
        Some(Self { pid, acquired_at })
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.acquired_at > ttl || !pid_alive(self.pid)
    }
}

/// Another live process holds the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeldError {
    pub path: PathBuf,
    pub holder: LockInfo,
}

impl fmt::Display for LockHeldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worktree lock {} held by pid {} since {}",
            self.path.display(),
            self.holder.pid,
            self.holder.acquired_at.to_rfc3339()
        )
    }
}

impl std::error::Error for LockHeldError {}

/// An acquired lock. Released on drop.
#[derive(Debug)]
pub struct WorktreeLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl WorktreeLock {
    /// Acquire the lock at `path`, reclaiming it if stale.
    ///
    /// A live holder yields a [`LockHeldError`] (recoverable with `downcast_ref`).
    pub fn acquire(path: &Path, ttl: Duration, now: DateTime<Utc>) -> Result<Self> {
        Self::acquire_as(path, std::process::id(), ttl, now)
    }

    fn acquire_as(path: &Path, pid: u32, ttl: Duration, now: DateTime<Utc>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let info = LockInfo {
            pid,
            acquired_at: now,
        };
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    file.write_all(info.render().as_bytes())
                        .with_context(|| format!("write lock {}", path.display()))?;
                    file.sync_all().context("sync lock file")?;
                    debug!(path = %path.display(), pid, "lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let existing = fs::read_to_string(path)
                        .ok()
                        .and_then(|text| LockInfo::parse(&text));
                    match existing {
                        Some(holder) if !holder.is_stale(now, ttl) => {
                            return Err(LockHeldError {
                                path: path.to_path_buf(),
                                holder,
                            }
                            .into());
                        }
                        Some(holder) => {
                            info!(pid = holder.pid, "reclaiming stale worktree lock");
                        }
                        None => warn!(path = %path.display(), "reclaiming unreadable lock file"),
                    }
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("remove stale lock {}", path.display()));
                        }
                    }
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
        Err(anyhow!(
            "failed to acquire lock {} after stale cleanup",
            path.display()
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the acquisition time so a live holder is never reclaimed by TTL.
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<()> {
        let current = fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| LockInfo::parse(&text));
        if current.is_none_or(|info| info.pid != self.pid) {
            bail!("worktree lock {} is no longer ours", self.path.display());
        }
        let info = LockInfo {
            pid: self.pid,
            acquired_at: now,
        };
        let tmp = self.path.with_extension("lock.tmp");
        fs::write(&tmp, info.render()).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} to {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    /// Remove the lock file if we still own it.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let owned = fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| LockInfo::parse(&text))
            .is_some_and(|info| info.pid == self.pid);
        if owned {
            fs::remove_file(&self.path)
                .with_context(|| format!("remove lock {}", self.path.display()))?;
            debug!(path = %self.path.display(), "lock released");
        }
        Ok(())
    }
}

impl Drop for WorktreeLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(err = %err, "failed to release worktree lock");
        }
    }
}

/// True if a process with `pid` exists.
///
/// Checks with signal 0. `EPERM` means the process exists under another user.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
