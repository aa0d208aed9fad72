//! Version-control adapter.
//!
//! [`Vcs`] is the narrow set of git operations the orchestrator needs. The
//! [`Git`] implementation shells out to `git` in the working tree; callers see
//! typed results only.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// A branch found by a namespace scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    /// Short name without `refs/heads/` or `refs/remotes/<remote>/`.
    pub name: String,
    /// Present under `refs/heads`.
    pub local: bool,
    /// Present under `refs/remotes/<remote>`.
    pub remote: bool,
    /// Committer time of the tip, seconds since the epoch.
    pub commit_time: i64,
}

pub trait Vcs {
    /// Current branch name; errors on detached HEAD.
    fn current_branch(&self) -> Result<String>;
    /// True when tracked or untracked changes are present.
    fn is_dirty(&self) -> Result<bool>;
    /// Local and remote branches under `prefix`, newest tip first, deduplicated by name.
    fn list_branches(&self, prefix: &str) -> Result<Vec<BranchRef>>;
    fn branch_exists(&self, branch: &str) -> Result<bool>;
    fn remote_branch_exists(&self, branch: &str) -> Result<bool>;
    /// Stash everything including untracked files. Returns false when there was nothing to stash.
    fn stash(&self, message: &str) -> Result<bool>;
    fn fetch(&self, branch: Option<&str>) -> Result<()>;
    fn checkout(&self, branch: &str) -> Result<()>;
    /// Create or reset `local` to the remote tip of `upstream` and check it out.
    fn checkout_tracking(&self, local: &str, upstream: &str) -> Result<()>;
    fn pull_rebase(&self, branch: &str) -> Result<()>;
    fn abort_rebase(&self) -> Result<()>;
    /// Commits on HEAD not reachable from `base` (a ref or `origin/<branch>`).
    fn commits_ahead(&self, base: &str) -> Result<u32>;
    /// True when HEAD's tree differs from `base`'s.
    fn has_diff(&self, base: &str) -> Result<bool>;
    fn add_all(&self) -> Result<()>;
    /// Diff of the index against HEAD.
    fn staged_diff(&self) -> Result<String>;
    fn commit_empty(&self, message: &str) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
///
/// Every call is bounded by `timeout`; a stalled fetch or pull surfaces as a
/// failed command instead of hanging the iteration.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    remote: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl Git {
    pub fn new(
        workdir: impl Into<PathBuf>,
        remote: impl Into<String>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            remote: remote.into(),
            timeout,
            output_limit_bytes,
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    fn remote_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{branch}", self.remote)
    }

    fn ref_exists(&self, full_ref: &str) -> Result<bool> {
        let output = self.run(&["show-ref", "--verify", "--quiet", full_ref])?;
        if output.timed_out {
            return Err(self.failure(&["show-ref", full_ref], &output));
        }
        Ok(output.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_checked(args)?.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(self.failure(args, &output));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run git {}", args.join(" ")))
    }

    fn failure(&self, args: &[&str], output: &CommandOutput) -> anyhow::Error {
        if output.timed_out {
            return anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            );
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow!("git {} failed: {}", args.join(" "), stderr.trim())
    }
}

impl Vcs for Git {
    #[instrument(skip_all)]
    fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    #[instrument(skip_all, fields(prefix))]
    fn list_branches(&self, prefix: &str) -> Result<Vec<BranchRef>> {
        let prefix = prefix.trim_end_matches('/');
        let local = format!("refs/heads/{prefix}");
        let remote = format!("refs/remotes/{}/{prefix}", self.remote);
        let out = self.run_capture(&[
            "for-each-ref",
            "--format=%(refname)%09%(committerdate:unix)",
            &local,
            &remote,
        ])?;
        let branches = parse_branch_refs(&out, &self.remote);
        debug!(count = branches.len(), "branches in namespace");
        Ok(branches)
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        self.ref_exists(&format!("refs/heads/{branch}"))
    }

    fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        self.ref_exists(&self.remote_ref(branch))
    }

    #[instrument(skip_all)]
    fn stash(&self, message: &str) -> Result<bool> {
        if !self.is_dirty()? {
            return Ok(false);
        }
        debug!(message, "stashing working tree");
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])?;
        Ok(true)
    }

    #[instrument(skip_all, fields(branch))]
    fn fetch(&self, branch: Option<&str>) -> Result<()> {
        match branch {
            Some(branch) => self.run_checked(&["fetch", &self.remote, branch])?,
            None => self.run_checked(&["fetch", "--prune", &self.remote])?,
        };
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    fn checkout(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(local, upstream))]
    fn checkout_tracking(&self, local: &str, upstream: &str) -> Result<()> {
        let start = format!("{}/{upstream}", self.remote);
        debug!(local, start = %start, "checking out tracking branch");
        self.run_checked(&["checkout", "-B", local, &start])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    fn pull_rebase(&self, branch: &str) -> Result<()> {
        if !self.remote_branch_exists(branch)? {
            debug!(branch, "no remote counterpart, nothing to pull");
            return Ok(());
        }
        self.run_checked(&["pull", "--rebase", &self.remote, branch])?;
        Ok(())
    }

    fn abort_rebase(&self) -> Result<()> {
        self.run_checked(&["rebase", "--abort"])?;
        Ok(())
    }

    fn commits_ahead(&self, base: &str) -> Result<u32> {
        let range = format!("{base}..HEAD");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    fn has_diff(&self, base: &str) -> Result<bool> {
        let args = ["diff", "--quiet", base, "HEAD"];
        let output = self.run(&args)?;
        match output.exit_code() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(self.failure(&args, &output)),
        }
    }

    fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    fn staged_diff(&self) -> Result<String> {
        self.run_capture(&["diff", "--cached"])
    }

    fn commit_empty(&self, message: &str) -> Result<()> {
        self.run_checked(&["commit", "--allow-empty", "-m", message])?;
        Ok(())
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Parse `for-each-ref` output (`<refname>\t<unix time>`), merging local and
/// remote copies of a branch and sorting newest first.
fn parse_branch_refs(out: &str, remote: &str) -> Vec<BranchRef> {
    let remote_prefix = format!("refs/remotes/{remote}/");
    let mut branches: Vec<BranchRef> = Vec::new();
    for line in out.lines() {
        let Some((refname, time)) = line.split_once('\t') else {
            continue;
        };
        let (name, is_remote) = if let Some(name) = refname.strip_prefix("refs/heads/") {
            (name, false)
        } else if let Some(name) = refname.strip_prefix(&remote_prefix) {
            (name, true)
        } else {
            continue;
        };
        if name == "HEAD" {
            continue;
        }
        let commit_time = time.trim().parse().unwrap_or(0);
        match branches.iter_mut().find(|b| b.name == name) {
            Some(existing) => {
                existing.local |= !is_remote;
                existing.remote |= is_remote;
                existing.commit_time = existing.commit_time.max(commit_time);
            }
            None => branches.push(BranchRef {
                name: name.to_string(),
                local: !is_remote,
                remote: is_remote,
                commit_time,
            }),
        }
    }
    branches.sort_by(|a, b| b.commit_time.cmp(&a.commit_time).then(a.name.cmp(&b.name)));
    branches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? notes.md").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "notes.md".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.rs -> new.rs").expect("parse");
        assert_eq!(e.code, "R ");
        assert_eq!(e.path, "new.rs");
    }

    #[test]
    fn branch_refs_merge_local_and_remote_and_sort_newest_first() {
        let out = "refs/heads/epic/E1/T1-foo\t100\n\
                   refs/remotes/origin/epic/E1/T1-foo\t100\n\
                   refs/remotes/origin/epic/E1/T2-bar\t300\n\
                   refs/remotes/origin/HEAD\t1\n\
                   refs/heads/epic/E1/T3-baz\t200\n";
        let branches = parse_branch_refs(out, "origin");
        let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["epic/E1/T2-bar", "epic/E1/T3-baz", "epic/E1/T1-foo"]
        );
        assert!(branches[0].remote && !branches[0].local);
        assert!(branches[2].remote && branches[2].local);
        assert!(!branches[1].remote);
    }

    #[test]
    fn branch_refs_skip_malformed_lines() {
        let branches = parse_branch_refs("garbage\nrefs/tags/v1\t5\n", "origin");
        assert!(branches.is_empty());
    }

    #[test]
    fn reports_dirty_and_counts_commits_in_real_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(temp.path())
                .status()
                .expect("spawn git");
            assert!(status.success(), "git {args:?}");
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "loop@example.com"]);
        run(&["config", "user.name", "loop"]);
        run(&["commit", "-q", "--allow-empty", "-m", "root"]);

        let git = Git::new(temp.path(), "origin", Duration::from_secs(30), 1_000_000);
        assert_eq!(git.current_branch().expect("branch"), "main");
        assert!(!git.is_dirty().expect("dirty"));

        run(&["checkout", "-q", "-b", "agent/T1-foo"]);
        git.commit_empty("placeholder").expect("commit");
        assert_eq!(git.commits_ahead("main").expect("ahead"), 1);
        assert!(!git.has_diff("main").expect("diff"));

        std::fs::write(temp.path().join("a.txt"), "hello\n").expect("write");
        assert!(git.is_dirty().expect("dirty"));
        git.add_all().expect("add");
        assert!(git.staged_diff().expect("diff").contains("hello"));
        assert!(git.branch_exists("agent/T1-foo").expect("exists"));
        assert!(!git.remote_branch_exists("agent/T1-foo").expect("remote"));
    }

    #[test]
    fn stalled_git_command_fails_with_a_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let status = Command::new("git")
            .args(["init", "-q", "-b", "main"])
            .current_dir(temp.path())
            .status()
            .expect("spawn git");
        assert!(status.success());
        let status = Command::new("git")
            .args(["config", "alias.hang", "!sleep 30"])
            .current_dir(temp.path())
            .status()
            .expect("spawn git");
        assert!(status.success());

        let git = Git::new(temp.path(), "origin", Duration::from_millis(300), 1024);
        let started = std::time::Instant::now();
        let err = git
            .run_checked(&["hang"])
            .expect_err("hung command must time out");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.to_string().contains("timed out"), "{err:#}");
    }
}
