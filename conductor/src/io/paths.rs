//! Well-known locations of persisted loop state.

use std::path::{Path, PathBuf};

/// All state files for one working tree.
///
/// Each worktree gets its own directory under the state root, keyed on its
/// sanitized absolute path, so independent worktrees never share a lock.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub lock_path: PathBuf,
    pub current_task_path: PathBuf,
    pub failure_counts_path: PathBuf,
    pub health_log_path: PathBuf,
    pub validation_log_path: PathBuf,
    pub config_path: PathBuf,
}

impl StatePaths {
    pub fn new(state_root: &Path, repo_root: &Path) -> Self {
        let dir = state_root.join(worktree_key(repo_root));
        Self {
            lock_path: dir.join("worktree.lock"),
            current_task_path: dir.join("current_task"),
            failure_counts_path: dir.join("failure_counts"),
            health_log_path: dir.join("health.log"),
            validation_log_path: dir.join("logs").join("validation.log"),
            config_path: dir.join("config.toml"),
            dir,
        }
    }
}

/// Default state root when none is configured.
pub fn default_state_root() -> PathBuf {
    std::env::temp_dir().join("conductor")
}

/// Directory-safe key for a worktree path (`/home/me/repo` -> `home-me-repo`).
pub fn worktree_key(repo_root: &Path) -> String {
    let raw = repo_root.to_string_lossy();
    let mut key = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' {
            key.push(ch);
        } else if !key.ends_with('-') {
            key.push('-');
        }
    }
    let key = key.trim_matches('-').to_string();
    if key.is_empty() { "root".to_string() } else { key }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_filesystem_safe_and_stable() {
        assert_eq!(worktree_key(Path::new("/home/me/my repo")), "home-me-my-repo");
        assert_eq!(worktree_key(Path::new("/")), "root");
    }

    #[test]
    fn distinct_worktrees_get_distinct_locks() {
        let root = Path::new("/tmp/conductor");
        let a = StatePaths::new(root, Path::new("/work/epic-a"));
        let b = StatePaths::new(root, Path::new("/work/epic-b"));
        assert_ne!(a.lock_path, b.lock_path);
        assert!(a.lock_path.starts_with(root));
    }
}
