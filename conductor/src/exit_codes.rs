//! Stable exit codes for conductor CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration or an unexpected error.
pub const INVALID: i32 = 1;
/// `conductor once` found no ready task.
pub const IDLE: i32 = 2;
/// `conductor once` blocked or released the task, or `preflight` found the baseline broken.
pub const BLOCKED: i32 = 3;
/// Another loop holds the worktree lock.
pub const LOCKED: i32 = 4;
