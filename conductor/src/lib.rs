//! Autonomous task orchestration over a tracker, a stacked-PR tool, and agents.
//!
//! Each loop iteration takes one ready task through branch preparation,
//! implementation, validation, review, a completion check, bounded repair, and
//! submission. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (naming, selection, reconciliation
//!   decisions, failure heuristics, the remediation allowlist). No I/O.
//! - **[`io`]**: Side-effecting adapters (git, the stack tool, the tracker, model
//!   CLIs, validation commands, persisted state, the worktree lock), each behind
//!   a trait so tests substitute fakes.
//! - **[`agents`]**: Agent roles on top of the invocation harness.
//!
//! Orchestration modules ([`pipeline`], [`looping`], [`stack`], [`reconcile`],
//! [`health`], [`remediation`], [`resolver`]) combine the three.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod health;
pub mod io;
pub mod logging;
pub mod looping;
pub mod pipeline;
pub mod reconcile;
pub mod remediation;
pub mod resolver;
pub mod stack;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
