//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod classifier;
pub mod epic;
pub mod health;
pub mod naming;
pub mod phase;
pub mod reconcile;
pub mod remediation;
pub mod report;
pub mod selector;
pub mod types;
