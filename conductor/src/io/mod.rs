//! Side-effecting adapters: processes, collaborators, persisted state.

pub mod background;
pub mod config;
pub mod git;
pub mod graphite;
pub mod lock;
pub mod model;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod sleeper;
pub mod state_store;
pub mod tracker;
pub mod validation;
