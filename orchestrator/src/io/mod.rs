//! Side-effecting adapters: filesystem state, git, subprocesses.

pub mod atomic;
pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod git;
pub mod knowledge;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod provenance;
pub mod state_store;
pub mod task_source;
pub mod verifier;
pub mod worktree;
