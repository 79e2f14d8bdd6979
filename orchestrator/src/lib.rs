//! Parallel task orchestration over git worktrees.
//!
//! Tasks from a JSON task file are layered into dependency waves, split into
//! sub-waves so concurrent tasks never touch the same files, and executed by
//! independent workers, each in its own worktree and branch. Passing tasks are
//! merged back into the base branch one at a time.
//!
//! - **[`core`]**: Pure, deterministic logic (graph, file conflicts, circuit
//!   breaker, provenance ids). No I/O.
//! - **[`io`]**: Side-effecting adapters (state store, git, worktrees,
//!   checkpoints, executor and verifier processes, ledgers).
//! - **[`pipeline`]** runs one task; **[`orchestrate`]** runs the waves.

pub mod core;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrate;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
