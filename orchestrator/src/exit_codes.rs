//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `run`, every scheduled task merged.
pub const OK: i32 = 0;
/// Invalid configuration, task file or repository, or a store-level failure.
pub const INVALID: i32 = 1;
/// `run` finished with failed or skipped tasks.
pub const INCOMPLETE: i32 = 2;
/// `run` stopped because a circuit breaker opened.
pub const CIRCUIT_OPEN: i32 = 3;
/// `run` was interrupted; worktrees were kept for the next run.
pub const INTERRUPTED: i32 = 130;
