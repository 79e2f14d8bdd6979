//! Typed failures that callers branch on.
//!
//! Everything else travels as `anyhow::Error` with context; these variants are
//! recovered with `downcast_ref::<OrchestratorError>()` where the caller needs
//! to tell a configuration mistake from a broken lock or a missing checkpoint.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// In-batch dependencies form at least one cycle.
    #[error("dependency cycle among tasks: {}", .tasks.join(", "))]
    DependencyCycle { tasks: Vec<String> },

    #[error("duplicate task id '{id}' in task source")]
    DuplicateTask { id: String },

    #[error("unknown branch '{branch}'")]
    UnknownBranch { branch: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("not a git repository: {}", .path.display())]
    NotAGitRepo { path: PathBuf },

    /// A file lock could not be acquired in time. Never retried forever.
    #[error("timed out after {waited:?} waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Primary state and its backup are both unreadable.
    #[error("corrupt state document {}: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("checkpoint not found: {}", .id.as_deref().unwrap_or("<none recorded>"))]
    CheckpointNotFound { id: Option<String> },

    #[error("provenance entry not found: {id}")]
    ProvenanceNotFound { id: String },

    #[error("provenance entry {id} is already {status}")]
    AlreadyFinalized { id: String, status: String },

    #[error("no worktree for task '{task_id}'")]
    WorktreeNotFound { task_id: String },

    #[error("illegal worktree transition {from} -> {to} for task '{task_id}'")]
    IllegalTransition {
        task_id: String,
        from: String,
        to: String,
    },
}

impl OrchestratorError {
    /// Store-level failures: continuing without reliable shared state is unsafe,
    /// so these escape the per-task boundary and stop the loop.
    pub fn is_store_level(&self) -> bool {
        matches!(
            self,
            OrchestratorError::LockTimeout { .. } | OrchestratorError::CorruptState { .. }
        )
    }

    /// Configuration mistakes are reported immediately and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            OrchestratorError::DependencyCycle { .. }
                | OrchestratorError::DuplicateTask { .. }
                | OrchestratorError::UnknownBranch { .. }
                | OrchestratorError::InvalidConfig { .. }
        )
    }
}

/// True when `err` (or anything in its context chain) is a store-level failure.
pub fn is_store_level(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<OrchestratorError>()
            .is_some_and(OrchestratorError::is_store_level)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn store_level_survives_added_context() {
        let err = Err::<(), _>(OrchestratorError::LockTimeout {
            path: PathBuf::from(".up/state.json.lock"),
            waited: Duration::from_secs(1),
        })
        .context("record task failure")
        .unwrap_err();
        assert!(is_store_level(&err));
    }

    #[test]
    fn cycle_is_configuration_not_store_level() {
        let err = OrchestratorError::DependencyCycle {
            tasks: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.is_configuration());
        assert!(!err.is_store_level());
        assert_eq!(err.to_string(), "dependency cycle among tasks: a, b");
    }
}
