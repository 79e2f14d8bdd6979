//! Shared deterministic types for orchestration core logic.
//!
//! These types define stable contracts between core components and the I/O
//! adapters. They should not depend on external state and must serialize the
//! same way across runs.

use serde::{Deserialize, Serialize};

/// A unit of work handed to one worker.
///
/// Only `id` is required in the task source. Dependencies on ids outside the
/// current batch are ignored at scheduling time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, rename = "depends_on", alias = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub passes: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            priority: None,
            effort: None,
            category: None,
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
            passes: false,
        }
    }

    /// Title when present, otherwise the id.
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// Outcome of one verification check.
///
/// `Unknown` means the check could not be run (tool missing, not configured).
/// It is reported but never counts as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Unknown,
}

impl CheckStatus {
    /// `None` for checks that did not run.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            CheckStatus::Passed => Some(true),
            CheckStatus::Failed => Some(false),
            CheckStatus::Unknown => None,
        }
    }
}

/// Results of the verification commands run against a worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub tests: CheckStatus,
    pub lint: CheckStatus,
    pub type_check: CheckStatus,
    /// Tail of the output of the first failing check, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
}

impl VerificationReport {
    pub fn unknown() -> Self {
        Self {
            tests: CheckStatus::Unknown,
            lint: CheckStatus::Unknown,
            type_check: CheckStatus::Unknown,
            failure_detail: None,
        }
    }

    pub fn passed(&self) -> bool {
        [self.tests, self.lint, self.type_check]
            .iter()
            .all(|status| *status != CheckStatus::Failed)
    }

    /// Names of the checks that failed, in a fixed order.
    pub fn failed_checks(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if self.tests == CheckStatus::Failed {
            failed.push("tests");
        }
        if self.lint == CheckStatus::Failed {
            failed.push("lint");
        }
        if self.type_check == CheckStatus::Failed {
            failed.push("type_check");
        }
        failed
    }
}

/// Lifecycle of a task's isolated worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeStatus {
    Created,
    Executing,
    Verifying,
    Passed,
    Failed,
    Merged,
}

impl WorktreeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorktreeStatus::Created => "created",
            WorktreeStatus::Executing => "executing",
            WorktreeStatus::Verifying => "verifying",
            WorktreeStatus::Passed => "passed",
            WorktreeStatus::Failed => "failed",
            WorktreeStatus::Merged => "merged",
        }
    }

    /// Allowed moves: `created -> executing -> verifying -> {passed|failed} -> merged`,
    /// `executing -> failed`, and `failed -> created` (rollback before a retry).
    /// Re-entering the current status is always allowed.
    pub fn can_transition_to(self, next: WorktreeStatus) -> bool {
        use WorktreeStatus::{Created, Executing, Failed, Merged, Passed, Verifying};
        self == next
            || matches!(
                (self, next),
                (Created, Executing)
                    | (Executing, Verifying)
                    | (Executing, Failed)
                    | (Verifying, Passed)
                    | (Verifying, Failed)
                    | (Passed, Merged)
                    | (Failed, Created)
            )
    }
}

impl std::fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
