//! Executor abstraction for the code-generation step.
//!
//! The [`TaskExecutor`] trait decouples the task pipeline from the actual
//! backend (by default `claude -p`). Tests use scripted executors that edit
//! the worktree directly without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::ExecutorConfig;
use crate::io::process::{CancelToken, CommandOutput, run_command_with_timeout};

/// Parameters for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub task_id: String,
    /// Worktree the executor runs in.
    pub workdir: PathBuf,
    pub prompt: String,
    /// Where stdout/stderr of the attempt are written.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: Option<CancelToken>,
}

/// What the executor reported. A failed, timed out or cancelled run is an
/// outcome, not an error; errors are reserved for failing to run at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub success: bool,
    /// Captured stdout (bounded).
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ExecOutcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            ..Self::default()
        }
    }

    /// Short reason for a failed outcome.
    pub fn failure_reason(&self) -> String {
        if self.cancelled {
            "interrupted".to_string()
        } else if self.timed_out {
            "executor timed out".to_string()
        } else {
            "executor reported failure".to_string()
        }
    }
}

/// Backend that turns a prompt into edits inside a worktree.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, request: &ExecRequest) -> Result<ExecOutcome>;

    /// Model name recorded in provenance.
    fn model(&self) -> &str;
}

/// Executor that pipes the prompt to a configured command on stdin.
pub struct CliExecutor {
    command: Vec<String>,
    model: String,
}

impl CliExecutor {
    pub fn new(command: Vec<String>, model: impl Into<String>) -> Self {
        Self {
            command,
            model: model.into(),
        }
    }

    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        Self::new(cfg.command.clone(), cfg.model.clone())
    }
}

impl TaskExecutor for CliExecutor {
    #[instrument(skip_all, fields(task_id = %request.task_id, timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &ExecRequest) -> Result<ExecOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("executor command is empty"))?;
        info!(workdir = %request.workdir.display(), program, "starting executor");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            request.cancel.as_ref(),
        )
        .with_context(|| format!("run executor {program}"))?;

        write_executor_log(&request.log_path, &output, request.output_limit_bytes)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "executor timed out");
        } else if output.cancelled {
            warn!("executor cancelled");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "executor failed");
        } else {
            debug!("executor completed successfully");
        }

        Ok(ExecOutcome {
            success: output.succeeded(),
            output: output.stdout.text(),
            timed_out: output.timed_out,
            cancelled: output.cancelled,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn write_executor_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout.text());
    buf.push_str(&output.stdout.notice("stdout"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr.text());
    buf.push_str(&output.stderr.notice("stderr"));
    if output.timed_out {
        buf.push_str("\n[executor timed out]\n");
    }
    if output.cancelled {
        buf.push_str("\n[executor cancelled]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        return fs::write(path, truncated)
            .with_context(|| format!("write executor log {}", path.display()));
    }

    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}
