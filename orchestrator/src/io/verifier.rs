//! Verification checks (tests, lint, type check) run against a worktree.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::{CheckStatus, VerificationReport};
use crate::io::config::VerifyConfig;
use crate::io::process::run_command_with_timeout;

/// Bytes of output kept from the first failing check.
const FAILURE_TAIL_BYTES: usize = 2_000;

pub trait Verifier: Send + Sync {
    fn verify(&self, workdir: &Path) -> Result<VerificationReport>;
}

/// Runs the configured commands. An unconfigured check or a missing tool is
/// `Unknown`; a non-zero exit or a timeout is `Failed`.
pub struct CommandVerifier {
    tests: Option<Vec<String>>,
    lint: Option<Vec<String>>,
    type_check: Option<Vec<String>>,
    timeout: Duration,
    output_limit_bytes: usize,
}

struct CheckRun {
    status: CheckStatus,
    detail: Option<String>,
}

impl CommandVerifier {
    pub fn from_config(cfg: &VerifyConfig) -> Self {
        Self {
            tests: cfg.tests.clone(),
            lint: cfg.lint.clone(),
            type_check: cfg.type_check.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    fn run_check(&self, name: &str, command: Option<&[String]>, workdir: &Path) -> Result<CheckRun> {
        let Some((program, args)) = command.and_then(<[String]>::split_first) else {
            debug!(check = name, "check not configured");
            return Ok(CheckRun {
                status: CheckStatus::Unknown,
                detail: None,
            });
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        let output = match run_command_with_timeout(
            cmd,
            None,
            self.timeout,
            self.output_limit_bytes,
            None,
        ) {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => {
                warn!(check = name, program, "verification tool not found");
                return Ok(CheckRun {
                    status: CheckStatus::Unknown,
                    detail: None,
                });
            }
            Err(err) => return Err(err.context(format!("run {name} check"))),
        };

        if output.succeeded() {
            debug!(check = name, "check passed");
            return Ok(CheckRun {
                status: CheckStatus::Passed,
                detail: None,
            });
        }
        let mut combined = output.stdout.text();
        combined.push_str(&output.stderr.text());
        if output.timed_out {
            combined.push_str(&format!("\n[{name} timed out after {:?}]", self.timeout));
        }
        warn!(check = name, exit_code = ?output.status.code(), timed_out = output.timed_out, "check failed");
        Ok(CheckRun {
            status: CheckStatus::Failed,
            detail: Some(format!("{name} failed:\n{}", tail(&combined, FAILURE_TAIL_BYTES))),
        })
    }
}

impl Verifier for CommandVerifier {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn verify(&self, workdir: &Path) -> Result<VerificationReport> {
        if !workdir.is_dir() {
            return Err(anyhow!("verification directory {} missing", workdir.display()));
        }
        let tests = self.run_check("tests", self.tests.as_deref(), workdir)?;
        let lint = self.run_check("lint", self.lint.as_deref(), workdir)?;
        let type_check = self.run_check("type_check", self.type_check.as_deref(), workdir)?;
        let failure_detail = [&tests, &lint, &type_check]
            .into_iter()
            .find_map(|run| run.detail.clone());
        Ok(VerificationReport {
            tests: tests.status,
            lint: lint.status,
            type_check: type_check.status,
            failure_detail,
        })
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == ErrorKind::NotFound)
    })
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
