//! Orchestrator configuration stored under `.up/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::circuit::{
    DEFAULT_COOLDOWN_MINUTES, DEFAULT_FAILURE_THRESHOLD, DEFAULT_SUCCESS_THRESHOLD,
};
use crate::error::OrchestratorError;
use crate::io::atomic::write_atomic;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below; unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Consecutive task failures before the advisory doom-loop warning fires.
    pub doom_loop_threshold: u32,
    /// Checkpoint ids kept in the unified state; oldest are pruned on insert.
    pub checkpoint_retention_count: usize,
    /// Upper bound on any file-lock wait.
    pub lock_timeout_secs: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub context: ContextConfig,
    pub parallel: ParallelConfig,
    pub executor: ExecutorConfig,
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Successes needed in HALF_OPEN before the breaker closes again.
    pub success_threshold: u32,
    pub cooldown_minutes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    pub budget_tokens: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 100_000,
            warning_threshold: 0.8,
            critical_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_workers: usize,
    /// Branch worktrees are created from and merged back into.
    pub base_branch: String,
    /// Split waves by predicted file overlap before running them.
    pub conflict_check: bool,
    /// Attempts per task within one run, further bounded by the circuit breaker.
    pub max_attempts_per_task: u32,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            base_branch: "main".to_string(),
            conflict_check: true,
            max_attempts_per_task: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program and arguments; the prompt is piped on stdin.
    pub command: Vec<String>,
    /// Model name recorded in provenance.
    pub model: String,
    pub timeout_secs: u64,
    /// Truncate executor stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            model: "claude".to_string(),
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

/// Verification commands run inside a worktree. An unset command is reported
/// as `unknown` and never fails a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    pub tests: Option<Vec<String>>,
    pub lint: Option<Vec<String>>,
    pub type_check: Option<Vec<String>>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            tests: Some(vec!["just".to_string(), "ci".to_string()]),
            lint: None,
            type_check: None,
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            doom_loop_threshold: 3,
            checkpoint_retention_count: 50,
            lock_timeout_secs: 30,
            circuit_breaker: CircuitBreakerConfig::default(),
            context: ContextConfig::default(),
            parallel: ParallelConfig::default(),
            executor: ExecutorConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> anyhow::Error {
    OrchestratorError::InvalidConfig {
        reason: reason.into(),
    }
    .into()
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.doom_loop_threshold == 0 {
            return Err(invalid("doom_loop_threshold must be > 0"));
        }
        if self.checkpoint_retention_count == 0 {
            return Err(invalid("checkpoint_retention_count must be > 0"));
        }
        if self.lock_timeout_secs == 0 {
            return Err(invalid("lock_timeout_secs must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be > 0"));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(invalid("circuit_breaker.success_threshold must be > 0"));
        }
        let ctx = &self.context;
        if !(0.0 < ctx.warning_threshold
            && ctx.warning_threshold <= ctx.critical_threshold
            && ctx.critical_threshold <= 1.0)
        {
            return Err(invalid(
                "context thresholds must satisfy 0 < warning <= critical <= 1",
            ));
        }
        if self.parallel.max_workers == 0 {
            return Err(invalid("parallel.max_workers must be > 0"));
        }
        if self.parallel.base_branch.trim().is_empty() {
            return Err(invalid("parallel.base_branch must not be empty"));
        }
        if self.parallel.max_attempts_per_task == 0 {
            return Err(invalid("parallel.max_attempts_per_task must be > 0"));
        }
        if self.executor.command.is_empty() || self.executor.command[0].trim().is_empty() {
            return Err(invalid("executor.command must be a non-empty array"));
        }
        if self.executor.timeout_secs == 0 || self.verify.timeout_secs == 0 {
            return Err(invalid("timeouts must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 || self.verify.output_limit_bytes == 0 {
            return Err(invalid("output limits must be > 0"));
        }
        for (name, command) in [
            ("verify.tests", &self.verify.tests),
            ("verify.lint", &self.verify.lint),
            ("verify.type_check", &self.verify.type_check),
        ] {
            if let Some(command) = command
                && command.first().is_none_or(|program| program.trim().is_empty())
            {
                return Err(invalid(format!("{name} must be a non-empty array")));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = OrchestratorConfig::default();
        cfg.parallel.max_workers = 5;
        cfg.verify.lint = Some(vec!["cargo".to_string(), "clippy".to_string()]);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "doom_loop_threshold = 5\n\n[parallel]\nbase_branch = \"develop\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.doom_loop_threshold, 5);
        assert_eq!(cfg.parallel.base_branch, "develop");
        assert_eq!(cfg.parallel.max_workers, 3);
        assert_eq!(cfg.circuit_breaker, CircuitBreakerConfig::default());
    }

    #[test]
    fn rejects_zero_workers_as_configuration_error() {
        let mut cfg = OrchestratorConfig::default();
        cfg.parallel.max_workers = 0;
        let err = cfg.validate().expect_err("invalid");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_inverted_context_thresholds() {
        let mut cfg = OrchestratorConfig::default();
        cfg.context.warning_threshold = 0.95;
        assert!(cfg.validate().is_err());
    }
}
