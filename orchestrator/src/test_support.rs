//! Test-only helpers: throwaway git repositories, tasks, and scripted
//! executor and verifier backends that never spawn an agent.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::TempDir;

use crate::core::types::{CheckStatus, Task, VerificationReport};
use crate::error::OrchestratorError;
use crate::io::executor::{ExecOutcome, ExecRequest, TaskExecutor};
use crate::io::git::Git;
use crate::io::verifier::Verifier;

const PEER_WAIT: Duration = Duration::from_secs(30);

/// A git repository on `main` with one commit, removed on drop.
pub struct TestRepo {
    _dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonical tempdir");
        let repo = Self { _dir: dir, root };
        repo.git_cmd(&["init", "--quiet"]);
        repo.git_cmd(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.git_cmd(&["config", "user.name", "Test"]);
        repo.git_cmd(&["config", "user.email", "test@example.com"]);
        repo.git_cmd(&["config", "commit.gpgsign", "false"]);
        repo.git_cmd(&["config", "tag.gpgsign", "false"]);
        repo.write("README.md", "# test\n");
        repo.commit_all("initial commit");
        repo
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root.join(rel)).expect("read file")
    }

    pub fn commit_all(&self, message: &str) {
        self.git_cmd(&["add", "-A"]);
        self.git_cmd(&["commit", "--quiet", "--allow-empty", "-m", message]);
    }

    fn git_cmd(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Task with a description (used for touch estimation) and dependencies.
pub fn task(id: &str, description: &str, depends_on: &[&str]) -> Task {
    let mut task = Task::new(id, format!("{id} title"));
    task.description = description.to_string();
    task.depends_on = depends_on.iter().map(|dep| dep.to_string()).collect();
    task
}

/// One scripted executor response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStep {
    /// Write files into the worktree and report success.
    Write(Vec<(String, String)>),
    /// Write files, then report failure.
    FailAfterWriting(Vec<(String, String)>),
    /// Wait until `peer` has reached the executor, then write files and fail.
    FailAfterPeerStarts {
        peer: String,
        files: Vec<(String, String)>,
    },
    /// Cancel the run's token and report an interrupted run.
    Interrupt,
    /// Fail the way an unavailable state lock does.
    LockTimeout,
}

impl ScriptedStep {
    pub fn write(path: &str, contents: &str) -> Self {
        ScriptedStep::Write(vec![(path.to_string(), contents.to_string())])
    }

    pub fn fail() -> Self {
        ScriptedStep::FailAfterWriting(Vec::new())
    }

    pub fn fail_after_writing(path: &str, contents: &str) -> Self {
        ScriptedStep::FailAfterWriting(vec![(path.to_string(), contents.to_string())])
    }

    pub fn fail_after_peer_starts(peer: &str, path: &str, contents: &str) -> Self {
        ScriptedStep::FailAfterPeerStarts {
            peer: peer.to_string(),
            files: vec![(path.to_string(), contents.to_string())],
        }
    }
}

/// Executor driven by per-task scripts.
///
/// Tasks without a script (or whose script ran out) write `<task_id>.txt`
/// and succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<BTreeMap<String, VecDeque<ScriptedStep>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task_id: &str, steps: Vec<ScriptedStep>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), steps.into());
        self
    }

    /// `(task_id, prompt)` for every call, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn prompts_for(&self, task_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, prompt)| prompt)
            .collect()
    }

    fn wait_for_call(&self, task_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.calls().iter().any(|(id, _)| id == task_id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn next_step(&self, task_id: &str) -> ScriptedStep {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ScriptedStep::write(&format!("{task_id}.txt"), &format!("done {task_id}\n")))
    }
}

fn write_files(workdir: &Path, files: &[(String, String)]) -> Result<()> {
    for (rel, contents) in files {
        let path = workdir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
    }
    Ok(())
}

impl TaskExecutor for ScriptedExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<ExecOutcome> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((request.task_id.clone(), request.prompt.clone()));
        match self.next_step(&request.task_id) {
            ScriptedStep::Write(files) => {
                write_files(&request.workdir, &files)?;
                Ok(ExecOutcome::succeeded(format!("wrote {} files", files.len())))
            }
            ScriptedStep::FailAfterWriting(files) => {
                write_files(&request.workdir, &files)?;
                Ok(ExecOutcome::failed("scripted failure"))
            }
            ScriptedStep::FailAfterPeerStarts { peer, files } => {
                if !self.wait_for_call(&peer, PEER_WAIT) {
                    return Ok(ExecOutcome::failed(format!("{peer} never started")));
                }
                write_files(&request.workdir, &files)?;
                Ok(ExecOutcome::failed("scripted failure"))
            }
            ScriptedStep::LockTimeout => Err(OrchestratorError::LockTimeout {
                path: request.workdir.join("state.json.lock"),
                waited: Duration::ZERO,
            }
            .into()),
            ScriptedStep::Interrupt => {
                if let Some(cancel) = &request.cancel {
                    cancel.cancel();
                }
                Ok(ExecOutcome {
                    cancelled: true,
                    ..ExecOutcome::failed("scripted interrupt")
                })
            }
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// Passes every check unless the worktree contains a marker file.
#[derive(Debug, Clone, Default)]
pub struct ScriptedVerifier {
    failure_marker: Option<String>,
}

impl ScriptedVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the tests check whenever `rel` exists in the worktree.
    pub fn fail_if_present(rel: &str) -> Self {
        Self {
            failure_marker: Some(rel.to_string()),
        }
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, workdir: &Path) -> Result<VerificationReport> {
        let failing = self
            .failure_marker
            .as_deref()
            .is_some_and(|marker| workdir.join(marker).exists());
        Ok(VerificationReport {
            tests: if failing {
                CheckStatus::Failed
            } else {
                CheckStatus::Passed
            },
            lint: CheckStatus::Unknown,
            type_check: CheckStatus::Unknown,
            failure_detail: failing.then(|| "tests failed:\nscripted failure".to_string()),
        })
    }
}
