//! End-to-end runs against a real git repository with scripted workers.
//!
//! Each test drives `orchestrate::run` over a committed `tasks.json` and
//! checks what landed on `main`, what the ledgers recorded, and which
//! progress events were published.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use orchestrator::core::circuit::BreakerState;
use orchestrator::core::file_map::PathTokenEstimator;
use orchestrator::core::types::WorktreeStatus;
use orchestrator::events::{ChannelSink, ProgressEvent};
use orchestrator::io::config::OrchestratorConfig;
use orchestrator::io::executor::{CliExecutor, TaskExecutor};
use orchestrator::io::git::Git;
use orchestrator::io::knowledge::SharedKnowledge;
use orchestrator::io::process::CancelToken;
use orchestrator::io::provenance::{ProvenanceLedger, ProvenanceStatus};
use orchestrator::io::state_store::{LoopPhase, StateStore};
use orchestrator::io::task_source::TaskSource;
use orchestrator::io::worktree::WorktreeManager;
use orchestrator::orchestrate::{self, RunContext, RunOptions, RunStop, RunSummary};
use orchestrator::pipeline::{OutcomeKind, PROVENANCE_DIR};
use orchestrator::test_support::{ScriptedExecutor, ScriptedStep, ScriptedVerifier, TestRepo};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    repo: TestRepo,
    store: StateStore,
    knowledge: SharedKnowledge,
    worktrees: WorktreeManager,
    source: TaskSource,
}

impl Harness {
    fn new(tasks: serde_json::Value, configure: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        let repo = TestRepo::new();
        repo.write(
            "tasks.json",
            &serde_json::to_string_pretty(&tasks).expect("tasks json"),
        );
        repo.commit_all("add tasks");

        let mut config = OrchestratorConfig::default();
        config.lock_timeout_secs = LOCK_TIMEOUT.as_secs();
        configure(&mut config);
        let store = StateStore::with_config(repo.path(), config).expect("store");
        let knowledge = SharedKnowledge::new(store.up_dir(), LOCK_TIMEOUT);
        let worktrees = WorktreeManager::new(repo.path(), LOCK_TIMEOUT)
            .expect("worktrees")
            .allow_dirty(vec!["tasks.json".to_string()]);
        let source = TaskSource::new(repo.path().join("tasks.json"), LOCK_TIMEOUT);
        Self {
            repo,
            store,
            knowledge,
            worktrees,
            source,
        }
    }

    fn run(
        &self,
        executor: &ScriptedExecutor,
        verifier: &ScriptedVerifier,
        opts: RunOptions,
    ) -> (RunSummary, Vec<ProgressEvent>) {
        self.run_with(executor, verifier, opts, CancelToken::new())
    }

    fn run_with(
        &self,
        executor: &dyn TaskExecutor,
        verifier: &ScriptedVerifier,
        opts: RunOptions,
        cancel: CancelToken,
    ) -> (RunSummary, Vec<ProgressEvent>) {
        let (result, events) = self.try_run(executor, verifier, opts, cancel);
        (result.expect("run"), events)
    }

    fn try_run(
        &self,
        executor: &dyn TaskExecutor,
        verifier: &ScriptedVerifier,
        opts: RunOptions,
        cancel: CancelToken,
    ) -> (anyhow::Result<RunSummary>, Vec<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        let events = ChannelSink::new(tx);
        let ctx = RunContext {
            store: &self.store,
            knowledge: &self.knowledge,
            worktrees: &self.worktrees,
            executor,
            verifier,
            estimator: &PathTokenEstimator,
            events: &events,
            task_source: Some(&self.source),
            cancel,
            config: self.store.config(),
        };
        let tasks = self.source.load().expect("load tasks");
        let result = orchestrate::run(&ctx, &tasks, opts);
        drop(ctx);
        drop(events);
        (result, rx.try_iter().collect())
    }

    fn ledger(&self) -> ProvenanceLedger {
        ProvenanceLedger::new(
            self.store.up_dir().join(PROVENANCE_DIR),
            "main",
            self.repo.path(),
            LOCK_TIMEOUT,
        )
    }

    fn exists_on_main(&self, rel: &str) -> bool {
        self.repo.path().join(rel).exists()
    }
}

fn spec_task(id: &str, description: &str, depends_on: &[&str]) -> serde_json::Value {
    json!({
        "id": id,
        "title": format!("{id} title"),
        "description": description,
        "depends_on": depends_on,
        "passes": false,
    })
}

/// ```text
/// A ──> B ──> D
///  └──> C ──┘
/// ```
#[test]
fn diamond_dependencies_run_in_three_waves_and_merge_everything() {
    let harness = Harness::new(
        json!({
            "project": "demo",
            "tasks": [
                spec_task("A", "Create src/base.py", &[]),
                spec_task("B", "Edit src/b.py", &["A"]),
                spec_task("C", "Edit src/c.py", &["A"]),
                spec_task("D", "Edit src/d.py", &["B", "C"]),
            ],
        }),
        |_| {},
    );
    let executor = ScriptedExecutor::new();
    let (summary, events) = harness.run(&executor, &ScriptedVerifier::new(), RunOptions::default());

    assert_eq!(summary.stop, RunStop::Complete);
    assert_eq!(summary.waves.len(), 3);
    assert_eq!(summary.waves[0].completed, vec!["A".to_string()]);
    assert_eq!(summary.waves[1].completed.len(), 2);
    assert_eq!(summary.waves[2].completed, vec!["D".to_string()]);
    assert_eq!(summary.completed(), 4);
    for id in ["A", "B", "C", "D"] {
        assert!(harness.exists_on_main(&format!("{id}.txt")), "{id} merged");
        let outcome = summary.outcome(id).expect("outcome");
        assert_eq!(outcome.kind, OutcomeKind::Passed);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.merge_commit.is_some());
    }

    // Merged worktrees are removed and the task file reflects completion.
    assert!(harness.worktrees.list().expect("list").is_empty());
    assert!(harness.source.pending().expect("pending").is_empty());
    assert!(
        harness
            .repo
            .git()
            .is_tracked("tasks.json")
            .expect("tracked")
    );

    let ledger = harness.ledger();
    let stats = ledger.get_stats().expect("stats");
    assert_eq!(stats.total_operations, 4);
    assert_eq!(stats.accepted, 4);
    let d_entry = ledger.entry_for_task("D").expect("entry").expect("D entry");
    assert_eq!(d_entry.status, ProvenanceStatus::Accepted);
    assert_eq!(d_entry.files_modified, vec!["D.txt".to_string()]);

    // D ran after B and C and saw their notes.
    let d_prompt = &executor.prompts_for("D")[0];
    assert!(d_prompt.contains("Implement task D: D title"));
    assert!(d_prompt.contains("[B]"));
    assert!(d_prompt.contains("[C]"));

    let mut completed = harness.knowledge.completed_tasks().expect("completed");
    completed.sort();
    assert_eq!(completed, vec!["A", "B", "C", "D"]);

    let state = harness.store.load().expect("state");
    assert_eq!(state.metrics.completed_tasks, 4);
    assert!(state.agents.is_empty());
    assert!(!state.parallel.active);

    assert!(matches!(
        events.first(),
        Some(ProgressEvent::RunStarted {
            pending_tasks: 4,
            waves: 3
        })
    ));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunFinished {
            stop: RunStop::Complete,
            completed: 4,
            failed: 0,
            skipped: 0
        })
    ));
    let merges = events
        .iter()
        .filter(|event| matches!(event, ProgressEvent::MergeResult { success: true, .. }))
        .count();
    assert_eq!(merges, 4);
}

#[test]
fn failed_task_skips_dependents_but_not_siblings() {
    let harness = Harness::new(
        json!({
            "tasks": [
                spec_task("A", "Create src/base.py", &[]),
                spec_task("B", "Edit src/b.py", &["A"]),
                spec_task("C", "Edit src/c.py", &["A"]),
                spec_task("D", "Edit src/d.py", &["B", "C"]),
                spec_task("E", "Edit src/e.py", &["C"]),
            ],
        }),
        |cfg| {
            cfg.parallel.max_attempts_per_task = 2;
            cfg.circuit_breaker.failure_threshold = 5;
        },
    );
    let executor = ScriptedExecutor::new().script(
        "B",
        vec![
            ScriptedStep::fail_after_writing("B.txt", "half done\n"),
            ScriptedStep::fail(),
        ],
    );
    let (summary, events) = harness.run(&executor, &ScriptedVerifier::new(), RunOptions::default());

    assert_eq!(summary.stop, RunStop::Complete);
    let b = summary.outcome("B").expect("B");
    assert_eq!(b.kind, OutcomeKind::Failed);
    assert_eq!(b.attempts, 2);
    assert_eq!(b.provenance_ids.len(), 2);
    assert_eq!(summary.outcome("C").expect("C").kind, OutcomeKind::Passed);
    let d = summary.outcome("D").expect("D");
    assert_eq!(d.kind, OutcomeKind::Skipped);
    assert!(d.reason.as_deref().is_some_and(|reason| reason.contains("dependency B")));
    assert_eq!(summary.waves[2].skipped, vec!["D".to_string()]);
    assert_eq!(summary.waves[2].completed, vec!["E".to_string()]);

    // Later workers hear about B's failures through shared knowledge.
    let e_prompt = &executor.prompts_for("E")[0];
    assert!(e_prompt.contains("WARNING from B: task B attempt 1 failed: executor reported failure"));
    assert!(e_prompt.contains("WARNING from B: task B attempt 2 failed"));

    // Nothing from B reached main; its worktree and branch are gone.
    assert!(!harness.exists_on_main("B.txt"));
    assert!(harness.exists_on_main("C.txt"));
    assert!(harness.worktrees.load_state("B").expect("state").is_none());

    let second_prompt = &executor.prompts_for("B")[1];
    assert!(second_prompt.contains("rolled back"));
    assert!(second_prompt.contains("executor reported failure"));

    let ledger = harness.ledger();
    for id in &b.provenance_ids {
        let entry = ledger.get_entry(id).expect("get").expect("entry");
        assert_eq!(entry.status, ProvenanceStatus::Rejected);
    }
    let pending: Vec<String> = harness
        .source
        .pending()
        .expect("pending")
        .into_iter()
        .map(|task| task.id)
        .collect();
    assert_eq!(pending, vec!["B".to_string(), "D".to_string()]);

    let state = harness.store.load().expect("state");
    assert_eq!(state.metrics.failed_tasks, 1);
    assert!(events.iter().any(|event| matches!(
        event,
        ProgressEvent::TaskSkipped { task_id, .. } if task_id == "D"
    )));
}

#[test]
fn concurrent_checkpoints_never_prune_a_live_rollback_target() {
    let harness = Harness::new(
        json!({
            "tasks": [
                spec_task("A", "Edit src/a.py", &[]),
                spec_task("B", "Edit src/b.py", &[]),
            ],
        }),
        |cfg| {
            cfg.checkpoint_retention_count = 1;
            cfg.parallel.max_workers = 2;
            cfg.parallel.max_attempts_per_task = 2;
        },
    );
    // A fails only after B has saved its own checkpoint.
    let executor = ScriptedExecutor::new().script(
        "A",
        vec![ScriptedStep::fail_after_peer_starts("B", "partial.txt", "half\n")],
    );
    let (summary, _) = harness.run(&executor, &ScriptedVerifier::new(), RunOptions::default());

    assert_eq!(summary.stop, RunStop::Complete);
    let a = summary.outcome("A").expect("A");
    assert_eq!(a.kind, OutcomeKind::Passed, "reason: {:?}", a.reason);
    assert_eq!(a.attempts, 2);
    assert_eq!(summary.outcome("B").expect("B").kind, OutcomeKind::Passed);
    assert!(harness.exists_on_main("A.txt"));
    assert!(harness.exists_on_main("B.txt"));
    assert!(!harness.exists_on_main("partial.txt"));

    let state = harness.store.load().expect("state");
    assert_eq!(state.metrics.total_rollbacks, 1);
    assert!(state.agents.is_empty());
}

#[test]
fn conflicting_tasks_run_in_separate_sub_waves() {
    let harness = Harness::new(
        json!({
            "tasks": [
                spec_task("A", "Update src/shared.py with the parser", &[]),
                spec_task("B", "Also change src/shared.py for output", &[]),
                spec_task("C", "Write docs/guide.md", &[]),
            ],
        }),
        |_| {},
    );
    let executor = ScriptedExecutor::new()
        .script("A", vec![ScriptedStep::write("src/shared.py", "parser = 1\n")])
        .script(
            "B",
            vec![ScriptedStep::write("src/shared.py", "parser = 1\noutput = 2\n")],
        );
    let (summary, events) = harness.run(&executor, &ScriptedVerifier::new(), RunOptions::default());

    assert_eq!(summary.stop, RunStop::Complete);
    assert_eq!(summary.completed(), 3);
    let split = events
        .iter()
        .find_map(|event| match event {
            ProgressEvent::SubWaveSplit {
                groups, conflicts, ..
            } => Some((groups.clone(), *conflicts)),
            _ => None,
        })
        .expect("split event");
    assert_eq!(split.1, 1);
    assert_eq!(split.0.len(), 2);
    assert!(
        split
            .0
            .iter()
            .all(|group| !(group.contains(&"A".to_string()) && group.contains(&"B".to_string())))
    );
    // B started from main after A merged, so both edits survive.
    assert_eq!(harness.repo.read("src/shared.py"), "parser = 1\noutput = 2\n");
}

#[test]
fn failing_verification_rolls_back_and_retries() {
    let harness = Harness::new(
        json!({ "tasks": [spec_task("A", "Build src/app.py", &[])] }),
        |_| {},
    );
    let executor = ScriptedExecutor::new().script(
        "A",
        vec![
            ScriptedStep::write("BROKEN", "oops\n"),
            ScriptedStep::write("A.txt", "fixed\n"),
        ],
    );
    let verifier = ScriptedVerifier::fail_if_present("BROKEN");
    let (summary, events) = harness.run(&executor, &verifier, RunOptions::default());

    let outcome = summary.outcome("A").expect("A");
    assert_eq!(outcome.kind, OutcomeKind::Passed);
    assert_eq!(outcome.attempts, 2);
    assert!(harness.exists_on_main("A.txt"));
    assert!(!harness.exists_on_main("BROKEN"));

    let retry_prompt = &executor.prompts_for("A")[1];
    assert!(retry_prompt.contains("verification failed: tests"));

    let stats = harness.ledger().get_stats().expect("stats");
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.tests_run, 1);

    let statuses: Vec<WorktreeStatus> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::TaskStatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            WorktreeStatus::Executing,
            WorktreeStatus::Verifying,
            WorktreeStatus::Failed,
            WorktreeStatus::Executing,
            WorktreeStatus::Verifying,
            WorktreeStatus::Passed,
        ]
    );
}

#[test]
fn open_circuit_breaker_stops_the_run() {
    let harness = Harness::new(
        json!({
            "tasks": [
                spec_task("A", "Edit src/a.py", &[]),
                spec_task("X", "Edit src/x.py", &[]),
                spec_task("Y", "Edit src/y.py", &["X"]),
            ],
        }),
        |cfg| {
            cfg.parallel.max_workers = 1;
            cfg.parallel.max_attempts_per_task = 3;
            cfg.circuit_breaker.failure_threshold = 2;
        },
    );
    let executor = ScriptedExecutor::new().script(
        "A",
        vec![ScriptedStep::fail(), ScriptedStep::fail(), ScriptedStep::fail()],
    );
    let (summary, events) = harness.run(&executor, &ScriptedVerifier::new(), RunOptions::default());

    assert_eq!(summary.stop, RunStop::CircuitOpen);
    let a = summary.outcome("A").expect("A");
    assert_eq!(a.kind, OutcomeKind::Failed);
    assert_eq!(a.attempts, 2);
    let x = summary.outcome("X").expect("X");
    assert_eq!(x.kind, OutcomeKind::Skipped);
    assert!(summary.outcome("Y").is_none());
    assert_eq!(summary.waves.len(), 1);
    assert!(executor.prompts_for("X").is_empty());

    let state = harness.store.load().expect("state");
    assert_eq!(state.circuit_breakers["default"].state, BreakerState::Open);
    assert!(events.iter().any(|event| matches!(
        event,
        ProgressEvent::CircuitBreakerTripped { failures: 2, .. }
    )));
}

#[test]
fn interrupted_task_is_kept_and_resumed_by_the_next_run() {
    let harness = Harness::new(
        json!({
            "tasks": [
                spec_task("A", "Edit src/a.py", &[]),
                spec_task("B", "Edit src/b.py", &["A"]),
            ],
        }),
        |_| {},
    );
    let executor = ScriptedExecutor::new().script("A", vec![ScriptedStep::Interrupt]);
    let (summary, _) = harness.run(&executor, &ScriptedVerifier::new(), RunOptions::default());

    assert_eq!(summary.stop, RunStop::Interrupted);
    assert_eq!(summary.outcome("A").expect("A").kind, OutcomeKind::Interrupted);
    assert!(summary.outcome("B").is_none());
    let kept = harness.worktrees.load_state("A").expect("load").expect("kept");
    assert_eq!(kept.status, WorktreeStatus::Failed);
    assert_eq!(
        harness.store.load().expect("state").loop_state.phase,
        LoopPhase::Interrupted
    );

    let (summary, _) = harness.run(&executor, &ScriptedVerifier::new(), RunOptions::default());
    assert_eq!(summary.stop, RunStop::Complete);
    assert_eq!(summary.completed(), 2);
    assert!(harness.exists_on_main("A.txt"));
    assert!(harness.exists_on_main("B.txt"));
}

#[cfg(unix)]
#[test]
fn cancelling_a_live_executor_rolls_back_and_records_the_interrupt() {
    let harness = Harness::new(
        json!({ "tasks": [spec_task("A", "Edit src/a.py", &[])] }),
        |_| {},
    );
    let executor = CliExecutor::new(
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo partial > partial.txt; sleep 20".to_string(),
        ],
        "sh",
    );
    let worktree = harness.worktrees.worktree_path("A");
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let watcher = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !worktree.join("partial.txt").exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        trigger.cancel();
    });

    let started = Instant::now();
    let (summary, _) = harness.run_with(
        &executor,
        &ScriptedVerifier::new(),
        RunOptions::default(),
        cancel,
    );
    watcher.join().expect("watcher");

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(summary.stop, RunStop::Interrupted);
    let a = summary.outcome("A").expect("A");
    assert_eq!(a.kind, OutcomeKind::Interrupted);

    let entry = harness
        .ledger()
        .get_entry(a.last_provenance_id().expect("entry id"))
        .expect("get")
        .expect("entry");
    assert_eq!(entry.status, ProvenanceStatus::Rejected);
    assert_eq!(entry.verification_notes.as_deref(), Some("interrupted"));

    let state = harness.store.load().expect("state");
    assert_eq!(state.loop_state.phase, LoopPhase::Interrupted);
    assert!(state.loop_state.interrupted_at.is_some());
    assert!(!state.parallel.active);

    let kept = harness.worktrees.load_state("A").expect("load").expect("kept");
    assert!(!kept.path.join("partial.txt").exists());
    assert!(Git::new(&kept.path).status_porcelain().expect("status").is_empty());
}

#[test]
fn store_failure_aborts_the_run_and_clears_the_parallel_flag() {
    let harness = Harness::new(
        json!({
            "tasks": [
                spec_task("A", "Edit src/a.py", &[]),
                spec_task("B", "Edit src/b.py", &["A"]),
            ],
        }),
        |_| {},
    );
    let executor = ScriptedExecutor::new().script("A", vec![ScriptedStep::LockTimeout]);
    let (result, events) = harness.try_run(
        &executor,
        &ScriptedVerifier::new(),
        RunOptions::default(),
        CancelToken::new(),
    );

    let err = result.expect_err("store failure");
    assert!(orchestrator::error::is_store_level(&err));
    let state = harness.store.load().expect("state");
    assert!(!state.parallel.active);
    assert_ne!(state.loop_state.phase, LoopPhase::Execute);
    assert!(executor.prompts_for("B").is_empty());
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, ProgressEvent::RunFinished { .. }))
    );
}

#[test]
fn first_wave_only_stops_after_one_wave() {
    let harness = Harness::new(
        json!({
            "tasks": [
                spec_task("A", "Edit src/a.py", &[]),
                spec_task("B", "Edit src/b.py", &["A"]),
            ],
        }),
        |_| {},
    );
    let opts = RunOptions {
        run_all: false,
        squash: false,
    };
    let (summary, _) = harness.run(&ScriptedExecutor::new(), &ScriptedVerifier::new(), opts);

    assert_eq!(summary.stop, RunStop::FirstWaveOnly);
    assert_eq!(summary.waves.len(), 1);
    assert!(harness.exists_on_main("A.txt"));
    let pending: Vec<String> = harness
        .source
        .pending()
        .expect("pending")
        .into_iter()
        .map(|task| task.id)
        .collect();
    assert_eq!(pending, vec!["B".to_string()]);
}
