//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared cancellation flag, cloned into every worker of a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Bytes kept from one output stream, plus how many were dropped past the limit.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// `[<label> dropped N bytes]` line, or nothing when the stream fit.
    pub fn notice(&self, label: &str) -> String {
        match self.dropped {
            0 => String::new(),
            n => format!("\n[{label} dropped {n} bytes]\n"),
        }
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    /// Exited normally with status 0.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.success()
    }
}

/// Start `cmd` in a process group of its own.
///
/// A terminal interrupt then reaches only the orchestrator, which cancels
/// and rolls back before it kills the group itself.
pub fn own_process_group(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// Kill the child and everything it spawned.
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).context("kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// When `cancel` fires the child's process group is killed and the output is marked `cancelled`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    own_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_reader = thread::spawn(move || drain_bounded(stdout, output_limit_bytes));
    let stderr_reader = thread::spawn(move || drain_bounded(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading its input closes the pipe early.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "child closed stdin before reading the full input");
        }
    }

    let started = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let elapsed = started.elapsed();
        let slice = timeout.saturating_sub(elapsed).min(POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, killing");
            cancelled = true;
        } else if started.elapsed() >= timeout {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        kill_tree(&mut child)?;
        break child.wait().context("wait command after kill")?;
    };

    let stdout = collect(stdout_reader).context("collect stdout")?;
    let stderr = collect(stderr_reader).context("collect stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(stdout_dropped = stdout.dropped, stderr_dropped = stderr.dropped, "output over limit");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
        cancelled,
    })
}

fn collect(reader: thread::JoinHandle<Result<Captured>>) -> Result<Captured> {
    reader
        .join()
        .unwrap_or_else(|_| Err(anyhow!("output reader thread panicked")))
}

/// Read `source` to EOF so the child never blocks on a full pipe, keeping
/// at most `limit` bytes.
fn drain_bounded(mut source: impl Read, limit: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let read = source.read(&mut chunk).context("read output")?;
        if read == 0 {
            return Ok(captured);
        }
        let room = limit.saturating_sub(captured.bytes.len()).min(read);
        captured.bytes.extend_from_slice(&chunk[..room]);
        captured.dropped += read - room;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn sleep_five() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        cmd
    }

    #[test]
    fn captures_stdout_and_stdin() {
        let out = run_command_with_timeout(
            sh("cat"),
            Some(b"hello".as_slice()),
            Duration::from_secs(5),
            1024,
            None,
        )
        .expect("run");
        assert!(out.succeeded());
        assert_eq!(out.stdout.text(), "hello");
    }

    #[test]
    fn truncates_beyond_limit() {
        let out = run_command_with_timeout(
            sh("printf 0123456789"),
            None,
            Duration::from_secs(5),
            4,
            None,
        )
        .expect("run");
        assert_eq!(out.stdout.bytes, b"0123");
        assert_eq!(out.stdout.dropped, 6);
        assert_eq!(out.stdout.notice("check"), "\n[check dropped 6 bytes]\n");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_timeout(
            sleep_five(),
            None,
            Duration::from_millis(200),
            1024,
            None,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.succeeded());
    }

    #[test]
    fn kills_when_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        let out = run_command_with_timeout(
            sleep_five(),
            None,
            Duration::from_secs(30),
            1024,
            Some(&token),
        )
        .expect("run");
        assert!(out.cancelled);
        assert!(!out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancel_kills_grandchildren_holding_the_pipes() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            trigger.cancel();
        });
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("echo partial; sleep 20; echo never"),
            None,
            Duration::from_secs(60),
            1024,
            Some(&token),
        )
        .expect("run");
        canceller.join().expect("canceller");
        assert!(out.cancelled);
        assert_eq!(out.stdout.text(), "partial\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
