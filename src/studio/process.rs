//! External process runner.
//!
//! Spawns a tool, streams its output line by line into a [`LogSink`] and
//! resolves with a [`ProcessOutcome`]. Nothing here returns an error: a tool
//! that cannot be started resolves `spawn_failed` so callers can treat
//! "missing" and "exited non-zero" through the same path.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::models::LogLevel;

/// How many trailing stdout lines an outcome keeps.
const DEFAULT_TAIL_LINES: usize = 50;

/// How long to keep reading buffered output after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives each output line as it is produced.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn emit(&self, level: LogLevel, message: String);
}

/// A fully resolved command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overlaid on the orchestrator's own environment.
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub canceled: bool,
    /// The process never started (executable or working directory missing,
    /// permission denied).
    pub spawn_failed: bool,
    pub stdout_tail: Vec<String>,
}

impl ProcessOutcome {
    fn spawn_failure() -> Self {
        Self {
            spawn_failed: true,
            ..Default::default()
        }
    }

    fn canceled() -> Self {
        Self {
            canceled: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
    tail_lines: usize,
}

impl ProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            kill_grace,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Run `spec` to completion or until `cancel` fires.
    ///
    /// On cancellation the child receives SIGTERM, then SIGKILL once the
    /// grace period has elapsed.
    pub async fn run(
        &self,
        spec: &ProcessSpec,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        if cancel.is_cancelled() {
            return ProcessOutcome::canceled();
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(program = %spec.program, error = %e, "spawn failed");
                sink.emit(
                    LogLevel::Error,
                    format!("Failed to start {}: {}", spec.program, e),
                )
                .await;
                return ProcessOutcome::spawn_failure();
            }
        };
        let pid = child.id();

        let (tx, mut rx) = mpsc::channel::<(LogLevel, String)>(256);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, LogLevel::Info, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, LogLevel::Error, tx.clone())));
        }
        drop(tx);

        let mut tail = VecDeque::with_capacity(self.tail_lines);
        let mut canceled = false;
        let mut kill_at: Option<Instant> = None;

        let status = loop {
            tokio::select! {
                Some((level, line)) = rx.recv() => {
                    self.record(&mut tail, level, &line);
                    sink.emit(level, line).await;
                }
                status = child.wait() => break status,
                _ = cancel.cancelled(), if !canceled => {
                    canceled = true;
                    tracing::debug!(program = %spec.program, ?pid, "terminating on cancel");
                    terminate(pid, &mut child);
                    kill_at = Some(Instant::now() + self.kill_grace);
                }
                _ = sleep_until_opt(kill_at), if kill_at.is_some() => {
                    tracing::debug!(program = %spec.program, ?pid, "grace period elapsed, killing");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(program = %spec.program, error = %e, "failed to kill process");
                    }
                    kill_at = None;
                }
            }
        };

        // Flush whatever the readers still hold, including a trailing partial line.
        loop {
            match tokio::time::timeout(DRAIN_TIMEOUT, rx.recv()).await {
                Ok(Some((level, line))) => {
                    self.record(&mut tail, level, &line);
                    sink.emit(level, line).await;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(program = %spec.program, "output still open after exit");
                    break;
                }
            }
        }
        for reader in readers {
            reader.abort();
        }

        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        if let Err(ref e) = status {
            sink.emit(
                LogLevel::Error,
                format!("Failed to wait for {}: {}", spec.program, e),
            )
            .await;
        }
        let ok = !canceled && status.as_ref().is_ok_and(|s| s.success());

        ProcessOutcome {
            ok,
            exit_code,
            canceled,
            spawn_failed: false,
            stdout_tail: tail.into_iter().collect(),
        }
    }

    fn record(&self, tail: &mut VecDeque<String>, level: LogLevel, line: &str) {
        if level != LogLevel::Info || self.tail_lines == 0 {
            return;
        }
        if tail.len() == self.tail_lines {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Read `reader` to EOF, forwarding each line. Invalid UTF-8 is replaced
/// rather than aborting the stream.
async fn forward_lines<R>(reader: R, level: LogLevel, tx: mpsc::Sender<(LogLevel, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send((level, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output stream read failed");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn terminate(pid: Option<u32>, child: &mut tokio::process::Child) {
    match pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
        Some(pid) => unsafe {
            libc::kill(pid, libc::SIGTERM);
        },
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>, child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::{CollectingSink, shell};
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_stdout_is_info_and_stderr_is_error() {
        let sink = CollectingSink::default();
        let outcome = runner()
            .run(&shell("echo out; echo err >&2"), &sink, &CancellationToken::new())
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.exit_code, Some(0));
        let lines = sink.lines();
        assert!(lines.contains(&(LogLevel::Info, "out".to_string())));
        assert!(lines.contains(&(LogLevel::Error, "err".to_string())));
        assert_eq!(outcome.stdout_tail, vec!["out".to_string()]);
    }

    #[tokio::test]
    async fn test_partial_last_line_is_flushed_on_exit() {
        let sink = CollectingSink::default();
        let outcome = runner()
            .run(&shell("printf 'first\\nsecond'"), &sink, &CancellationToken::new())
            .await;
        assert!(outcome.ok);
        assert_eq!(sink.messages(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_ok() {
        let sink = CollectingSink::default();
        let outcome = runner()
            .run(&shell("echo working; exit 3"), &sink, &CancellationToken::new())
            .await;
        assert!(!outcome.ok);
        assert!(!outcome.canceled);
        assert!(!outcome.spawn_failed);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_spawn_failure_resolves_with_one_error_line() {
        let sink = CollectingSink::default();
        let spec = ProcessSpec::new("/nonexistent/studio-tool");
        let outcome = runner().run(&spec, &sink, &CancellationToken::new()).await;
        assert!(!outcome.ok);
        assert!(outcome.spawn_failed);
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Error);
        assert!(lines[0].1.contains("/nonexistent/studio-tool"));
    }

    #[tokio::test]
    async fn test_missing_working_directory_is_a_spawn_failure() {
        let sink = CollectingSink::default();
        let mut spec = shell("echo hi");
        spec.cwd = Some(PathBuf::from("/nonexistent/studio-cwd"));
        let outcome = runner().run(&spec, &sink, &CancellationToken::new()).await;
        assert!(outcome.spawn_failed);
    }

    #[tokio::test]
    async fn test_env_overlay_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::default();
        let mut spec = shell("echo \"$STUDIO_TEST_VALUE\"; pwd");
        spec.env.insert("STUDIO_TEST_VALUE".into(), "overlay".into());
        spec.cwd = Some(dir.path().to_path_buf());
        let outcome = runner().run(&spec, &sink, &CancellationToken::new()).await;
        assert!(outcome.ok);
        let messages = sink.messages();
        assert_eq!(messages[0], "overlay");
        let canonical = dir.path().canonicalize().unwrap();
        assert!(messages[1].ends_with(canonical.file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_cancel_terminates_running_process() {
        let sink = CollectingSink::default();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = runner().run(&shell("echo begin; sleep 30"), &sink, &token).await;
        assert!(outcome.canceled);
        assert!(!outcome.ok);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(sink.messages(), vec!["begin"]);
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill_when_term_is_ignored() {
        let sink = CollectingSink::default();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = runner()
            .run(&shell("trap '' TERM; exec sleep 30"), &sink, &token)
            .await;
        assert!(outcome.canceled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_already_canceled_token_never_spawns() {
        let sink = CollectingSink::default();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = runner().run(&shell("echo never"), &sink, &token).await;
        assert!(outcome.canceled);
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_stdout_tail_is_bounded() {
        let sink = CollectingSink::default();
        let mut runner = runner();
        runner.tail_lines = 3;
        let outcome = runner
            .run(&shell("for i in 1 2 3 4 5; do echo $i; done"), &sink, &CancellationToken::new())
            .await;
        assert_eq!(outcome.stdout_tail, vec!["3", "4", "5"]);
    }
}
