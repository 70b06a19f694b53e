//! Policy-gated command execution inside a snapshotted workspace.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use pipewright_common::CommandPolicy;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SandboxManager;
use super::policy::{PolicyDecision, apply_policy};
use crate::errors::{SandboxError, StepError};
use crate::util::{tail, write_atomic};

const TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Denied,
    SpawnFailed,
    Skipped,
}

impl CommandOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Denied => "denied",
            Self::SpawnFailed => "spawn_failed",
            Self::Skipped => "skipped",
        }
    }
}

/// What happened to one command. Serialized into `command_executed` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRecord {
    pub command: String,
    #[serde(default)]
    pub argv: Vec<String>,
    pub outcome: CommandOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub stdout_tail: String,
    #[serde(default)]
    pub stderr_tail: String,
    pub log_path: Option<PathBuf>,
    /// Why the command was denied, skipped or could not start.
    pub reason: Option<String>,
}

impl CommandRecord {
    fn without_execution(command: &str, outcome: CommandOutcome, reason: String) -> Self {
        Self {
            command: command.to_string(),
            argv: Vec::new(),
            outcome,
            exit_code: None,
            duration_ms: 0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            log_path: None,
            reason: Some(reason),
        }
    }

    /// Map the record onto the single tool-execution failure signal.
    pub fn check(&self) -> Result<(), StepError> {
        match self.outcome {
            CommandOutcome::Succeeded | CommandOutcome::Skipped => Ok(()),
            CommandOutcome::Denied => Err(SandboxError::PolicyDenied {
                command: self.command.clone(),
                reason: self.reason.clone().unwrap_or_default(),
            }
            .into()),
            CommandOutcome::Failed => {
                let code = self
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let detail = if self.stderr_tail.trim().is_empty() {
                    self.stdout_tail.trim()
                } else {
                    self.stderr_tail.trim()
                };
                Err(StepError::ToolExecution(format!(
                    "`{}` exited with {}: {}",
                    self.command,
                    code,
                    tail(detail, 500)
                )))
            }
            CommandOutcome::TimedOut => Err(StepError::ToolExecution(format!(
                "`{}` timed out after {} ms",
                self.command, self.duration_ms
            ))),
            CommandOutcome::Cancelled => Err(StepError::ToolExecution(format!(
                "`{}` was cancelled",
                self.command
            ))),
            CommandOutcome::SpawnFailed => Err(StepError::ToolExecution(format!(
                "`{}` could not be started: {}",
                self.command,
                self.reason.as_deref().unwrap_or("unknown error")
            ))),
        }
    }
}

/// Runs commands for one run, inside its workspace, while its snapshot is live.
pub struct CommandRunner {
    sandbox: SandboxManager,
    run_id: String,
    workdir: PathBuf,
    log_dir: PathBuf,
    policy: CommandPolicy,
    dry_run: bool,
    cancel: CancellationToken,
    counter: AtomicUsize,
    records: Mutex<Vec<CommandRecord>>,
}

impl CommandRunner {
    pub fn new(
        sandbox: SandboxManager,
        run_id: impl Into<String>,
        workdir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        policy: CommandPolicy,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sandbox,
            run_id: run_id.into(),
            workdir: workdir.into(),
            log_dir: log_dir.into(),
            policy,
            dry_run,
            cancel,
            counter: AtomicUsize::new(0),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run `command` and fail with a tool-execution error unless it succeeded
    /// or was skipped.
    pub async fn run_checked(&self, command: &str) -> Result<CommandRecord, StepError> {
        let record = self.run(command).await;
        record.check()?;
        Ok(record)
    }

    /// Run `command`. Never errors; the outcome is in the record.
    pub async fn run(&self, command: &str) -> CommandRecord {
        let record = self.execute(command).await;
        match record.outcome {
            CommandOutcome::Succeeded | CommandOutcome::Skipped => info!(
                run_id = %self.run_id,
                command,
                outcome = record.outcome.as_str(),
                duration_ms = record.duration_ms,
                "Command finished"
            ),
            _ => warn!(
                run_id = %self.run_id,
                command,
                outcome = record.outcome.as_str(),
                exit_code = ?record.exit_code,
                reason = ?record.reason,
                "Command did not succeed"
            ),
        }
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        record
    }

    /// Records accumulated since the last drain, oldest first.
    pub fn drain_records(&self) -> Vec<CommandRecord> {
        self.records
            .lock()
            .map(|mut records| std::mem::take(&mut *records))
            .unwrap_or_default()
    }

    async fn execute(&self, command: &str) -> CommandRecord {
        if self.dry_run {
            return CommandRecord::without_execution(
                command,
                CommandOutcome::Skipped,
                "dry-run".to_string(),
            );
        }

        let argv = match apply_policy(command, &self.policy) {
            PolicyDecision::Allow { argv } => argv,
            PolicyDecision::Deny { reason } => {
                return CommandRecord::without_execution(command, CommandOutcome::Denied, reason);
            }
        };
        if let Err(e) = self.sandbox.ensure_live(&self.run_id) {
            return CommandRecord::without_execution(
                command,
                CommandOutcome::Denied,
                e.to_string(),
            );
        }
        if self.cancel.is_cancelled() {
            return CommandRecord::without_execution(
                command,
                CommandOutcome::Cancelled,
                "run cancelled before the command started".to_string(),
            );
        }

        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let log_path = self.log_dir.join(format!("{:03}-{}.log", seq, log_stem(&argv[0])));
        let timeout = Duration::from_secs(self.policy.command_timeout_secs);
        debug!(run_id = %self.run_id, ?argv, cwd = %self.workdir.display(), "Spawning command");

        let started = Instant::now();
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let mut record = CommandRecord::without_execution(
                    command,
                    CommandOutcome::SpawnFailed,
                    e.to_string(),
                );
                record.argv = argv;
                return record;
            }
        };

        // Dropping the wait future kills the child (kill_on_drop).
        let (outcome, exit_code, stdout, stderr, reason) = tokio::select! {
            waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
                Ok(Ok(output)) => {
                    let outcome = if output.status.success() {
                        CommandOutcome::Succeeded
                    } else {
                        CommandOutcome::Failed
                    };
                    (
                        outcome,
                        output.status.code(),
                        String::from_utf8_lossy(&output.stdout).into_owned(),
                        String::from_utf8_lossy(&output.stderr).into_owned(),
                        None,
                    )
                }
                Ok(Err(e)) => (
                    CommandOutcome::SpawnFailed,
                    None,
                    String::new(),
                    String::new(),
                    Some(e.to_string()),
                ),
                Err(_) => (
                    CommandOutcome::TimedOut,
                    None,
                    String::new(),
                    String::new(),
                    Some(format!("timeout of {}s exceeded", timeout.as_secs())),
                ),
            },
            _ = self.cancel.cancelled() => (
                CommandOutcome::Cancelled,
                None,
                String::new(),
                String::new(),
                Some("run cancelled".to_string()),
            ),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut record = CommandRecord {
            command: command.to_string(),
            argv,
            outcome,
            exit_code,
            duration_ms,
            stdout_tail: tail(&stdout, TAIL_CHARS),
            stderr_tail: tail(&stderr, TAIL_CHARS),
            log_path: None,
            reason,
        };
        match write_log(&log_path, &self.workdir, &record, &stdout, &stderr) {
            Ok(()) => record.log_path = Some(log_path),
            Err(e) => warn!(path = %log_path.display(), error = %e, "Failed to write command log"),
        }
        record
    }
}

fn log_stem(program: &str) -> String {
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "command".to_string());
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn write_log(
    path: &Path,
    workdir: &Path,
    record: &CommandRecord,
    stdout: &str,
    stderr: &str,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let exit = record
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());
    let text = format!(
        "$ {}\ncwd: {}\noutcome: {}\nexit_code: {}\nduration_ms: {}\n\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        record.command,
        workdir.display(),
        record.outcome.as_str(),
        exit,
        record.duration_ms,
        stdout,
        stderr,
    );
    write_atomic(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        sandbox: SandboxManager,
        workdir: PathBuf,
        log_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("workspace");
        std::fs::create_dir_all(&workdir).unwrap();
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        sandbox.snapshot("run-1", &workdir).unwrap();
        let log_dir = dir.path().join("runs/run-1/commands");
        Fixture {
            _dir: dir,
            sandbox,
            workdir,
            log_dir,
        }
    }

    fn open_policy(allow: &[&str]) -> CommandPolicy {
        CommandPolicy {
            allow_cli_tools: true,
            allow: allow.iter().map(|s| s.to_string()).collect(),
            ..CommandPolicy::default()
        }
    }

    fn runner(fx: &Fixture, policy: CommandPolicy, dry_run: bool) -> CommandRunner {
        CommandRunner::new(
            fx.sandbox.clone(),
            "run-1",
            &fx.workdir,
            &fx.log_dir,
            policy,
            dry_run,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_allowed_command_runs_and_logs() {
        let fx = fixture();
        let runner = runner(&fx, open_policy(&["echo"]), false);

        let record = runner.run_checked("echo 'hello sandbox'").await.unwrap();
        assert_eq!(record.outcome, CommandOutcome::Succeeded);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.argv, vec!["echo", "hello sandbox"]);
        assert!(record.stdout_tail.contains("hello sandbox"));

        let log = std::fs::read_to_string(record.log_path.unwrap()).unwrap();
        assert!(log.contains("$ echo 'hello sandbox'"));
        assert!(log.contains("hello sandbox"));
        assert_eq!(runner.drain_records().len(), 1);
        assert!(runner.drain_records().is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_tool_execution_error() {
        let fx = fixture();
        let runner = runner(&fx, open_policy(&["false"]), false);
        let err = runner.run_checked("false").await.unwrap_err();
        assert!(matches!(err, StepError::ToolExecution(_)));
        assert_eq!(runner.drain_records()[0].outcome, CommandOutcome::Failed);
    }

    #[tokio::test]
    async fn test_denied_command_never_spawns() {
        let fx = fixture();
        let runner = runner(&fx, open_policy(&["echo"]), false);
        let record = runner.run("touch created.txt").await;
        assert_eq!(record.outcome, CommandOutcome::Denied);
        assert!(!fx.workdir.join("created.txt").exists());
        assert!(matches!(record.check(), Err(StepError::ToolExecution(_))));
    }

    #[tokio::test]
    async fn test_dry_run_skips() {
        let fx = fixture();
        let runner = runner(&fx, CommandPolicy::default(), true);
        let record = runner.run_checked("pytest -q").await.unwrap();
        assert_eq!(record.outcome, CommandOutcome::Skipped);
        assert_eq!(record.reason.as_deref(), Some("dry-run"));
        assert!(record.log_path.is_none());
    }

    #[tokio::test]
    async fn test_requires_live_snapshot() {
        let fx = fixture();
        fx.sandbox.discard("run-1").unwrap();
        let runner = runner(&fx, open_policy(&["echo"]), false);
        let record = runner.run("echo hi").await;
        assert_eq!(record.outcome, CommandOutcome::Denied);
        assert!(record.reason.unwrap().contains("No live snapshot"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let fx = fixture();
        let policy = CommandPolicy {
            command_timeout_secs: 1,
            ..open_policy(&["sleep"])
        };
        let runner = runner(&fx, policy, false);
        let started = Instant::now();
        let record = runner.run("sleep 10").await;
        assert_eq!(record.outcome, CommandOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let fx = fixture();
        let token = CancellationToken::new();
        let runner = CommandRunner::new(
            fx.sandbox.clone(),
            "run-1",
            &fx.workdir,
            &fx.log_dir,
            open_policy(&["sleep"]),
            false,
            token.clone(),
        );
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let record = runner.run("sleep 10").await;
        cancel.await.unwrap();
        assert_eq!(record.outcome, CommandOutcome::Cancelled);
        assert!(matches!(record.check(), Err(StepError::ToolExecution(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let fx = fixture();
        let runner = runner(&fx, open_policy(&["definitely-not-installed-xyz"]), false);
        let record = runner.run("definitely-not-installed-xyz --version").await;
        assert_eq!(record.outcome, CommandOutcome::SpawnFailed);
    }
}
