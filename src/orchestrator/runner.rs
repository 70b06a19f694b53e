use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pipewright_common::{
    ErrorKind, EventType, Persona, PersonaOutput, Run, RunConfig, RunStatus, Severity,
    StepOutcome, StepStatus,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::state::{PipelineState, StateMachine};
use crate::audit::AuditMirror;
use crate::errors::{OrchestratorError, PackagingError, SandboxError, StepError, StoreError};
use crate::packager::{BundleReport, Packager};
use crate::persona::{LlmClient, PersonaStep, RetryContext, StepEnv, StepInput, default_steps};
use crate::sandbox::{CommandRunner, SandboxManager};
use crate::store::StoreHandle;

/// Where the orchestrator writes outside the store.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Audit mirror and command logs, one directory per run.
    pub runs_dir: PathBuf,
    /// Bundles.
    pub dist_dir: PathBuf,
    pub llm_timeout: Duration,
}

/// A run that reached `Completed`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,
    pub bundle: Option<BundleReport>,
}

/// Sequences the personas of one run at a time.
pub struct Orchestrator {
    pub(crate) store: StoreHandle,
    pub(crate) sandbox: SandboxManager,
    llm: Arc<dyn LlmClient>,
    steps: Vec<Box<dyn PersonaStep>>,
    pub(crate) options: OrchestratorOptions,
    cancel: CancellationToken,
}

/// How a step attempt ended, before it is written to the store.
enum Attempt {
    Succeeded {
        output: PersonaOutput,
        tool_call_ids: Vec<String>,
    },
    Failed(StepError),
}

impl Orchestrator {
    pub fn new(
        store: StoreHandle,
        sandbox: SandboxManager,
        llm: Arc<dyn LlmClient>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            sandbox,
            llm,
            steps: default_steps(),
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the persona implementations. They must cover the pipeline in order.
    pub fn with_steps(mut self, steps: Vec<Box<dyn PersonaStep>>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn check_pipeline(&self) -> Result<(), OrchestratorError> {
        let personas: Vec<Persona> = self.steps.iter().map(|s| s.persona()).collect();
        if personas != Persona::PIPELINE {
            return Err(OrchestratorError::Validation(format!(
                "persona steps must be {:?}, got {:?}",
                Persona::PIPELINE,
                personas
            )));
        }
        Ok(())
    }

    /// Create, execute and finish one run.
    pub async fn execute(&self, config: RunConfig) -> Result<RunOutcome, OrchestratorError> {
        self.check_pipeline()?;
        let run = self
            .store
            .call(move |db| db.create_run(&config))
            .await?;
        let run_id = run.run_id.clone();
        let config = run.config.clone();
        let mut machine = StateMachine::new(self.steps.len());
        info!(run_id = %run_id, target = %config.target_path.display(), dry_run = config.dry_run, "Run created");

        // Created -> Snapshotting
        machine.advance(PipelineState::Snapshotting)?;
        let id = run_id.clone();
        self.store.call(move |db| db.start_run(&id)).await?;

        if let Err(source) = self.take_snapshot(&run_id, &config).await {
            error!(run_id = %run_id, error = %source, "Snapshot failed; no persona will run");
            machine.advance(PipelineState::RollingBack)?;
            self.event(
                &run_id,
                EventType::RollbackInitiated,
                Severity::Warning,
                "Rolling back after snapshot failure".to_string(),
                Some(json!({ "cause": "snapshot_failed" })),
            )
            .await;
            self.event(
                &run_id,
                EventType::RollbackCompleted,
                Severity::Info,
                "Snapshot failed, workspace never mutated".to_string(),
                None,
            )
            .await;
            machine.advance(PipelineState::Failed)?;
            self.fail_run(&run_id, format!("snapshot_failed: {}", source))
                .await?;
            self.mirror(&run_id).await;
            return Err(OrchestratorError::Snapshot { run_id, source });
        }

        let mirror = AuditMirror::new(&self.options.runs_dir, &run_id);
        let runner = CommandRunner::new(
            self.sandbox.clone(),
            &run_id,
            &config.target_path,
            mirror.commands_dir(),
            config.policy.clone(),
            config.dry_run,
            self.cancel.clone(),
        );

        // From here on the workspace may be mutated, so every exit goes
        // through RollingBack.
        let mut prior: Vec<PersonaOutput> = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            let persona = step.persona();
            let result = match machine.advance(PipelineState::Running(index)) {
                Ok(()) => {
                    self.run_persona(&run_id, &config, step.as_ref(), &runner, &prior)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(Ok(output)) => prior.push(output),
                Ok(Err(err)) => {
                    machine.advance(PipelineState::RollingBack)?;
                    let result = self.roll_back(&run_id, &config, persona, &err).await;
                    machine.advance(PipelineState::Failed)?;
                    self.mirror(&run_id).await;
                    return Err(result.unwrap_or_else(|e| e));
                }
                Err(fault) => {
                    return Err(self
                        .abort(&run_id, &config, &mut machine, persona, fault)
                        .await);
                }
            }
        }

        let committed = match machine.advance(PipelineState::Packaging) {
            Ok(()) => {
                let id = run_id.clone();
                self.store
                    .call(move |db| db.complete_run(&id, RunStatus::Succeeded, None))
                    .await
                    .map_err(OrchestratorError::from)
            }
            Err(e) => Err(e),
        };
        let run = match committed {
            Ok(run) => run,
            Err(fault) => {
                return Err(self
                    .abort(&run_id, &config, &mut machine, Persona::Documentation, fault)
                    .await);
            }
        };

        let bundle = self.finish(&run_id, &config).await;
        machine.advance(PipelineState::Completed)?;
        self.mirror(&run_id).await;

        info!(run_id = %run_id, status = %run.status, "Run finished");
        Ok(RunOutcome {
            run,
            bundle: bundle.map_err(|source| OrchestratorError::Packaging {
                run_id: run_id.clone(),
                source,
            })?,
        })
    }

    async fn take_snapshot(&self, run_id: &str, config: &RunConfig) -> Result<(), SandboxError> {
        if config.dry_run {
            self.event(
                run_id,
                EventType::SnapshotSkipped,
                Severity::Info,
                "Dry run: workspace is not mutated, snapshot skipped".to_string(),
                None,
            )
            .await;
            return Ok(());
        }

        let sandbox = self.sandbox.clone();
        let id = run_id.to_string();
        let target = config.target_path.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            let snapshot = sandbox.snapshot(&id, &target)?;
            // An absent target is created so personas and commands have a workspace.
            std::fs::create_dir_all(&target).map_err(|e| SandboxError::io(&target, e))?;
            Ok::<_, SandboxError>(snapshot)
        })
        .await
        .map_err(|e| SandboxError::Snapshot {
            run_id: run_id.to_string(),
            target: config.target_path.clone(),
            reason: format!("snapshot task panicked: {}", e),
        })??;

        self.event(
            run_id,
            EventType::SnapshotCreated,
            Severity::Info,
            format!(
                "Snapshot of {} taken ({} entries, {} bytes)",
                snapshot.target_path.display(),
                snapshot.entries,
                snapshot.bytes
            ),
            Some(json!({
                "origin": snapshot.origin,
                "digest": snapshot.digest,
                "entries": snapshot.entries,
                "bytes": snapshot.bytes,
            })),
        )
        .await;
        Ok(())
    }

    /// Run one persona with at most one fix-forward retry.
    ///
    /// The outer result carries store failures; the inner one the step's
    /// terminal error, which the caller turns into a rollback.
    async fn run_persona(
        &self,
        run_id: &str,
        config: &RunConfig,
        step: &dyn PersonaStep,
        runner: &CommandRunner,
        prior: &[PersonaOutput],
    ) -> Result<Result<PersonaOutput, StepError>, OrchestratorError> {
        let persona = step.persona();
        let mut attempt: u32 = 1;
        let mut retry: Option<RetryContext> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Err(StepError::Cancelled));
            }

            let input = StepInput::new(run_id, persona, attempt, config, prior.to_vec(), retry.clone());
            let payload = serde_json::to_value(&input).map_err(StoreError::from)?;
            let id = run_id.to_string();
            let record = self
                .store
                .call(move |db| db.record_step(&id, persona, attempt, &payload))
                .await?;
            info!(run_id, persona = %persona, attempt, "Step started");

            let result = self.attempt(step, &input, config, runner).await;
            self.record_commands(run_id, persona, runner).await;

            match result {
                Attempt::Succeeded {
                    output,
                    tool_call_ids,
                } => {
                    let value =
                        serde_json::to_value(&output).map_err(StoreError::from)?;
                    let outcome = StepOutcome::Succeeded {
                        output: value.clone(),
                        tool_call_ids,
                    };
                    self.store
                        .call(move |db| {
                            db.finish_step_with_artifact(
                                record.id,
                                &outcome,
                                persona.artifact_name(),
                                &value,
                            )
                        })
                        .await?;
                    self.mirror(run_id).await;
                    info!(run_id, persona = %persona, attempt, "Step succeeded");
                    return Ok(Ok(output));
                }
                Attempt::Failed(err) => {
                    let outcome = StepOutcome::Failed {
                        kind: err.kind(),
                        message: err.message(),
                    };
                    self.store
                        .call(move |db| db.finish_step(record.id, &outcome))
                        .await?;
                    self.mirror(run_id).await;
                    warn!(run_id, persona = %persona, attempt, kind = %err.kind(), error = %err, "Step failed");

                    // A command killed by cancellation surfaces as a tool failure.
                    if self.cancel.is_cancelled() {
                        return Ok(Err(StepError::Cancelled));
                    }
                    if attempt > 1 || !config.fix_forward || !err.kind().is_retryable() {
                        return Ok(Err(err));
                    }
                    let context = RetryContext::from_error(&err);
                    self.event(
                        run_id,
                        EventType::StepRetry,
                        Severity::Warning,
                        format!("Retrying {} once after {} failure", persona, err.kind()),
                        Some(json!({ "persona": persona, "retry": context })),
                    )
                    .await;
                    retry = Some(context);
                    attempt += 1;
                }
            }
        }
    }

    /// Execute the persona and validate its output.
    async fn attempt(
        &self,
        step: &dyn PersonaStep,
        input: &StepInput,
        config: &RunConfig,
        runner: &CommandRunner,
    ) -> Attempt {
        let env = StepEnv::new(
            self.llm.as_ref(),
            runner,
            &config.target_path,
            &config.model,
            self.options.llm_timeout,
            config.dry_run,
            self.cancel.clone(),
        );
        let output = match step.execute(input, &env).await {
            Ok(output) => output,
            Err(err) => return Attempt::Failed(err),
        };
        if output.persona() != input.persona {
            return Attempt::Failed(StepError::Validation(format!(
                "{} persona returned a {} output",
                input.persona,
                output.persona()
            )));
        }
        if let Err(violation) = output.validate() {
            return Attempt::Failed(StepError::Validation(violation.to_string()));
        }
        Attempt::Succeeded {
            output,
            tool_call_ids: env.take_tool_call_ids(),
        }
    }

    async fn record_commands(&self, run_id: &str, persona: Persona, runner: &CommandRunner) {
        for record in runner.drain_records() {
            let severity = match record.check() {
                Ok(()) => Severity::Info,
                Err(_) => Severity::Warning,
            };
            let payload = serde_json::to_value(&record).ok();
            self.event(
                run_id,
                EventType::CommandExecuted,
                severity,
                format!("{}: `{}` {}", persona, record.command, record.outcome.as_str()),
                payload,
            )
            .await;
        }
    }

    /// RollingBack: restore the workspace and fail the run.
    ///
    /// Returns the error the caller reports; `Err` when the restore itself failed.
    async fn roll_back(
        &self,
        run_id: &str,
        config: &RunConfig,
        persona: Persona,
        err: &StepError,
    ) -> Result<OrchestratorError, OrchestratorError> {
        let step_error = match err {
            StepError::Cancelled => {
                self.event(
                    run_id,
                    EventType::Cancelled,
                    Severity::Warning,
                    format!("Run cancelled during {} persona", persona),
                    Some(json!({ "persona": persona })),
                )
                .await;
                OrchestratorError::Cancelled {
                    run_id: run_id.to_string(),
                    persona,
                }
            }
            other => OrchestratorError::StepFailed {
                run_id: run_id.to_string(),
                persona,
                kind: other.kind(),
                message: other.message(),
            },
        };

        let detail = format!("{} persona failed ({}): {}", persona, err.kind(), err.message());
        let restored = self
            .restore_workspace(
                run_id,
                config,
                format!("Rolling back workspace after {} failure", persona),
                json!({ "persona": persona, "error_kind": err.kind() }),
            )
            .await;
        self.fail_run(run_id, detail).await?;
        match restored {
            Ok(()) => Ok(step_error),
            Err(source) => Err(OrchestratorError::Rollback {
                run_id: run_id.to_string(),
                persona,
                source,
            }),
        }
    }

    /// Best-effort rollback after a fault outside the personas, such as a
    /// store write that failed. Returns the error to report.
    async fn abort(
        &self,
        run_id: &str,
        config: &RunConfig,
        machine: &mut StateMachine,
        persona: Persona,
        fault: OrchestratorError,
    ) -> OrchestratorError {
        error!(run_id, persona = %persona, error = %fault, "Run aborted; rolling back");
        if let Err(e) = machine.advance(PipelineState::RollingBack) {
            warn!(run_id, error = %e, "Abort outside the state machine");
        }
        let restored = self
            .restore_workspace(
                run_id,
                config,
                format!("Rolling back workspace after fault during {}", persona),
                json!({ "persona": persona, "fault": fault.class() }),
            )
            .await;
        if let Err(e) = machine.advance(PipelineState::Failed) {
            warn!(run_id, error = %e, "Abort outside the state machine");
        }
        let detail = format!("aborted during {}: {}", persona, fault);
        if let Err(e) = self.close_open_steps(run_id, &detail).await {
            warn!(run_id, error = %e, "Could not close steps of aborted run");
        }
        if let Err(e) = self.fail_run(run_id, detail).await {
            warn!(run_id, error = %e, "Could not mark aborted run failed");
        }
        self.mirror(run_id).await;

        match restored {
            Ok(()) => fault,
            Err(source) => OrchestratorError::Rollback {
                run_id: run_id.to_string(),
                persona,
                source,
            },
        }
    }

    /// Append `rollback_initiated`, restore from the snapshot and discard it.
    /// On restore failure the snapshot is kept and `rollback_failed` recorded.
    async fn restore_workspace(
        &self,
        run_id: &str,
        config: &RunConfig,
        message: String,
        payload: serde_json::Value,
    ) -> Result<(), SandboxError> {
        self.event(
            run_id,
            EventType::RollbackInitiated,
            Severity::Warning,
            message,
            Some(payload),
        )
        .await;

        if config.dry_run {
            self.event(
                run_id,
                EventType::RollbackCompleted,
                Severity::Info,
                "Dry run: workspace was not mutated, nothing to restore".to_string(),
                None,
            )
            .await;
            return Ok(());
        }

        let sandbox = self.sandbox.clone();
        let id = run_id.to_string();
        let restored = tokio::task::spawn_blocking(move || sandbox.restore(&id))
            .await
            .map_err(|e| SandboxError::Restore {
                run_id: run_id.to_string(),
                reason: format!("restore task panicked: {}", e),
            })
            .and_then(|r| r);

        match restored {
            Ok(snapshot) => {
                self.event(
                    run_id,
                    EventType::RollbackCompleted,
                    Severity::Info,
                    format!("Workspace {} restored", snapshot.target_path.display()),
                    Some(json!({ "digest": snapshot.digest })),
                )
                .await;
                self.discard_snapshot(run_id).await;
                Ok(())
            }
            Err(source) => {
                error!(run_id, error = %source, "Rollback failed; snapshot preserved for recovery");
                self.event(
                    run_id,
                    EventType::RollbackFailed,
                    Severity::Critical,
                    format!("Restore failed, snapshot preserved: {}", source),
                    None,
                )
                .await;
                Err(source)
            }
        }
    }

    /// Fail every step still `running`, as `cancelled` with `message`.
    pub(crate) async fn close_open_steps(
        &self,
        run_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let id = run_id.to_string();
        let steps = self.store.call(move |db| db.list_steps(&id)).await?;
        for step in steps.into_iter().filter(|s| s.status == StepStatus::Running) {
            let outcome = StepOutcome::Failed {
                kind: ErrorKind::Cancelled,
                message: message.to_string(),
            };
            self.store
                .call(move |db| db.finish_step(step.id, &outcome))
                .await?;
        }
        Ok(())
    }

    async fn fail_run(&self, run_id: &str, detail: String) -> Result<(), OrchestratorError> {
        let id = run_id.to_string();
        self.store
            .call(move |db| db.complete_run(&id, RunStatus::Failed, Some(&detail)))
            .await?;
        Ok(())
    }

    /// Packaging, once the run is committed: drop the snapshot, then build
    /// the bundle.
    async fn finish(
        &self,
        run_id: &str,
        config: &RunConfig,
    ) -> Result<Option<BundleReport>, PackagingError> {
        if config.dry_run {
            self.event(
                run_id,
                EventType::PackagingSkipped,
                Severity::Info,
                "Dry run: bundle not written".to_string(),
                None,
            )
            .await;
            return Ok(None);
        }
        self.discard_snapshot(run_id).await;

        match self.package(run_id).await {
            Ok(report) => {
                self.event(
                    run_id,
                    EventType::Packaged,
                    Severity::Info,
                    format!("Bundle written to {}", report.path.display()),
                    Some(json!({
                        "path": report.path,
                        "sha256": report.sha256,
                        "bytes": report.bytes,
                    })),
                )
                .await;
                Ok(Some(report))
            }
            Err(err) => {
                warn!(run_id, error = %err, "Packaging failed; run stays succeeded");
                self.event(
                    run_id,
                    EventType::PackagingFailed,
                    Severity::Warning,
                    format!("Packaging failed: {}", err),
                    None,
                )
                .await;
                Err(err)
            }
        }
    }

    pub(crate) async fn package(
        &self,
        run_id: &str,
    ) -> Result<BundleReport, PackagingError> {
        let id = run_id.to_string();
        let state = self.store.call(move |db| db.load_run_state(&id)).await?;
        let packager = Packager::new(&self.options.dist_dir);
        tokio::task::spawn_blocking(move || packager.package(&state))
            .await
            .map_err(|e| PackagingError::Write {
                path: PathBuf::from(run_id),
                source: std::io::Error::other(e.to_string()),
            })?
    }

    pub(crate) async fn discard_snapshot(&self, run_id: &str) {
        let sandbox = self.sandbox.clone();
        let id = run_id.to_string();
        let discarded = tokio::task::spawn_blocking(move || sandbox.discard(&id)).await;
        match discarded {
            Ok(Ok(())) => {
                self.event(
                    run_id,
                    EventType::SnapshotDiscarded,
                    Severity::Info,
                    "Snapshot discarded".to_string(),
                    None,
                )
                .await;
            }
            Ok(Err(e)) => warn!(run_id, error = %e, "Failed to discard snapshot"),
            Err(e) => warn!(run_id, error = %e, "Snapshot discard task panicked"),
        }
    }

    /// Append a timeline event. Failures are logged, never fatal.
    pub(crate) async fn event(
        &self,
        run_id: &str,
        event_type: EventType,
        severity: Severity,
        message: String,
        payload: Option<serde_json::Value>,
    ) {
        let id = run_id.to_string();
        let result = self
            .store
            .call(move |db| db.append_event(&id, event_type, severity, &message, payload.as_ref()))
            .await;
        if let Err(e) = result {
            warn!(run_id, event = %event_type, error = %e, "Failed to append event");
        }
    }

    /// Refresh the audit mirror from the store.
    pub(crate) async fn mirror(&self, run_id: &str) {
        let id = run_id.to_string();
        let state = match self.store.call(move |db| db.load_run_state(&id)).await {
            Ok(state) => state,
            Err(e) => {
                warn!(run_id, error = %e, "Audit mirror skipped: cannot read run state");
                return;
            }
        };
        let mirror = AuditMirror::new(&self.options.runs_dir, run_id);
        if let Err(e) = mirror.sync(&state) {
            warn!(run_id, error = %e, "Audit mirror write failed");
        }
    }
}
