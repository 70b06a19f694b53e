//! Pipeline scenario tests
//!
//! Drives the orchestrator through the library API with scripted persona
//! steps, so each scenario controls exactly which attempts fail.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pipewright::errors::{OrchestratorError, StepError, StoreError};
use pipewright::orchestrator::{Orchestrator, OrchestratorOptions};
use pipewright::packager::list_bundle;
use pipewright::persona::{OfflineClient, PersonaStep, StepEnv, StepInput};
use pipewright::sandbox::SandboxManager;
use pipewright::store::{RunStore, StoreHandle};
use pipewright_common::{
    CodingOutput, CommandPolicy, DocumentationOutput, ErrorKind, EventType, FileEntry, Persona,
    PersonaOutput, RequirementsOutput, RunConfig, RunState, RunStatus, Severity, StepOutcome,
    StepStatus, TestOutcome, TestingOutput, ToolToggles,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted persona steps
// =============================================================================

fn output_for(persona: Persona) -> PersonaOutput {
    match persona {
        Persona::Requirements => PersonaOutput::Requirements(RequirementsOutput {
            schema_version: 1,
            summary: "Shorten URLs".into(),
            acceptance_criteria: vec!["POST /links returns a short code".into()],
            assumptions: vec![],
            constraints: vec![],
            risks: vec![],
        }),
        Persona::Coding => PersonaOutput::Coding(CodingOutput {
            schema_version: 1,
            summary: "Flask service".into(),
            files: vec![FileEntry {
                path: "app.py".into(),
                contents: "app = None\n".into(),
            }],
            dependencies: vec![],
            commands: vec![],
        }),
        Persona::Testing => PersonaOutput::Testing(TestingOutput {
            schema_version: 1,
            summary: "All green".into(),
            outcome: TestOutcome::Pass,
            tests: vec!["test_create_link".into()],
            coverage_hint: None,
            command: None,
            failures: vec![],
        }),
        Persona::Documentation => PersonaOutput::Documentation(DocumentationOutput {
            schema_version: 1,
            summary: "README".into(),
            readme: "# Shortener\n".into(),
            changelog: vec![],
        }),
    }
}

/// Fails its first `failures` attempts with `error`, then succeeds.
/// Every attempt first writes `<persona>-<attempt>.txt` into the workspace.
struct Scripted {
    persona: Persona,
    failures: u32,
    error: StepError,
    output: Option<PersonaOutput>,
    calls: Arc<AtomicU32>,
    inputs: Arc<Mutex<Vec<StepInput>>>,
}

impl Scripted {
    fn ok(persona: Persona) -> Self {
        Self {
            persona,
            failures: 0,
            error: StepError::Generation("unused".into()),
            output: None,
            calls: Arc::new(AtomicU32::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn failing(persona: Persona, failures: u32, error: StepError) -> Self {
        Self {
            failures,
            error,
            ..Self::ok(persona)
        }
    }

    fn returning(persona: Persona, output: PersonaOutput) -> Self {
        Self {
            output: Some(output),
            ..Self::ok(persona)
        }
    }
}

#[async_trait]
impl PersonaStep for Scripted {
    fn persona(&self) -> Persona {
        self.persona
    }

    async fn execute(
        &self,
        input: &StepInput,
        env: &StepEnv<'_>,
    ) -> Result<PersonaOutput, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.inputs.lock().unwrap().push(input.clone());
        if !env.dry_run {
            let name = format!("{}-{}.txt", self.persona, call);
            std::fs::write(env.workspace.join(name), "generated").unwrap();
        }
        if call <= self.failures {
            return Err(self.error.clone());
        }
        Ok(self
            .output
            .clone()
            .unwrap_or_else(|| output_for(self.persona)))
    }
}

struct Recorded {
    calls: HashMap<Persona, Arc<AtomicU32>>,
    inputs: HashMap<Persona, Arc<Mutex<Vec<StepInput>>>>,
}

impl Recorded {
    fn calls(&self, persona: Persona) -> u32 {
        self.calls[&persona].load(Ordering::SeqCst)
    }
}

/// Default steps with `overrides` swapped in by persona.
fn steps(overrides: Vec<Scripted>) -> (Vec<Box<dyn PersonaStep>>, Recorded) {
    let mut by_persona: HashMap<Persona, Scripted> =
        overrides.into_iter().map(|s| (s.persona, s)).collect();
    let mut seen = Recorded {
        calls: HashMap::new(),
        inputs: HashMap::new(),
    };
    let mut boxed: Vec<Box<dyn PersonaStep>> = Vec::new();
    for persona in Persona::PIPELINE {
        let step = by_persona
            .remove(&persona)
            .unwrap_or_else(|| Scripted::ok(persona));
        seen.calls.insert(persona, step.calls.clone());
        seen.inputs.insert(persona, step.inputs.clone());
        boxed.push(Box::new(step));
    }
    (boxed, seen)
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    dir: TempDir,
    store: StoreHandle,
    sandbox: SandboxManager,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        Self {
            store: StoreHandle::new(RunStore::new_in_memory().unwrap()),
            sandbox,
            dir,
        }
    }

    fn workspace(&self) -> PathBuf {
        self.dir.path().join("workspace")
    }

    fn dist_dir(&self) -> PathBuf {
        self.dir.path().join("dist")
    }

    fn seed_workspace(&self) {
        let ws = self.workspace();
        std::fs::create_dir_all(ws.join("src")).unwrap();
        std::fs::create_dir_all(ws.join("empty")).unwrap();
        std::fs::write(ws.join("src/main.py"), "print('v1')\n").unwrap();
        std::fs::write(ws.join("README.md"), "# original\n").unwrap();
    }

    fn config(&self, dry_run: bool) -> RunConfig {
        RunConfig {
            target_path: self.workspace(),
            prompt: "Build a URL shortener".into(),
            documents: vec![],
            tools: ToolToggles::default(),
            policy: CommandPolicy::default(),
            model: "gpt-4.1".into(),
            dry_run,
            fix_forward: true,
        }
    }

    fn orchestrator(&self, steps: Vec<Box<dyn PersonaStep>>) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.sandbox.clone(),
            Arc::new(OfflineClient),
            OrchestratorOptions {
                runs_dir: self.dir.path().join("runs"),
                dist_dir: self.dist_dir(),
                llm_timeout: Duration::from_secs(5),
            },
        )
        .with_steps(steps)
    }

    fn state(&self, run_id: &str) -> RunState {
        self.store.lock_sync().unwrap().load_run_state(run_id).unwrap()
    }

    fn only_run(&self) -> RunState {
        let runs = self.store.lock_sync().unwrap().list_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        self.state(&runs[0].run_id)
    }
}

/// Relative path -> file bytes, plus a marker for every directory.
fn tree(root: &Path) -> Vec<(String, Option<Vec<u8>>)> {
    let mut entries: Vec<_> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|e| {
            let e = e.unwrap();
            let rel = e
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            let bytes = e.file_type().is_file().then(|| std::fs::read(e.path()).unwrap());
            (rel, bytes)
        })
        .collect();
    entries.sort();
    entries
}

fn event_position(state: &RunState, event_type: EventType) -> Option<usize> {
    state.events.iter().position(|e| e.event_type == event_type)
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_all_personas_succeed_first_time() {
        let h = Harness::new();
        h.seed_workspace();
        let (steps, seen) = steps(vec![]);

        let outcome = h.orchestrator(steps).execute(h.config(false)).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Succeeded);

        let state = h.state(&outcome.run.run_id);
        assert_eq!(state.steps.len(), 4);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Succeeded));
        assert_eq!(state.artifacts.len(), 4);
        for persona in Persona::PIPELINE {
            assert_eq!(seen.calls(persona), 1);
        }

        let bundle = outcome.bundle.unwrap();
        let names = list_bundle(&bundle.path).unwrap();
        let artifacts: Vec<_> = names.iter().filter(|n| n.starts_with("artifacts/")).collect();
        assert_eq!(artifacts.len(), 4);
        assert!(event_position(&state, EventType::Packaged).is_some());
        assert!(event_position(&state, EventType::SnapshotDiscarded).is_some());

        // Workspace keeps the generated files.
        assert!(h.workspace().join("coding-1.txt").exists());
    }

    #[tokio::test]
    async fn test_coding_fails_once_then_recovers() {
        let h = Harness::new();
        h.seed_workspace();
        let (steps, seen) = steps(vec![Scripted::failing(
            Persona::Coding,
            1,
            StepError::ToolExecution("pytest exited with status 1".into()),
        )]);

        let outcome = h.orchestrator(steps).execute(h.config(false)).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Succeeded);

        let state = h.state(&outcome.run.run_id);
        let coding = state.steps_for(Persona::Coding);
        assert_eq!(coding.len(), 2);
        assert_eq!(coding[0].status, StepStatus::Failed);
        assert_eq!(coding[0].error_kind, Some(ErrorKind::ToolExecution));
        assert_eq!(coding[1].status, StepStatus::Succeeded);
        assert_eq!(coding[1].attempt, 2);
        assert_eq!(state.steps.len(), 5);
        assert_eq!(seen.calls(Persona::Documentation), 1);

        // The retry sees the structured failure summary.
        let inputs = seen.inputs[&Persona::Coding].lock().unwrap();
        assert!(inputs[0].retry.is_none());
        let retry = inputs[1].retry.as_ref().unwrap();
        assert_eq!(retry.kind, ErrorKind::ToolExecution);
        assert!(retry.message.contains("pytest exited"));
        assert_eq!(state.events_of(EventType::StepRetry).len(), 1);
    }

    #[tokio::test]
    async fn test_testing_fails_twice_and_rolls_back() {
        let h = Harness::new();
        h.seed_workspace();
        let before = tree(&h.workspace());
        let (steps, seen) = steps(vec![Scripted::failing(
            Persona::Testing,
            2,
            StepError::ToolExecution("2 tests failed".into()),
        )]);

        let err = h
            .orchestrator(steps)
            .execute(h.config(false))
            .await
            .unwrap_err();
        match &err {
            OrchestratorError::StepFailed { persona, kind, .. } => {
                assert_eq!(*persona, Persona::Testing);
                assert_eq!(*kind, ErrorKind::ToolExecution);
            }
            other => panic!("Expected StepFailed, got {other:?}"),
        }
        assert_eq!(err.exit_code(), 3);

        let state = h.only_run();
        assert_eq!(state.run.status, RunStatus::Failed);
        assert!(state.steps_for(Persona::Documentation).is_empty());
        assert_eq!(seen.calls(Persona::Documentation), 0);
        assert_eq!(tree(&h.workspace()), before);
        assert!(std::fs::read_dir(h.dist_dir()).map(|mut d| d.next().is_none()).unwrap_or(true));
    }

    #[tokio::test]
    async fn test_dry_run_records_everything_without_side_effects() {
        let h = Harness::new();
        h.seed_workspace();
        let before = tree(&h.workspace());
        let (steps, _seen) = steps(vec![]);

        let outcome = h.orchestrator(steps).execute(h.config(true)).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Succeeded);
        assert!(outcome.bundle.is_none());

        let state = h.state(&outcome.run.run_id);
        assert_eq!(state.steps.len(), 4);
        assert_eq!(state.artifacts.len(), 4);
        assert!(event_position(&state, EventType::SnapshotSkipped).is_some());
        assert!(event_position(&state, EventType::PackagingSkipped).is_some());
        assert!(event_position(&state, EventType::SnapshotCreated).is_none());
        assert!(h.sandbox.load(&outcome.run.run_id).unwrap().is_none());
        assert!(!h.dist_dir().join(format!("{}.tar.gz", outcome.run.run_id)).exists());
        assert_eq!(tree(&h.workspace()), before);
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let h = Harness::new();
        h.seed_workspace();
        let mut bad = output_for(Persona::Requirements);
        if let PersonaOutput::Requirements(req) = &mut bad {
            req.acceptance_criteria.clear();
        }
        let (steps, seen) = steps(vec![Scripted::returning(Persona::Requirements, bad)]);

        let err = h
            .orchestrator(steps)
            .execute(h.config(false))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.class(), "ValidationError");
        assert_eq!(seen.calls(Persona::Requirements), 1);
        assert_eq!(seen.calls(Persona::Coding), 0);
        assert_eq!(h.only_run().steps.len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_persona_output_is_validation_error() {
        let h = Harness::new();
        let (steps, _seen) = steps(vec![Scripted::returning(
            Persona::Coding,
            output_for(Persona::Testing),
        )]);

        let err = h
            .orchestrator(steps)
            .execute(h.config(false))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::StepFailed { persona, kind, .. } => {
                assert_eq!(persona, Persona::Coding);
                assert_eq!(kind, ErrorKind::Validation);
            }
            other => panic!("Expected StepFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fix_forward_disabled_fails_on_first_error() {
        let h = Harness::new();
        h.seed_workspace();
        let (steps, seen) = steps(vec![Scripted::failing(
            Persona::Coding,
            1,
            StepError::Generation("model timed out".into()),
        )]);
        let mut config = h.config(false);
        config.fix_forward = false;

        let err = h.orchestrator(steps).execute(config).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(seen.calls(Persona::Coding), 1);
        assert_eq!(h.only_run().steps_for(Persona::Coding).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_failure_runs_no_persona() {
        let h = Harness::new();
        std::fs::write(h.workspace(), "a file, not a directory").unwrap();
        let (steps, seen) = steps(vec![]);

        let err = h
            .orchestrator(steps)
            .execute(h.config(false))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Snapshot { .. }));
        assert_eq!(err.exit_code(), 5);
        assert_eq!(seen.calls(Persona::Requirements), 0);

        let state = h.only_run();
        assert_eq!(state.run.status, RunStatus::Failed);
        assert!(state.steps.is_empty());

        let initiated = event_position(&state, EventType::RollbackInitiated).unwrap();
        let completed = event_position(&state, EventType::RollbackCompleted).unwrap();
        let failed = event_position(&state, EventType::Failed).unwrap();
        assert!(initiated < completed && completed < failed);
        assert!(state.events[completed].message.contains("never mutated"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_rolls_back() {
        let h = Harness::new();
        h.seed_workspace();
        let before = tree(&h.workspace());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (steps, seen) = steps(vec![]);

        let err = h
            .orchestrator(steps)
            .with_cancellation(cancel)
            .execute(h.config(false))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Cancelled {
                persona: Persona::Requirements,
                ..
            }
        ));
        assert_eq!(seen.calls(Persona::Requirements), 0);

        let state = h.only_run();
        assert_eq!(state.run.status, RunStatus::Failed);
        assert!(event_position(&state, EventType::Cancelled).is_some());
        assert_eq!(tree(&h.workspace()), before);
    }

    #[tokio::test]
    async fn test_absent_workspace_is_removed_on_rollback() {
        let h = Harness::new();
        let (steps, _seen) = steps(vec![Scripted::failing(
            Persona::Requirements,
            2,
            StepError::Generation("no answer".into()),
        )]);

        h.orchestrator(steps)
            .execute(h.config(false))
            .await
            .unwrap_err();
        assert!(!h.workspace().exists());
    }

    #[tokio::test]
    async fn test_persona_order_is_enforced() {
        let h = Harness::new();
        let (mut steps, _seen) = steps(vec![]);
        steps.swap(0, 1);

        let err = h
            .orchestrator(steps)
            .execute(h.config(false))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(h.store.lock_sync().unwrap().list_runs(10).unwrap().is_empty());
    }
}

// =============================================================================
// Properties
// =============================================================================

mod properties {
    use super::*;

    #[test]
    fn test_snapshot_restore_round_trip() {
        let h = Harness::new();
        h.seed_workspace();
        let ws = h.workspace();
        std::fs::write(ws.join("blob.bin"), [0u8, 159, 146, 150, 255]).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(ws.join("src/main.py"), std::fs::Permissions::from_mode(0o751))
                .unwrap();
        }
        let before = tree(&ws);

        h.sandbox.snapshot("run-p1", &ws).unwrap();
        std::fs::remove_dir_all(ws.join("empty")).unwrap();
        std::fs::write(ws.join("src/main.py"), "print('v2')\n").unwrap();
        std::fs::write(ws.join("new.txt"), "added").unwrap();
        std::fs::remove_file(ws.join("blob.bin")).unwrap();

        h.sandbox.restore("run-p1").unwrap();
        assert_eq!(tree(&ws), before);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(ws.join("src/main.py")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o751);
        }
    }

    #[tokio::test]
    async fn test_each_persona_sees_only_earlier_outputs() {
        let h = Harness::new();
        h.seed_workspace();
        let (steps, _seen) = steps(vec![]);

        let outcome = h.orchestrator(steps).execute(h.config(false)).await.unwrap();
        let state = h.state(&outcome.run.run_id);

        let mut earlier = Vec::new();
        for persona in Persona::PIPELINE {
            let step = state.succeeded_step(persona).unwrap();
            assert_eq!(step.input_payload["prompt"], "Build a URL shortener");
            assert_eq!(step.input_payload["prior_outputs"], json!(earlier));
            earlier.push(step.output_payload.clone().unwrap());
        }
    }

    #[tokio::test]
    async fn test_at_most_two_attempts_per_persona() {
        let h = Harness::new();
        h.seed_workspace();
        let (steps, seen) = steps(vec![Scripted::failing(
            Persona::Requirements,
            5,
            StepError::Generation("still broken".into()),
        )]);

        h.orchestrator(steps)
            .execute(h.config(false))
            .await
            .unwrap_err();
        assert_eq!(seen.calls(Persona::Requirements), 2);

        let state = h.only_run();
        let attempts: Vec<u32> = state
            .steps_for(Persona::Requirements)
            .iter()
            .map(|s| s.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Failed));
    }

    #[test]
    fn test_finish_step_twice_is_rejected() {
        let h = Harness::new();
        let store = h.store.lock_sync().unwrap();
        let run = store.create_run(&h.config(false)).unwrap();
        store.start_run(&run.run_id).unwrap();
        let step = store
            .record_step(&run.run_id, Persona::Requirements, 1, &json!({}))
            .unwrap();

        store
            .finish_step(step.id, &StepOutcome::succeeded(json!({"summary": "first"})))
            .unwrap();
        let second = store.finish_step(
            step.id,
            &StepOutcome::Failed {
                kind: ErrorKind::Generation,
                message: "late".into(),
            },
        );
        assert!(second.is_err());

        let stored = store.get_step(step.id).unwrap().unwrap();
        assert_eq!(stored.status, StepStatus::Succeeded);
        assert_eq!(stored.output_payload, Some(json!({"summary": "first"})));
    }

    #[tokio::test]
    async fn test_failed_run_has_rollback_before_final_status() {
        let h = Harness::new();
        h.seed_workspace();
        let before = tree(&h.workspace());
        let (steps, _seen) = steps(vec![Scripted::failing(
            Persona::Documentation,
            2,
            StepError::ToolExecution("writer crashed".into()),
        )]);

        h.orchestrator(steps)
            .execute(h.config(false))
            .await
            .unwrap_err();

        let state = h.only_run();
        assert_eq!(state.run.status, RunStatus::Failed);
        let initiated = event_position(&state, EventType::RollbackInitiated).unwrap();
        let completed = event_position(&state, EventType::RollbackCompleted).unwrap();
        let failed = event_position(&state, EventType::Failed).unwrap();
        assert!(initiated < completed && completed < failed);
        assert_eq!(tree(&h.workspace()), before);
    }
}

// =============================================================================
// Faults outside the personas
// =============================================================================

mod faults {
    use super::*;

    /// Coding step that saves its own artifact before the orchestrator does,
    /// so committing the step fails with a duplicate.
    struct ClaimsArtifact {
        store: StoreHandle,
    }

    #[async_trait]
    impl PersonaStep for ClaimsArtifact {
        fn persona(&self) -> Persona {
            Persona::Coding
        }

        async fn execute(
            &self,
            input: &StepInput,
            env: &StepEnv<'_>,
        ) -> Result<PersonaOutput, StepError> {
            std::fs::write(env.workspace.join("app.py"), "app = None\n").unwrap();
            self.store
                .lock_sync()
                .unwrap()
                .save_artifact(
                    &input.run_id,
                    Persona::Coding,
                    Persona::Coding.artifact_name(),
                    &json!({}),
                )
                .unwrap();
            Ok(output_for(Persona::Coding))
        }
    }

    /// Coding step that deletes the snapshot tree, then fails.
    struct BreaksSnapshot {
        snapshots: PathBuf,
    }

    #[async_trait]
    impl PersonaStep for BreaksSnapshot {
        fn persona(&self) -> Persona {
            Persona::Coding
        }

        async fn execute(
            &self,
            input: &StepInput,
            env: &StepEnv<'_>,
        ) -> Result<PersonaOutput, StepError> {
            std::fs::write(env.workspace.join("app.py"), "broken").unwrap();
            let tree = self.snapshots.join(&input.run_id).join("tree");
            if tree.exists() {
                std::fs::remove_dir_all(tree).unwrap();
            }
            Err(StepError::ToolExecution("pytest exited 1".into()))
        }
    }

    #[tokio::test]
    async fn test_store_fault_after_snapshot_rolls_back() {
        let h = Harness::new();
        h.seed_workspace();
        let before = tree(&h.workspace());
        let (mut pipeline, seen) = steps(vec![]);
        pipeline[1] = Box::new(ClaimsArtifact {
            store: h.store.clone(),
        });

        let err = h
            .orchestrator(pipeline)
            .execute(h.config(false))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Store(StoreError::DuplicateArtifact { .. })
        ));
        assert_eq!(seen.calls(Persona::Testing), 0);
        assert_eq!(tree(&h.workspace()), before);

        let state = h.only_run();
        assert_eq!(state.run.status, RunStatus::Failed);
        assert!(state.steps.iter().all(|s| s.status != StepStatus::Running));
        assert_eq!(state.steps[1].error_kind, Some(ErrorKind::Cancelled));
        let initiated = event_position(&state, EventType::RollbackInitiated).unwrap();
        let completed = event_position(&state, EventType::RollbackCompleted).unwrap();
        let failed = event_position(&state, EventType::Failed).unwrap();
        assert!(initiated < completed && completed < failed);
        assert!(!h.sandbox.has_live_snapshot(&state.run.run_id));
    }

    #[tokio::test]
    async fn test_restore_failure_keeps_snapshot_and_fails_run() {
        let h = Harness::new();
        h.seed_workspace();
        let (mut pipeline, _seen) = steps(vec![]);
        pipeline[1] = Box::new(BreaksSnapshot {
            snapshots: h.dir.path().join("snapshots"),
        });

        let err = h
            .orchestrator(pipeline)
            .execute(h.config(false))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Rollback {
                persona: Persona::Coding,
                ..
            }
        ));
        assert_eq!(err.class(), "RestoreError");
        assert_eq!(err.exit_code(), 5);

        let state = h.only_run();
        let run_id = state.run.run_id.clone();
        assert_eq!(state.run.status, RunStatus::Failed);
        let initiated = event_position(&state, EventType::RollbackInitiated).unwrap();
        let rollback_failed = event_position(&state, EventType::RollbackFailed).unwrap();
        let failed = event_position(&state, EventType::Failed).unwrap();
        assert!(initiated < rollback_failed && rollback_failed < failed);
        assert_eq!(state.events[rollback_failed].severity, Severity::Critical);
        assert!(event_position(&state, EventType::RollbackCompleted).is_none());
        assert!(
            h.dir
                .path()
                .join("snapshots")
                .join(&run_id)
                .join("snapshot.json")
                .exists()
        );
    }
}

// =============================================================================
// Recovery
// =============================================================================

mod recovery {
    use super::*;

    /// A run left `running` with a live snapshot and a half-finished step.
    fn crashed_run(h: &Harness) -> String {
        h.seed_workspace();
        let store = h.store.lock_sync().unwrap();
        let run = store.create_run(&h.config(false)).unwrap();
        store.start_run(&run.run_id).unwrap();
        h.sandbox.snapshot(&run.run_id, &h.workspace()).unwrap();
        store
            .record_step(&run.run_id, Persona::Coding, 1, &json!({}))
            .unwrap();
        run.run_id
    }

    #[tokio::test]
    async fn test_recover_crashed_run_restores_workspace() {
        let h = Harness::new();
        let run_id = crashed_run(&h);
        let before = tree(&h.workspace());
        std::fs::write(h.workspace().join("half-written.py"), "def").unwrap();

        let (steps, _seen) = steps(vec![]);
        let run = h.orchestrator(steps).recover(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::RolledBack);
        assert_eq!(tree(&h.workspace()), before);

        let state = h.state(&run_id);
        assert_eq!(state.steps[0].status, StepStatus::Failed);
        assert_eq!(state.steps[0].error_kind, Some(ErrorKind::Cancelled));
        assert!(event_position(&state, EventType::Recovered).is_some());
        assert!(!h.sandbox.has_live_snapshot(&run_id));
    }

    #[tokio::test]
    async fn test_recover_twice_is_rejected() {
        let h = Harness::new();
        let run_id = crashed_run(&h);
        let (steps, _seen) = steps(vec![]);
        let orchestrator = h.orchestrator(steps);

        orchestrator.recover(&run_id).await.unwrap();
        let err = orchestrator.recover(&run_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotRecoverable { .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_recover_failed_run_with_live_snapshot() {
        let h = Harness::new();
        h.seed_workspace();
        let run_id = {
            let store = h.store.lock_sync().unwrap();
            let run = store.create_run(&h.config(false)).unwrap();
            store.start_run(&run.run_id).unwrap();
            h.sandbox.snapshot(&run.run_id, &h.workspace()).unwrap();
            store
                .complete_run(&run.run_id, RunStatus::Failed, Some("restore failed"))
                .unwrap();
            run.run_id
        };
        std::fs::remove_file(h.workspace().join("README.md")).unwrap();

        let (steps, _seen) = steps(vec![]);
        let run = h.orchestrator(steps).recover(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::RolledBack);
        assert!(h.workspace().join("README.md").exists());
    }

    #[tokio::test]
    async fn test_recover_rolled_back_failure_is_refused() {
        let h = Harness::new();
        h.seed_workspace();
        let (steps, _) = steps(vec![Scripted::failing(
            Persona::Coding,
            2,
            StepError::ToolExecution("boom".into()),
        )]);
        let orchestrator = h.orchestrator(steps);
        orchestrator.execute(h.config(false)).await.unwrap_err();
        let run_id = h.only_run().run.run_id;

        let err = orchestrator.recover(&run_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotRecoverable { .. }));
        assert_eq!(h.state(&run_id).run.status, RunStatus::Failed);
    }
}
