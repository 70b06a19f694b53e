//! Deterministic recovery of runs left behind by a crash or a failed restore.

use pipewright_common::{EventType, Run, RunStatus, Severity};
use serde_json::json;
use tracing::{info, warn};

use super::runner::Orchestrator;
use crate::errors::{OrchestratorError, StoreError};

const INTERRUPTED: &str = "interrupted: the process exited before the step finished";

impl Orchestrator {
    /// Restore the workspace of an unfinished run from its snapshot and mark
    /// the run `rolled_back`.
    ///
    /// Accepts a run still `running` (the process died mid-run) or a `failed`
    /// run whose snapshot is still live (its automatic restore failed).
    pub async fn recover(&self, run_id: &str) -> Result<Run, OrchestratorError> {
        let id = run_id.to_string();
        let run = self
            .store
            .call(move |db| {
                db.get_run(&id)?
                    .ok_or(StoreError::RunNotFound { run_id: id.clone() })
            })
            .await?;

        let sandbox = self.sandbox.clone();
        let id = run_id.to_string();
        let snapshot = tokio::task::spawn_blocking(move || sandbox.load(&id))
            .await
            .map_err(|e| not_recoverable(run_id, format!("snapshot lookup panicked: {}", e)))?
            .map_err(|e| not_recoverable(run_id, e.to_string()))?;
        let live = snapshot.as_ref().is_some_and(|s| s.is_live());

        match run.status {
            RunStatus::Running => {}
            RunStatus::Failed if live => {}
            RunStatus::Failed => {
                return Err(not_recoverable(
                    run_id,
                    "run failed and its workspace was already restored".to_string(),
                ));
            }
            other => {
                return Err(not_recoverable(run_id, format!("run is {}", other)));
            }
        }
        info!(run_id, status = %run.status, live_snapshot = live, "Recovering run");

        // Steps left running by the crash are closed first so the timeline stays consistent.
        self.close_open_steps(run_id, INTERRUPTED).await?;

        let detail = if live {
            let sandbox = self.sandbox.clone();
            let id = run_id.to_string();
            let restored = tokio::task::spawn_blocking(move || sandbox.restore(&id))
                .await
                .map_err(|e| not_recoverable(run_id, format!("restore panicked: {}", e)))?;
            let snapshot = match restored {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.event(
                        run_id,
                        EventType::RollbackFailed,
                        Severity::Critical,
                        format!("Recovery restore failed, snapshot preserved: {}", e),
                        None,
                    )
                    .await;
                    self.mirror(run_id).await;
                    return Err(not_recoverable(run_id, e.to_string()));
                }
            };
            self.discard_snapshot(run_id).await;
            format!("workspace {} restored from snapshot", snapshot.target_path.display())
        } else {
            // Crashed before the snapshot existed, or a dry run: nothing was mutated.
            warn!(run_id, "No live snapshot; marking run rolled back without a restore");
            "no live snapshot; workspace was not mutated".to_string()
        };

        self.event(
            run_id,
            EventType::Recovered,
            Severity::Warning,
            format!("Run recovered: {}", detail),
            Some(json!({ "from": run.status, "restored": live })),
        )
        .await;
        let id = run_id.to_string();
        let run = self
            .store
            .call(move |db| db.complete_run(&id, RunStatus::RolledBack, Some(&detail)))
            .await?;
        self.mirror(run_id).await;
        Ok(run)
    }
}

fn not_recoverable(run_id: &str, reason: String) -> OrchestratorError {
    OrchestratorError::NotRecoverable {
        run_id: run_id.to_string(),
        reason,
    }
}
