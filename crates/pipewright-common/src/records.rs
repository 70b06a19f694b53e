//! Persisted run records.
//!
//! These are the shapes the run store reads and writes. They are plain data;
//! the transition rules live on the status enums and are enforced by the store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::persona::Persona;
use crate::status::{ErrorKind, EventType, RunStatus, Severity, StepStatus};

/// Build a run id of the form `run-<YYYYMMDDTHHMMSSZ>-<8 hex chars>`.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub target_path: PathBuf,
    pub config: RunConfig,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: i64,
    pub run_id: String,
    pub sequence: i64,
    pub persona: Persona,
    pub attempt: u32,
    pub status: StepStatus,
    pub input_payload: serde_json::Value,
    pub output_payload: Option<serde_json::Value>,
    pub error_text: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal result handed to `finish_step`.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        output: serde_json::Value,
        /// Ids of model-side tool calls made while producing `output`.
        tool_call_ids: Vec<String>,
    },
    Failed { kind: ErrorKind, message: String },
}

impl StepOutcome {
    pub fn succeeded(output: serde_json::Value) -> Self {
        Self::Succeeded {
            output,
            tool_call_ids: Vec::new(),
        }
    }

    pub fn status(&self) -> StepStatus {
        match self {
            Self::Succeeded { .. } => StepStatus::Succeeded,
            Self::Failed { .. } => StepStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: i64,
    pub run_id: String,
    pub persona: Persona,
    pub name: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Everything the store knows about one run, in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run: Run,
    pub steps: Vec<Step>,
    pub artifacts: Vec<Artifact>,
    pub events: Vec<RunEvent>,
}

impl RunState {
    pub fn steps_for(&self, persona: Persona) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.persona == persona).collect()
    }

    /// The step whose output counts for `persona`, if it succeeded.
    pub fn succeeded_step(&self, persona: Persona) -> Option<&Step> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.persona == persona && s.status == StepStatus::Succeeded)
    }

    pub fn artifact(&self, persona: Persona, name: &str) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.persona == persona && a.name == name)
    }

    pub fn events_of(&self, event_type: EventType) -> Vec<&RunEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn has_event(&self, event_type: EventType) -> bool {
        self.events.iter().any(|e| e.event_type == event_type)
    }

    /// Most recent failed step, used to name the failing persona in reports.
    pub fn last_failure(&self) -> Option<&Step> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_id_format() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 10, 15, 0).unwrap();
        let id = new_run_id(now);
        assert!(id.starts_with("run-20261019T101500Z-"), "got {id}");
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_run_ids_are_unique() {
        let now = Utc::now();
        assert_ne!(new_run_id(now), new_run_id(now));
    }

    #[test]
    fn test_step_outcome_status() {
        let ok = StepOutcome::succeeded(serde_json::json!({}));
        let failed = StepOutcome::Failed {
            kind: ErrorKind::Generation,
            message: "timeout".into(),
        };
        assert_eq!(ok.status(), StepStatus::Succeeded);
        assert_eq!(failed.status(), StepStatus::Failed);
    }
}
