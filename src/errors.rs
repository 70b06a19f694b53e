//! Typed error hierarchy for pipewright.
//!
//! One enum per subsystem:
//! - `StoreError`: run store reads, writes and transition checks
//! - `SandboxError`: snapshot, restore and command policy failures
//! - `StepError`: what a persona step reports back to the orchestrator
//! - `PackagingError`: bundle assembly
//! - `IngestError`: reading reference documents
//! - `ConfigError`: `pipewright.toml` loading and saving
//! - `OrchestratorError`: everything a run can end with, mapped to exit codes

use std::path::PathBuf;

use pipewright_common::{ErrorKind, Persona, RunStatus};
use thiserror::Error;

/// Errors from the run store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid run config: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Step {step_id} not found")]
    StepNotFound { step_id: i64 },

    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Artifact {persona}/{name} already exists for run {run_id}")]
    DuplicateArtifact {
        run_id: String,
        persona: Persona,
        name: String,
    },

    #[error("Corrupt {table} row: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store task panicked: {0}")]
    TaskPanicked(String),
}

/// Errors from the sandbox subsystem.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Snapshot of {target} for run {run_id} failed: {reason}")]
    Snapshot {
        run_id: String,
        target: PathBuf,
        reason: String,
    },

    #[error("Restore for run {run_id} failed: {reason}")]
    Restore { run_id: String, reason: String },

    #[error("Command denied by policy: {reason}")]
    PolicyDenied { command: String, reason: String },

    #[error("No live snapshot for run {run_id}; commands may not run")]
    NoLiveSnapshot { run_id: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A persona step failure. The variant decides whether a retry is allowed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Output validation failed: {0}")]
    Validation(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Generation(_) => ErrorKind::Generation,
            Self::Validation(_) => ErrorKind::Validation,
            Self::ToolExecution(_) => ErrorKind::ToolExecution,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Generation(m) | Self::Validation(m) | Self::ToolExecution(m) => m.clone(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

impl From<SandboxError> for StepError {
    fn from(err: SandboxError) -> Self {
        Self::ToolExecution(err.to_string())
    }
}

/// Errors from bundle assembly.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("Run {run_id} is {status}; only succeeded runs can be packaged")]
    NotSucceeded { run_id: String, status: RunStatus },

    #[error("Failed to write bundle at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from reading reference documents.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Unsupported document type {path} (expected .md, .markdown or .json)")]
    Unsupported { path: PathBuf },

    #[error("Failed to read document {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Document {path} is not valid JSON: {source}")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Document {path} is empty")]
    Empty { path: PathBuf },
}

/// Errors from loading or saving `pipewright.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No state directory: set PIPEWRIGHT_STATE_DIR or pass --state-dir")]
    NoStateDir,
}

/// How a run ended when it did not succeed cleanly.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid run request: {0}")]
    Validation(String),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Run {run_id}: snapshot failed, no persona ran: {source}")]
    Snapshot {
        run_id: String,
        #[source]
        source: SandboxError,
    },

    #[error("Run {run_id}: {persona} persona failed ({kind}): {message}")]
    StepFailed {
        run_id: String,
        persona: Persona,
        kind: ErrorKind,
        message: String,
    },

    #[error("Run {run_id}: cancelled during {persona} persona")]
    Cancelled { run_id: String, persona: Persona },

    #[error("Run {run_id}: rollback after {persona} failure did not complete: {source}")]
    Rollback {
        run_id: String,
        persona: Persona,
        #[source]
        source: SandboxError,
    },

    #[error("Run {run_id} succeeded but packaging failed: {source}")]
    Packaging {
        run_id: String,
        #[source]
        source: PackagingError,
    },

    #[error("Illegal orchestrator transition: {from} -> {to}")]
    IllegalState { from: String, to: String },

    #[error("Run {run_id} cannot be recovered: {reason}")]
    NotRecoverable { run_id: String, reason: String },
}

impl OrchestratorError {
    /// Process exit code for this outcome.
    ///
    /// | code | meaning                                   |
    /// |------|-------------------------------------------|
    /// | 2    | validation of input or persona output     |
    /// | 3    | step failure, rolled back                 |
    /// | 4    | packaging failure, run still succeeded    |
    /// | 5    | snapshot or restore failure               |
    /// | 1    | anything else                             |
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Ingest(_) => 2,
            Self::Store(StoreError::Validation(_)) => 2,
            Self::StepFailed {
                kind: ErrorKind::Validation,
                ..
            } => 2,
            Self::StepFailed { .. } | Self::Cancelled { .. } => 3,
            Self::Packaging { .. } => 4,
            Self::Snapshot { .. } | Self::Rollback { .. } => 5,
            Self::NotRecoverable { .. } => 5,
            Self::Store(_) | Self::IllegalState { .. } => 1,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::Snapshot { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::Cancelled { run_id, .. }
            | Self::Rollback { run_id, .. }
            | Self::Packaging { run_id, .. }
            | Self::NotRecoverable { run_id, .. } => Some(run_id),
            _ => None,
        }
    }

    pub fn persona(&self) -> Option<Persona> {
        match self {
            Self::StepFailed { persona, .. }
            | Self::Cancelled { persona, .. }
            | Self::Rollback { persona, .. } => Some(*persona),
            _ => None,
        }
    }

    /// Short error class name for CLI failure output.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Ingest(_) | Self::Store(StoreError::Validation(_)) => {
                "ValidationError"
            }
            Self::StepFailed { kind, .. } => match kind {
                ErrorKind::Generation => "GenerationError",
                ErrorKind::Validation => "ValidationError",
                ErrorKind::ToolExecution => "ToolExecutionError",
                ErrorKind::Cancelled => "Cancelled",
            },
            Self::Cancelled { .. } => "Cancelled",
            Self::Snapshot { .. } => "SnapshotError",
            Self::Rollback { .. } | Self::NotRecoverable { .. } => "RestoreError",
            Self::Packaging { .. } => "PackagingError",
            Self::Store(StoreError::InvalidTransition { .. }) | Self::IllegalState { .. } => {
                "InvalidTransitionError"
            }
            Self::Store(StoreError::DuplicateArtifact { .. }) => "DuplicateArtifactError",
            Self::Store(_) => "StoreError",
        }
    }
}
