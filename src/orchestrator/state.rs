//! Pipeline state machine.
//!
//! ```text
//! Created -> Snapshotting -> Running(0) -> ... -> Running(n-1) -> Packaging -> Completed
//!                 |              |                                   |
//!                 +--------------+-> RollingBack -> Failed <---------+
//! ```

use std::fmt;

use crate::errors::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Snapshotting,
    /// Executing the persona at this pipeline index.
    Running(usize),
    Packaging,
    Completed,
    RollingBack,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Edges of the machine. `steps` is the pipeline length.
    pub fn can_transition_to(&self, next: PipelineState, steps: usize) -> bool {
        use PipelineState::*;
        match (*self, next) {
            (Created, Snapshotting) => true,
            (Snapshotting, Running(0)) => steps > 0,
            (Snapshotting, Packaging) => steps == 0,
            // A failed snapshot still records a (no-op) rollback before failing.
            (Snapshotting, RollingBack) => true,
            (Running(i), Running(j)) => j == i + 1 && j < steps,
            (Running(i), Packaging) => i + 1 == steps,
            (Running(_), RollingBack) => true,
            (Packaging, Completed) => true,
            // Committing `succeeded` failed.
            (Packaging, RollingBack) => true,
            (RollingBack, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Snapshotting => f.write_str("snapshotting"),
            Self::Running(i) => write!(f, "running({})", i),
            Self::Packaging => f.write_str("packaging"),
            Self::Completed => f.write_str("completed"),
            Self::RollingBack => f.write_str("rolling_back"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Tracks the current state and rejects edges the machine does not have.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: PipelineState,
    steps: usize,
    history: Vec<PipelineState>,
}

impl StateMachine {
    pub fn new(steps: usize) -> Self {
        Self {
            state: PipelineState::Created,
            steps,
            history: vec![PipelineState::Created],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<(), OrchestratorError> {
        if !self.state.can_transition_to(next, self.steps) {
            return Err(OrchestratorError::IllegalState {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}
