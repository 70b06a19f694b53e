//! Run orchestration: snapshot, personas in order, rollback or packaging.

pub mod recovery;
pub mod runner;
pub mod state;

pub use runner::{Orchestrator, OrchestratorOptions, RunOutcome};
pub use state::{PipelineState, StateMachine};
