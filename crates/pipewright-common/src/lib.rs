//! Domain types shared between the pipewright orchestrator and its tooling.

pub mod config;
pub mod output;
pub mod persona;
pub mod records;
pub mod status;

pub use config::{CommandPolicy, InputDocument, MediaType, RunConfig, ToolToggles};
pub use output::{
    CodingOutput, Dependency, DocumentationOutput, FileEntry, PersonaOutput, RequirementsOutput,
    SchemaViolation, TestOutcome, TestingOutput,
};
pub use persona::Persona;
pub use records::{Artifact, Run, RunEvent, RunState, Step, StepOutcome, new_run_id};
pub use status::{ErrorKind, EventType, RunStatus, Severity, StepStatus};
