//! Structured persona outputs.
//!
//! Each persona produces exactly one variant of [`PersonaOutput`]. Every
//! schema carries its own `schema_version` so historical runs can still be
//! decoded after a schema evolves.

use std::collections::HashSet;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persona::Persona;

pub const REQUIREMENTS_SCHEMA_VERSION: u32 = 1;
pub const CODING_SCHEMA_VERSION: u32 = 1;
pub const TESTING_SCHEMA_VERSION: u32 = 1;
pub const DOCUMENTATION_SCHEMA_VERSION: u32 = 1;

/// Output failed schema validation.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{persona} output failed validation: {}", problems.join("; "))]
pub struct SchemaViolation {
    pub persona: Persona,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "persona", rename_all = "snake_case")]
pub enum PersonaOutput {
    Requirements(RequirementsOutput),
    Coding(CodingOutput),
    Testing(TestingOutput),
    Documentation(DocumentationOutput),
}

impl PersonaOutput {
    pub fn persona(&self) -> Persona {
        match self {
            Self::Requirements(_) => Persona::Requirements,
            Self::Coding(_) => Persona::Coding,
            Self::Testing(_) => Persona::Testing,
            Self::Documentation(_) => Persona::Documentation,
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            Self::Requirements(o) => o.schema_version,
            Self::Coding(o) => o.schema_version,
            Self::Testing(o) => o.schema_version,
            Self::Documentation(o) => o.schema_version,
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            Self::Requirements(o) => &o.summary,
            Self::Coding(o) => &o.summary,
            Self::Testing(o) => &o.summary,
            Self::Documentation(o) => &o.summary,
        }
    }

    pub fn validate(&self) -> Result<(), SchemaViolation> {
        let problems = match self {
            Self::Requirements(o) => o.problems(),
            Self::Coding(o) => o.problems(),
            Self::Testing(o) => o.problems(),
            Self::Documentation(o) => o.problems(),
        };
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SchemaViolation {
                persona: self.persona(),
                problems,
            })
        }
    }
}

fn requirements_version() -> u32 {
    REQUIREMENTS_SCHEMA_VERSION
}

fn coding_version() -> u32 {
    CODING_SCHEMA_VERSION
}

fn testing_version() -> u32 {
    TESTING_SCHEMA_VERSION
}

fn documentation_version() -> u32 {
    DOCUMENTATION_SCHEMA_VERSION
}

fn check_version(problems: &mut Vec<String>, found: u32, supported: u32) {
    if found == 0 || found > supported {
        problems.push(format!(
            "unsupported schema_version {} (supported: 1..={})",
            found, supported
        ));
    }
}

fn check_not_blank(problems: &mut Vec<String>, field: &str, value: &str) {
    if value.trim().is_empty() {
        problems.push(format!("{} must not be empty", field));
    }
}

fn check_entries(problems: &mut Vec<String>, field: &str, values: &[String]) {
    if values.iter().any(|v| v.trim().is_empty()) {
        problems.push(format!("{} contains an empty entry", field));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequirementsOutput {
    #[serde(default = "requirements_version")]
    pub schema_version: u32,
    pub summary: String,
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

impl RequirementsOutput {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        check_version(&mut problems, self.schema_version, REQUIREMENTS_SCHEMA_VERSION);
        check_not_blank(&mut problems, "summary", &self.summary);
        if self.acceptance_criteria.is_empty() {
            problems.push("acceptance_criteria must list at least one criterion".to_string());
        }
        check_entries(&mut problems, "acceptance_criteria", &self.acceptance_criteria);
        check_entries(&mut problems, "assumptions", &self.assumptions);
        problems
    }
}

/// A file the coding persona wants written into the workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    /// Path relative to the workspace root.
    pub path: String,
    pub contents: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Dependency {
    /// Package ecosystem, e.g. `pip`, `npm`, `cargo`.
    pub ecosystem: String,
    pub name: String,
    pub version: String,
}

impl Dependency {
    /// SBOM coordinate in `ecosystem:name==version` form.
    pub fn coordinate(&self) -> String {
        format!("{}:{}=={}", self.ecosystem, self.name, self.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodingOutput {
    #[serde(default = "coding_version")]
    pub schema_version: u32,
    pub summary: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Workspace-relative, no parent traversal, no root or prefix components.
pub fn is_contained_relative_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    let mut normal = 0;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    normal > 0
}

impl CodingOutput {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        check_version(&mut problems, self.schema_version, CODING_SCHEMA_VERSION);
        check_not_blank(&mut problems, "summary", &self.summary);

        let mut seen = HashSet::new();
        for file in &self.files {
            if !is_contained_relative_path(&file.path) {
                problems.push(format!(
                    "file path '{}' must be relative to the workspace",
                    file.path
                ));
            }
            if !seen.insert(file.path.as_str()) {
                problems.push(format!("file path '{}' is listed twice", file.path));
            }
        }
        for dep in &self.dependencies {
            if dep.ecosystem.trim().is_empty()
                || dep.name.trim().is_empty()
                || dep.version.trim().is_empty()
            {
                problems.push(format!(
                    "dependency '{}' must name ecosystem, name and version",
                    dep.coordinate()
                ));
            }
        }
        check_entries(&mut problems, "commands", &self.commands);
        problems
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestingOutput {
    #[serde(default = "testing_version")]
    pub schema_version: u32,
    pub summary: String,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub coverage_hint: Option<String>,
    /// Command that exercises the suite inside the workspace.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub failures: Vec<String>,
}

impl TestingOutput {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        check_version(&mut problems, self.schema_version, TESTING_SCHEMA_VERSION);
        check_not_blank(&mut problems, "summary", &self.summary);
        check_entries(&mut problems, "tests", &self.tests);
        if let Some(command) = &self.command {
            check_not_blank(&mut problems, "command", command);
        }
        if self.outcome == TestOutcome::Fail && self.failures.is_empty() {
            problems.push("a failing outcome must list at least one failure".to_string());
        }
        problems
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentationOutput {
    #[serde(default = "documentation_version")]
    pub schema_version: u32,
    pub summary: String,
    pub readme: String,
    #[serde(default)]
    pub changelog: Vec<String>,
}

impl DocumentationOutput {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        check_version(&mut problems, self.schema_version, DOCUMENTATION_SCHEMA_VERSION);
        check_not_blank(&mut problems, "summary", &self.summary);
        check_not_blank(&mut problems, "readme", &self.readme);
        check_entries(&mut problems, "changelog", &self.changelog);
        problems
    }
}
