//! Frozen run configuration.
//!
//! A [`RunConfig`] is captured once when a run is created and stored verbatim
//! alongside the run. Nothing downstream mutates it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Absolute path of the workspace under mutation.
    pub target_path: PathBuf,
    pub prompt: String,
    #[serde(default)]
    pub documents: Vec<InputDocument>,
    #[serde(default)]
    pub tools: ToolToggles,
    #[serde(default)]
    pub policy: CommandPolicy,
    pub model: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub fix_forward: bool,
}

fn default_true() -> bool {
    true
}

impl RunConfig {
    /// Human-readable list of everything wrong with this config. Empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.prompt.trim().is_empty() {
            problems.push("prompt must not be empty".to_string());
        }
        if !self.target_path.is_absolute() {
            problems.push(format!(
                "target path must be absolute: {}",
                self.target_path.display()
            ));
        }
        if self.model.trim().is_empty() {
            problems.push("model must not be empty".to_string());
        }
        for doc in &self.documents {
            if doc.content.trim().is_empty() {
                problems.push(format!("input document is empty: {}", doc.path.display()));
            }
            if doc.sha256.len() != 64 {
                problems.push(format!(
                    "input document digest is malformed: {}",
                    doc.path.display()
                ));
            }
        }
        if self.policy.command_timeout_secs == 0 {
            problems.push("command timeout must be greater than zero".to_string());
        }
        problems
    }
}

/// Model-side tool switches. All default to off.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolToggles {
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub file_search: bool,
    #[serde(default)]
    pub code_execution: bool,
    /// Vector stores searched when `file_search` is enabled.
    #[serde(default)]
    pub vector_store_ids: Vec<String>,
}

impl ToolToggles {
    pub fn enabled_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.web_search {
            names.push("web_search");
        }
        if self.file_search {
            names.push("file_search");
        }
        if self.code_execution {
            names.push("code_execution");
        }
        names
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Markdown,
    Json,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Json => "json",
        }
    }

    /// Map a file extension to a supported media type.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" => Some(Self::Markdown),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markdown" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid media type: {}", s)),
        }
    }
}

/// A reference document, frozen with its content and digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputDocument {
    pub path: PathBuf,
    pub media_type: MediaType,
    pub sha256: String,
    pub content: String,
}

/// Sandbox command policy. Commands are denied unless every gate passes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandPolicy {
    #[serde(default)]
    pub allow_cli_tools: bool,
    /// Program names (first argv element, basename) permitted to run.
    #[serde(default = "default_allow")]
    pub allow: Vec<String>,
    /// Regular expressions matched against the full command line.
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
    #[serde(default)]
    pub allow_package_install: bool,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

pub fn default_allow() -> Vec<String> {
    ["python", "python3", "pytest", "node", "cargo", "go", "make", "echo", "true", "false"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_deny_patterns() -> Vec<String> {
    [
        r"\bsudo\b",
        r"\brm\s+-[a-zA-Z]*r[a-zA-Z]*f?\s+/(\s|$)",
        r"\bcurl\b",
        r"\bwget\b",
        r"\bssh\b",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_command_timeout_secs() -> u64 {
    300
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            allow_cli_tools: false,
            allow: default_allow(),
            deny_patterns: default_deny_patterns(),
            allow_package_install: false,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}
