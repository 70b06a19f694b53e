//! The `pipewright.toml` configuration file.
//!
//! Layering is defaults → file → environment → CLI flags. This module owns
//! the first three; CLI flags are applied by the command layer.
//!
//! # Configuration File Format
//!
//! ```toml
//! [model]
//! provider = "openai"        # or "offline"
//! name = "gpt-4.1"
//! base_url = "https://api.openai.com/v1"
//! timeout_secs = 120
//!
//! [tools]
//! web_search = false
//! file_search = false
//! code_execution = false
//! vector_store_ids = []
//!
//! [sandbox]
//! allow_cli_tools = false
//! allow = ["python3", "pytest", "cargo"]
//! deny_patterns = ['\bsudo\b']
//! allow_package_install = false
//! command_timeout_secs = 300
//!
//! [pipeline]
//! fix_forward = true
//! dry_run = false
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use pipewright_common::config::{
    CommandPolicy, ToolToggles, default_allow, default_command_timeout_secs,
    default_deny_patterns,
};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const CONFIG_FILE_NAME: &str = "pipewright.toml";

/// Which transport answers LLM calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    Openai,
    /// Deterministic canned outputs; never touches the network.
    Offline,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Openai => write!(f, "openai"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::Openai),
            "offline" => Ok(Self::Offline),
            _ => Err(format!(
                "Invalid provider '{}'. Valid values: openai, offline",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSection {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-call LLM timeout. Exceeding it is a generation failure.
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model_name() -> String {
    "gpt-4.1".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model_timeout_secs() -> u64 {
    120
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            name: default_model_name(),
            base_url: default_base_url(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolsSection {
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub file_search: bool,
    #[serde(default)]
    pub code_execution: bool,
    #[serde(default)]
    pub vector_store_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxSection {
    #[serde(default)]
    pub allow_cli_tools: bool,
    #[serde(default = "default_allow")]
    pub allow: Vec<String>,
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
    #[serde(default)]
    pub allow_package_install: bool,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for SandboxSection {
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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Retry a step once after a generation or tool failure.
    #[serde(default = "default_fix_forward")]
    pub fix_forward: bool,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_fix_forward() -> bool {
    true
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            fix_forward: default_fix_forward(),
            dry_run: false,
        }
    }
}

/// The complete pipewright.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipewrightToml {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

impl PipewrightToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Model name, with `PIPEWRIGHT_MODEL` overriding the file.
    pub fn model_name(&self) -> String {
        std::env::var("PIPEWRIGHT_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.model.name.clone())
    }

    /// Dry-run, with `PIPEWRIGHT_DRY_RUN` overriding the file.
    pub fn dry_run(&self) -> bool {
        match std::env::var("PIPEWRIGHT_DRY_RUN") {
            Ok(val) => env_flag(&val),
            Err(_) => self.pipeline.dry_run,
        }
    }

    pub fn tool_toggles(&self) -> ToolToggles {
        ToolToggles {
            web_search: self.tools.web_search,
            file_search: self.tools.file_search,
            code_execution: self.tools.code_execution,
            vector_store_ids: self.tools.vector_store_ids.clone(),
        }
    }

    pub fn command_policy(&self) -> CommandPolicy {
        CommandPolicy {
            allow_cli_tools: self.sandbox.allow_cli_tools,
            allow: self.sandbox.allow.clone(),
            deny_patterns: self.sandbox.deny_patterns.clone(),
            allow_package_install: self.sandbox.allow_package_install,
            command_timeout_secs: self.sandbox.command_timeout_secs,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.model.timeout_secs == 0 {
            warnings.push("model.timeout_secs must be greater than zero".to_string());
        }
        if self.sandbox.command_timeout_secs == 0 {
            warnings.push("sandbox.command_timeout_secs must be greater than zero".to_string());
        }
        for pattern in &self.sandbox.deny_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                warnings.push(format!("Invalid deny pattern '{}': {}", pattern, e));
            }
        }
        if self.tools.file_search && self.tools.vector_store_ids.is_empty() {
            warnings.push(
                "tools.file_search is enabled but no vector_store_ids are configured".to_string(),
            );
        }
        if self.tools.code_execution && !self.sandbox.allow_cli_tools {
            warnings.push(
                "tools.code_execution is enabled but sandbox.allow_cli_tools is false; \
                 every command will be denied"
                    .to_string(),
            );
        }

        warnings
    }
}

/// `1`, `true`, `yes` and `on` (any case) count as set.
pub fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
