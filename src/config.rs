use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use crate::pipewright_config::{CONFIG_FILE_NAME, PipewrightToml, env_flag};

/// Runtime configuration for pipewright.
///
/// Resolves the state directory, loads `pipewright.toml` and exposes the
/// on-disk layout every subsystem writes into:
///
/// ```text
/// <state_dir>/
///   pipewright.db          run store
///   pipewright.toml        default config location
///   snapshots/<run_id>/    sandbox snapshots
///   runs/<run_id>/         audit mirror
///   dist/<run_id>.tar.gz   bundles
///   locks/                 per-workspace run locks
///   logs/                  rolling log files
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub toml: PipewrightToml,
    pub verbose: bool,
    pub log_json: bool,
}

impl Config {
    /// Resolve the state dir (CLI → `PIPEWRIGHT_STATE_DIR` → `~/.pipewright`)
    /// and load the config file (CLI path → `<state_dir>/pipewright.toml`).
    pub fn new(
        state_dir: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let state_dir = resolve_state_dir(state_dir)?;
        let config_path = config_path.unwrap_or_else(|| state_dir.join(CONFIG_FILE_NAME));
        let toml = PipewrightToml::load_or_default(&config_path)?;

        Ok(Self {
            state_dir,
            config_path,
            toml,
            verbose: false,
            log_json: std::env::var("PIPEWRIGHT_LOG_JSON")
                .map(|v| env_flag(&v))
                .unwrap_or(false),
        })
    }

    pub fn with_cli_args(
        state_dir: Option<PathBuf>,
        config_path: Option<PathBuf>,
        verbose: bool,
        log_json: bool,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new(state_dir, config_path)?;
        config.verbose = verbose;
        config.log_json = config.log_json || log_json;
        Ok(config)
    }

    /// API key: `PIPEWRIGHT_API_KEY`, then `OPENAI_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        ["PIPEWRIGHT_API_KEY", "OPENAI_API_KEY"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|v| !v.trim().is_empty())
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("pipewright.db")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.state_dir.join("dist")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Create every directory in the state layout.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.state_dir.clone(),
            self.snapshots_dir(),
            self.runs_dir(),
            self.dist_dir(),
            self.locks_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    /// True when `target` is the state directory or one of its ancestors.
    /// A snapshot of such a target would copy itself, and a restore would
    /// clear the store.
    pub fn state_within(&self, target: &Path) -> bool {
        resolved(&self.state_dir).starts_with(resolved(target))
    }
}

/// `path` made absolute, with its longest existing prefix canonicalized.
fn resolved(path: &Path) -> PathBuf {
    let path = absolutize(path);
    let mut existing = path.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return rest.iter().rev().fold(canonical, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.clone(),
        }
    }
}

fn resolve_state_dir(cli: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = cli {
        return Ok(absolutize(&dir));
    }
    if let Ok(dir) = std::env::var("PIPEWRIGHT_STATE_DIR")
        && !dir.trim().is_empty()
    {
        return Ok(absolutize(Path::new(&dir)));
    }
    dirs::home_dir()
        .map(|home| home.join(".pipewright"))
        .ok_or(ConfigError::NoStateDir)
}

/// Join relative paths onto the current directory without touching the filesystem.
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
