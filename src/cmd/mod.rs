//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled     |
//! |-----------|----------------------|
//! | `run`     | `Run`                |
//! | `inspect` | `Show`, `History`    |
//! | `package` | `Package`            |
//! | `recover` | `Recover`            |
//! | `config`  | `Config`             |

pub mod config;
pub mod inspect;
pub mod package;
pub mod recover;
pub mod run;

pub use config::cmd_config;
pub use inspect::{cmd_history, cmd_show};
pub use package::cmd_package;
pub use recover::cmd_recover;
pub use run::cmd_run;

use anyhow::{Context, Result};
use pipewright::config::Config;
use pipewright::store::{RunStore, StoreHandle};

/// Create the state layout and open the run store.
pub(crate) fn open_store(config: &Config) -> Result<RunStore> {
    config
        .ensure_layout()
        .with_context(|| format!("Failed to create state dir {}", config.state_dir.display()))?;
    RunStore::new(&config.db_path())
        .with_context(|| format!("Failed to open run store {}", config.db_path().display()))
}

pub(crate) fn open_store_handle(config: &Config) -> Result<StoreHandle> {
    Ok(StoreHandle::new(open_store(config)?))
}
