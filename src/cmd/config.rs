//! Configuration view and initialization: `pipewright config`.

use anyhow::Result;
use pipewright::config::Config;
use pipewright::pipewright_config::PipewrightToml;

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => show(config),
        Some(ConfigCommands::Init) => init(config),
    }
}

fn show(config: &Config) -> Result<()> {
    let toml = &config.toml;
    println!();
    println!("Pipewright Configuration");
    println!("========================");
    println!();
    println!("State dir:   {}", config.state_dir.display());
    if config.config_path.exists() {
        println!("Config file: {}", config.config_path.display());
    } else {
        println!(
            "Config file: {} (not found, using defaults)",
            config.config_path.display()
        );
    }
    println!();

    println!("[model]");
    println!("  provider = \"{}\"", toml.model.provider);
    println!("  name = \"{}\"", toml.model.name);
    println!("  base_url = \"{}\"", toml.model.base_url);
    println!("  timeout_secs = {}", toml.model.timeout_secs);
    println!();
    println!("[tools]");
    println!("  web_search = {}", toml.tools.web_search);
    println!("  file_search = {}", toml.tools.file_search);
    println!("  code_execution = {}", toml.tools.code_execution);
    println!("  vector_store_ids = {:?}", toml.tools.vector_store_ids);
    println!();
    println!("[sandbox]");
    println!("  allow_cli_tools = {}", toml.sandbox.allow_cli_tools);
    println!("  allow = {:?}", toml.sandbox.allow);
    println!("  deny_patterns = {:?}", toml.sandbox.deny_patterns);
    println!("  allow_package_install = {}", toml.sandbox.allow_package_install);
    println!("  command_timeout_secs = {}", toml.sandbox.command_timeout_secs);
    println!();
    println!("[pipeline]");
    println!("  fix_forward = {}", toml.pipeline.fix_forward);
    println!("  dry_run = {}", toml.pipeline.dry_run);
    println!();

    println!("Effective values (with env overrides):");
    println!("  model = \"{}\"", toml.model_name());
    println!("  dry_run = {}", toml.dry_run());
    println!(
        "  api_key = {}",
        if config.api_key().is_some() { "set" } else { "not set" }
    );
    println!();

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("Configuration is valid.");
    } else {
        println!("Configuration warnings:");
        for warning in warnings {
            println!("  - {}", warning);
        }
    }
    println!();
    Ok(())
}

fn init(config: &Config) -> Result<()> {
    let path = &config.config_path;
    if path.exists() {
        println!("pipewright.toml already exists at {}", path.display());
        println!("Delete it first if you want to recreate it.");
        return Ok(());
    }

    PipewrightToml::default().save(path)?;

    println!("Created pipewright.toml at {}", path.display());
    println!();
    println!("You can now customize:");
    println!("  - [model] provider, name, base_url, timeout_secs");
    println!("  - [tools] web_search, file_search, code_execution");
    println!("  - [sandbox] allow_cli_tools, allow, deny_patterns");
    println!();
    Ok(())
}
