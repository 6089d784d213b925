mod cli;
mod display;
mod error;
mod server;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, RunCommand};
use covidash::config::Config;
use log::debug;

const DEFAULT_LOGGING_LEVEL: &str = "warn";

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to `DEFAULT_LOGGING_LEVEL` if not set
    let _ =
        std::env::var("RUST_LOG").map_err(|_| std::env::set_var("RUST_LOG", DEFAULT_LOGGING_LEVEL));
    pretty_env_logger::init_timed();
    let args = Cli::parse();
    debug!("args: {args:?}");
    // Linux: ~/.config/covidash/config.toml, macOS: ~/Library/Application Support/covidash/config.toml
    let config = match dirs::config_dir() {
        Some(dir) => read_config(&dir.join("covidash").join("config.toml"))?,
        None => Config::default(),
    };
    debug!("config: {config:?}");

    if let Some(command) = args.command {
        command.run(config).await?;
    }
    Ok(())
}

/// Read the config file, using the defaults when it does not exist.
fn read_config(file_path: &Path) -> Result<Config> {
    match std::fs::read_to_string(file_path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("Invalid TOML in config file {}", file_path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e).with_context(|| format!("Error reading config file {}", file_path.display())),
    }
}
