//! Config Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

use webprobe_common::HarnessConfig;

use crate::output::{print_success, print_value, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Write a configuration file with default values
    Init {
        /// Destination file
        #[arg(default_value = "webprobe.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Write the default configuration as TOML
pub fn write_default(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let content = toml::to_string_pretty(&HarnessConfig::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

pub async fn execute(cmd: ConfigCommands, config: HarnessConfig, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Json | OutputFormat::Yaml => print_value(&config, format),
            _ => println!("{}", toml::to_string_pretty(&config)?),
        },
        ConfigCommands::Init { path, force } => {
            write_default(&path, force)?;
            print_success(&format!("Wrote {}", path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_round_trips_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webprobe.toml");
        write_default(&path, false).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded.default_command_timeout_ms, 4_000);
        assert_eq!(loaded.webdriver.browser, "chrome");
        assert!(write_default(&path, false).is_err());
        assert!(write_default(&path, true).is_ok());
    }
}
