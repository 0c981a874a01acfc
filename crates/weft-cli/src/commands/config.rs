//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_info, print_success, print_warning};
use weft_core::config::{self, EndpointConfig};
use weft_core::error::ConfigError;

fn resolve(config_path: Option<&PathBuf>) -> PathBuf {
    config_path.cloned().unwrap_or_else(config::default_config_path)
}

/// Load the endpoint configuration
///
/// An explicit `--config` path must exist; a missing default file means
/// built-in defaults.
pub fn load_endpoint_config(config_path: Option<&PathBuf>) -> Result<EndpointConfig> {
    let path = resolve(config_path);
    let config = match config::load_config::<EndpointConfig>(&path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) if config_path.is_none() => EndpointConfig::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to load config from {:?}", path))
        }
    };

    config
        .validate()
        .with_context(|| format!("Invalid config in {:?}", path))?;
    Ok(config)
}

/// Print the effective configuration as TOML
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = resolve(config_path);
    if !path.exists() {
        print_warning(&format!("No config file at {:?}, showing defaults", path));
    }

    let config = load_endpoint_config(config_path)?;
    let content = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    println!("{}", content);
    Ok(())
}

/// Print the config file location
pub fn config_path(config_path: Option<&PathBuf>) {
    println!("{}", resolve(config_path).display());
}

/// Write a default config file
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = resolve(config_path);
    if path.exists() && !force {
        print_info(&format!("Config already exists at {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    write_default(&path)?;
    print_success(&format!("Wrote default config to {:?}", path));
    Ok(())
}

fn write_default(path: &Path) -> Result<()> {
    config::save_config(path, &EndpointConfig::default())
        .with_context(|| format!("Failed to write config to {:?}", path))
}
