//! Initialize the configuration directory: create ~/.perch, a default config and an empty history file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::history::HistoryStore;

/// Paths touched by [`init_config_dir`].
#[derive(Debug, Clone)]
pub struct InitReport {
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    pub history_path: PathBuf,
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with every default spelled out if missing. Existing files are left alone.
/// - Creates the history file (`[]`) at the resolved history path.
pub fn init_config_dir(config_path: &Path) -> Result<InitReport> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let history_path = config::resolve_history_path(&config, config_path);
    HistoryStore::open(&history_path)
        .with_context(|| format!("creating history file {}", history_path.display()))?;

    Ok(InitReport {
        config_dir: config_dir.to_path_buf(),
        config_path: config_path.to_path_buf(),
        history_path,
    })
}
