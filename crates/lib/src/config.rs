//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.perch/config.json`) and environment.
//! Every field has a default so an empty `{}` file (or no file at all) is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Messages API settings (endpoint, model, headers, key).
    #[serde(default)]
    pub api: ApiConfig,

    /// Local tool execution settings.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Conversation history file.
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Remote Messages API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Base URL without the `/messages` suffix (default "https://api.anthropic.com/v1").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Max-token budget for one response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Value of the `anthropic-version` header.
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,

    /// Value of the `anthropic-beta` header; enables the computer, text editor and bash tool types.
    #[serde(default = "default_beta_flag")]
    pub beta_flag: String,

    /// API key. Overridden by ANTHROPIC_API_KEY env.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

fn default_beta_flag() -> String {
    "computer-use-2024-10-22".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            anthropic_version: default_anthropic_version(),
            beta_flag: default_beta_flag(),
            api_key: None,
        }
    }
}

/// Tool execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    /// Seconds a `bash` tool command may run before it is killed (default 30).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Screenshot command as argv; `{path}` is replaced by the PNG file to write.
    /// When absent a platform default is used (`screencapture` on macOS, ImageMagick `import` elsewhere).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_command: Option<Vec<String>>,
}

fn default_command_timeout_secs() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            screenshot_command: None,
        }
    }
}

impl ToolsConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

/// History file settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    /// Override the history file location. Relative paths are resolved against the config file's parent.
    /// Overridden by PERCH_HISTORY_PATH env.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Trimmed, non-empty value of an environment variable.
fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the API key: env ANTHROPIC_API_KEY overrides config. Fails when neither is set,
/// so callers learn about a missing key before any request is attempted.
pub fn resolve_api_key(config: &Config) -> Result<String> {
    env_non_empty("ANTHROPIC_API_KEY")
        .or_else(|| {
            config
                .api
                .api_key
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no API key configured; set ANTHROPIC_API_KEY or api.apiKey in the config file"
            )
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PERCH_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".perch").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Default history file: `<data dir>/Perch/history.json` (e.g. `~/Library/Application Support/Perch` on macOS).
pub fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .map(|d| d.join("Perch").join("history.json"))
        .unwrap_or_else(|| PathBuf::from("history.json"))
}

/// Resolve the history file: PERCH_HISTORY_PATH env, then `history.path` (relative to the config file's parent), then the default.
pub fn resolve_history_path(config: &Config, config_path: &Path) -> PathBuf {
    if let Some(p) = env_non_empty("PERCH_HISTORY_PATH") {
        return PathBuf::from(p);
    }
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.history.path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => default_history_path(),
    }
}

/// Load config from the default path (or PERCH_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_messages_api() {
        let api = ApiConfig::default();
        assert_eq!(api.base_url, "https://api.anthropic.com/v1");
        assert_eq!(api.max_tokens, 1024);
        assert_eq!(api.anthropic_version, "2023-06-01");
        assert_eq!(api.beta_flag, "computer-use-2024-10-22");
        assert_eq!(ToolsConfig::default().command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn empty_object_parses_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.api.model, default_model());
        assert_eq!(config.tools.command_timeout_secs, 30);
        assert!(config.history.path.is_none());
    }

    #[test]
    fn camel_case_fields_are_read() {
        let config: Config = serde_json::from_str(
            r#"{"api":{"maxTokens":2048,"apiKey":"k"},"tools":{"commandTimeoutSecs":5,"screenshotCommand":["grim","{path}"]}}"#,
        )
        .unwrap();
        assert_eq!(config.api.max_tokens, 2048);
        assert_eq!(config.api.api_key.as_deref(), Some("k"));
        assert_eq!(config.tools.command_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.tools.screenshot_command,
            Some(vec!["grim".to_string(), "{path}".to_string()])
        );
    }

    #[test]
    fn history_path_relative_override() {
        let mut config = Config::default();
        config.history.path = Some(PathBuf::from("data/history.json"));
        let path = Path::new("/home/user/.perch/config.json");
        if std::env::var("PERCH_HISTORY_PATH").is_err() {
            assert_eq!(
                resolve_history_path(&config, path),
                PathBuf::from("/home/user/.perch/data/history.json")
            );
        }
    }

    #[test]
    fn history_path_absolute_override() {
        let mut config = Config::default();
        config.history.path = Some(PathBuf::from("/var/perch/history.json"));
        let path = Path::new("/home/user/.perch/config.json");
        if std::env::var("PERCH_HISTORY_PATH").is_err() {
            assert_eq!(
                resolve_history_path(&config, path),
                PathBuf::from("/var/perch/history.json")
            );
        }
    }

    #[test]
    fn api_key_from_config_when_env_unset() {
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            return;
        }
        let mut config = Config::default();
        assert!(resolve_api_key(&config).is_err());
        config.api.api_key = Some("  sk-test  ".to_string());
        assert_eq!(resolve_api_key(&config).unwrap(), "sk-test");
    }
}
