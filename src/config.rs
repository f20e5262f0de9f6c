//! Configuration at `~/.attache/config.json`.
//!
//! Missing file means defaults: the server can come up before login and the
//! consent flow fills in the Google client settings later. The Claude API key
//! is never written to disk; it comes from `ANTHROPIC_API_KEY`.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: String,
    pub google: GoogleConfig,
    pub claude: ClaudeConfig,
    /// Default sync window when the request doesn't specify one.
    pub email_days_back: u32,
    /// Hard cap on messages fetched per sync.
    pub max_results: u32,
    /// Body excerpt budget per message, in characters.
    pub excerpt_chars: usize,
    /// Per-request timeout for Gmail calls, in seconds.
    pub mail_timeout_secs: u64,
    /// Per-request timeout for Claude calls, in seconds.
    pub llm_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaudeConfig {
    pub model: String,
    pub max_tokens: u32,
    pub api_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            google: GoogleConfig::default(),
            claude: ClaudeConfig::default(),
            email_days_back: 30,
            max_results: 50,
            excerpt_chars: 1000,
            mail_timeout_secs: 30,
            llm_timeout_secs: 60,
        }
    }
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 4000,
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
        }
    }
}

/// Canonical config file path (`~/.attache/config.json`).
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".attache").join("config.json"))
}

/// Load configuration, falling back to defaults when no file exists.
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(Config::default());
    }

    let content =
        fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply a mutation to the config and write it back atomically enough for a
/// single-user tool: mutate a clone, persist, then hand the new value back.
pub fn update_config(
    current: &Config,
    mutator: impl FnOnce(&mut Config),
) -> Result<Config, String> {
    let mut config = current.clone();
    mutator(&mut config);

    let path = config_path()?;
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
    }

    let content = serde_json::to_string_pretty(&config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;

    Ok(config)
}

/// The Claude API key, from the environment only.
pub fn claude_api_key() -> Option<String> {
    std::env::var("ANTHROPIC_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
}
