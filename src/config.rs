use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::Identity;
use crate::transport::ReconnectPolicy;

/// Reconnect and liveness tuning, the `[reconnect]` table of config.toml.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub liveness_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            liveness_timeout_secs: 8,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

/// Boardlink configuration loaded from ~/.config/boardlink/config.toml + env vars
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BoardlinkConfig {
    pub server_url: Option<String>,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl BoardlinkConfig {
    /// Load config from file, then apply env var overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a config file without env overrides.  A missing file is an empty config.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str::<BoardlinkConfig>(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply `BOARDLINK_*` overrides.  Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(val) = get("BOARDLINK_SERVER_URL") {
            self.server_url = Some(val);
        }
        if let Some(val) = get("BOARDLINK_API_URL") {
            self.api_url = Some(val);
        }
        if let Some(val) = get("BOARDLINK_API_TOKEN") {
            self.api_token = Some(val);
        }
        if let Some(val) = get("BOARDLINK_USER_ID") {
            self.user_id = Some(val);
        }
        if let Some(val) = get("BOARDLINK_USER_NAME") {
            self.user_name = Some(val);
        }
        if let Some(val) = get("BOARDLINK_LOG") {
            self.log_level = Some(val);
        }
    }

    /// Set one file-backed setting by its config.toml key.  `reconnect.*`
    /// keys address the `[reconnect]` table.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let text = |slot: &mut Option<String>| {
            *slot = Some(value.to_string()).filter(|v| !v.is_empty());
        };
        let number = |name: &str| -> Result<u64> {
            value
                .parse::<u64>()
                .with_context(|| format!("`{name}` expects a non-negative integer, got '{value}'"))
        };
        match key {
            "server_url" => text(&mut self.server_url),
            "api_url" => text(&mut self.api_url),
            "user_id" => text(&mut self.user_id),
            "user_name" => text(&mut self.user_name),
            "log_level" => text(&mut self.log_level),
            "api_token" => anyhow::bail!("api_token is not stored on disk; set BOARDLINK_API_TOKEN instead"),
            "reconnect.max_retries" => {
                self.reconnect.max_retries = u32::try_from(number(key)?)
                    .with_context(|| format!("`{key}` is out of range"))?;
            }
            "reconnect.base_delay_ms" => self.reconnect.base_delay_ms = number(key)?,
            "reconnect.max_delay_ms" => self.reconnect.max_delay_ms = number(key)?,
            "reconnect.liveness_timeout_secs" => self.reconnect.liveness_timeout_secs = number(key)?,
            other => anyhow::bail!("Unknown config key '{other}'"),
        }
        Ok(())
    }

    /// Persist the config to the default location.
    pub fn save_to_disk(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Write non-secret settings to `path`, keeping any keys we don't manage.
    /// The API token is never written; supply it via `BOARDLINK_API_TOKEN`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        }

        // Load existing config.toml so we don't clobber other keys
        let mut existing = if path.exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str::<toml::Table>(&content).unwrap_or_default()
        } else {
            toml::Table::new()
        };

        existing.remove("api_token");
        let settings = [
            ("server_url", &self.server_url),
            ("api_url", &self.api_url),
            ("user_id", &self.user_id),
            ("user_name", &self.user_name),
            ("log_level", &self.log_level),
        ];
        for (key, value) in settings {
            if let Some(value) = value {
                existing.insert(key.into(), toml::Value::String(value.clone()));
            }
        }
        let reconnect = toml::Value::try_from(&self.reconnect)
            .with_context(|| "Failed to serialize reconnect settings")?;
        existing.insert("reconnect".into(), reconnect);

        let content = toml::to_string_pretty(&existing).with_context(|| "Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Get the config directory path: ~/.config/boardlink/
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("boardlink")
    }

    /// Get the config file path: ~/.config/boardlink/config.toml
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Display config with secrets masked
    pub fn display_masked(&self) -> String {
        let mask = |opt: &Option<String>| -> String {
            match opt {
                Some(s) if s.chars().count() > 8 => {
                    let count = s.chars().count();
                    let head: String = s.chars().take(4).collect();
                    let tail: String = s.chars().skip(count - 2).collect();
                    format!("{head}...{tail}")
                }
                Some(s) if !s.is_empty() => "****".to_string(),
                _ => "(not set)".to_string(),
            }
        };
        let shown = |opt: &Option<String>| opt.as_deref().unwrap_or("(not set)").to_string();

        let r = &self.reconnect;
        [
            format!("Config file: {}", Self::config_path().display()),
            format!("server_url: {}", self.server_url()),
            format!("api_url: {}", self.api_url()),
            format!("api_token: {}", mask(&self.api_token)),
            format!("user_id: {}", shown(&self.user_id)),
            format!("user_name: {}", shown(&self.user_name)),
            format!("log_level: {}", self.log_level()),
            String::new(),
            "[reconnect]".to_string(),
            format!("max_retries: {}", r.max_retries),
            format!("base_delay_ms: {}", r.base_delay_ms),
            format!("max_delay_ms: {}", r.max_delay_ms),
            format!("liveness_timeout_secs: {}", r.liveness_timeout_secs),
        ]
        .join("\n")
    }

    /// Get dashboard server URL with fallback default
    pub fn server_url(&self) -> &str {
        self.server_url.as_deref().unwrap_or("ws://127.0.0.1:8787")
    }

    /// Get session API URL with fallback default
    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or("http://127.0.0.1:8787/api")
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Local identity.  Errors when no user id is configured.
    pub fn identity(&self) -> Result<Identity> {
        let user_id = self
            .user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .context("No user id configured. Set `user_id` in config.toml or BOARDLINK_USER_ID")?;
        let user_name = self.user_name.as_deref().unwrap_or(user_id);
        Ok(Identity::new(user_id, user_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_defaults() {
        let config = BoardlinkConfig::default();
        assert_eq!(config.server_url(), "ws://127.0.0.1:8787");
        assert_eq!(config.api_url(), "http://127.0.0.1:8787/api");
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.reconnect.liveness_timeout(), Duration::from_secs(8));
        assert!(config.identity().is_err());
    }

    #[test]
    fn toml_parsing() {
        let toml_str = r#"
server_url = "wss://boards.example.com"
user_id = "u1"

[reconnect]
max_retries = 9
"#;
        let config: BoardlinkConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server_url(), "wss://boards.example.com");
        assert_eq!(config.reconnect.max_retries, 9);
        assert_eq!(config.reconnect.base_delay_ms, 500);
        let me = config.identity().unwrap();
        assert_eq!(me.user_name, "u1");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = BoardlinkConfig {
            server_url: Some("ws://file".into()),
            user_id: Some("file-user".into()),
            ..Default::default()
        };
        let env: HashMap<&str, &str> = [
            ("BOARDLINK_SERVER_URL", "ws://env"),
            ("BOARDLINK_USER_ID", ""),
            ("BOARDLINK_API_TOKEN", "tok-123456789"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.server_url(), "ws://env");
        assert_eq!(config.user_id.as_deref(), Some("file-user"));
        assert_eq!(config.api_token.as_deref(), Some("tok-123456789"));
    }

    #[test]
    fn process_env_is_read() {
        unsafe { std::env::set_var("BOARDLINK_LOG", "debug") };
        let mut config = BoardlinkConfig::default();
        config.apply_env(|key| std::env::var(key).ok());
        unsafe { std::env::remove_var("BOARDLINK_LOG") };
        assert_eq!(config.log_level(), "debug");
    }

    #[test]
    fn display_masked_hides_token() {
        let config = BoardlinkConfig {
            api_token: Some("supersecrettoken".into()),
            user_id: Some("u1".into()),
            ..Default::default()
        };
        let display = config.display_masked();
        assert!(display.contains("supe...en"));
        assert!(!display.contains("supersecrettoken"));
        assert!(display.contains("user_id: u1"));
        assert!(display.contains("user_name: (not set)"));
    }

    #[test]
    fn display_masked_counts_characters_not_bytes() {
        let config = BoardlinkConfig {
            api_token: Some("aéééééééé".into()),
            ..Default::default()
        };
        assert!(config.display_masked().contains("api_token: aééé...éé"));

        let short = BoardlinkConfig {
            api_token: Some("aéééé".into()),
            ..Default::default()
        };
        assert!(short.display_masked().contains("api_token: ****"));
    }

    #[test]
    fn set_updates_known_keys() {
        let mut config = BoardlinkConfig::default();
        config.set("server_url", "wss://boards.example.com").unwrap();
        config.set("reconnect.max_retries", "7").unwrap();
        config.set("reconnect.liveness_timeout_secs", "20").unwrap();
        assert_eq!(config.server_url(), "wss://boards.example.com");
        assert_eq!(config.reconnect.max_retries, 7);
        assert_eq!(config.reconnect.liveness_timeout(), Duration::from_secs(20));

        config.set("server_url", "").unwrap();
        assert!(config.server_url.is_none());
    }

    #[test]
    fn set_rejects_token_unknown_keys_and_bad_numbers() {
        let mut config = BoardlinkConfig::default();
        let err = config.set("api_token", "secret").unwrap_err();
        assert!(err.to_string().contains("BOARDLINK_API_TOKEN"));
        assert!(config.api_token.is_none());
        assert!(config.set("colour", "blue").is_err());
        assert!(config.set("reconnect.base_delay_ms", "-3").is_err());
        assert!(config.set("reconnect.max_retries", "99999999999").is_err());
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn set_then_save_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = BoardlinkConfig::load_from(&path).unwrap();
        config.set("user_id", "u42").unwrap();
        config.set("reconnect.base_delay_ms", "250").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = BoardlinkConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.user_id.as_deref(), Some("u42"));
        assert_eq!(reloaded.reconnect.base_delay_ms, 250);
    }

    #[test]
    fn save_keeps_foreign_keys_and_drops_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "theme = \"dark\"\napi_token = \"old\"\n").unwrap();

        let config = BoardlinkConfig {
            server_url: Some("ws://saved".into()),
            api_token: Some("secret".into()),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("theme = \"dark\""));
        assert!(!written.contains("secret"));
        assert!(!written.contains("api_token"));

        let reloaded = BoardlinkConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.server_url(), "ws://saved");
        assert_eq!(reloaded.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BoardlinkConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(config.server_url.is_none());
    }

    #[test]
    fn policy_from_reconnect_table() {
        let policy = ReconnectConfig {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 100,
            liveness_timeout_secs: 8,
        }
        .policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_delay, Duration::from_millis(200));
    }
}
