//! Configuration loading and persistence.
//!
//! Settings live in `config.json` under the platform config directory,
//! with `PANE_PUSH_*` environment variable overrides. The shared notify
//! secret is generated on first run and stored alongside the other
//! settings with owner-only permissions.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

/// Configuration for the pane-push server.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind: String,
    /// Shared secret required by the notify endpoint (`x-api-key` header).
    #[serde(default)]
    pub api_key: String,
    /// VAPID claim contact (`mailto:` or https URL), sent as the `sub`
    /// claim on every push request.
    pub push_contact: String,
    /// Directories sessions may be created in. Tilde-expanded.
    #[serde(default)]
    pub session_dirs: Vec<String>,
    /// Command injected into a freshly created session.
    #[serde(default = "default_session_command")]
    pub session_command: String,
}

fn default_session_command() -> String {
    "claude".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8765".to_string(),
            api_key: String::new(),
            push_contact: "mailto:admin@example.com".to_string(),
            session_dirs: Vec::new(),
            session_command: default_session_command(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `PANE_PUSH_CONFIG_DIR` overrides the platform default; tests point
    /// it at a temp directory to stay isolated.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(custom) = std::env::var("PANE_PUSH_CONFIG_DIR") {
            PathBuf::from(custom)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join("pane-push")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Returns the data directory holding the persisted collections.
    pub fn data_dir() -> Result<PathBuf> {
        let dir = if let Ok(custom) = std::env::var("PANE_PUSH_DATA_DIR") {
            PathBuf::from(custom)
        } else {
            dirs::data_dir()
                .context("could not determine data directory")?
                .join("pane-push")
        };
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("PANE_PUSH_BIND") {
            self.bind = bind;
        }
        if let Ok(api_key) = std::env::var("PANE_PUSH_API_KEY") {
            self.api_key = api_key;
        }
        if let Ok(contact) = std::env::var("PANE_PUSH_CONTACT") {
            self.push_contact = contact;
        }
        if let Ok(dirs) = std::env::var("PANE_PUSH_SESSION_DIRS") {
            self.session_dirs = dirs
                .split(':')
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(command) = std::env::var("PANE_PUSH_SESSION_COMMAND") {
            self.session_command = command;
        }
    }

    /// Persists the current configuration with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Generate and persist the shared notify secret if none is set yet.
    /// Returns whether a new key was generated.
    pub fn ensure_api_key(&mut self) -> Result<bool> {
        if !self.api_key.is_empty() {
            return Ok(false);
        }
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        self.api_key = BASE64URL.encode(bytes);
        self.save()?;
        log::info!("[Config] Generated new API key");
        Ok(true)
    }

    /// Session directory allow-list, tilde-expanded to absolute paths.
    pub fn allowed_session_dirs(&self) -> Vec<PathBuf> {
        self.session_dirs
            .iter()
            .map(|d| PathBuf::from(shellexpand::tilde(d).into_owned()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind, "0.0.0.0:8765");
        assert!(config.api_key.is_empty());
        assert_eq!(config.session_command, "claude");
        assert!(config.session_dirs.is_empty());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        // Older config files predate session_command / session_dirs.
        let config: Config = serde_json::from_str(
            r#"{"bind":"127.0.0.1:9000","push_contact":"mailto:me@example.com"}"#,
        )
        .expect("deserialize");
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.session_command, "claude");
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn test_allowed_session_dirs_expands_tilde() {
        let config = Config {
            session_dirs: vec!["~/projects/demo".to_string(), "/srv/work".to_string()],
            ..Default::default()
        };
        let dirs = config.allowed_session_dirs();
        assert_eq!(dirs.len(), 2);
        assert!(!dirs[0].to_string_lossy().contains('~'));
        assert_eq!(dirs[1], PathBuf::from("/srv/work"));
    }
}
