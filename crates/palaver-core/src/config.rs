//! Configuration for a palaver peer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PALAVER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/palaver/config.toml
//!   3. ~/.config/palaver/config.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Peer configuration. The services consume this read-only; a front end
/// may mutate `handle` and `autoreply` at runtime and persist them with
/// [`Config::save`]. A handle change is a LEAVE followed by a JOIN under
/// the new name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display name announced to the network. The registry key.
    pub handle: String,
    /// Inclusive range scanned for a free TCP/UDP data port.
    pub port_range: (u16, u16),
    /// Fixed UDP port for discovery traffic, shared by all peers on the LAN.
    pub whois_port: u16,
    /// Front-end auto-reply text. The services never read it.
    pub autoreply: String,
    /// Directory for received images. Created on demand.
    pub image_dir: PathBuf,
    /// Front-end display hints per handle. The services never read it.
    pub handle_colors: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handle: "anonymous".to_string(),
            port_range: (5000, 5010),
            whois_port: 4000,
            autoreply: String::new(),
            image_dir: data_dir().join("images"),
            handle_colors: BTreeMap::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("palaver")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("palaver")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading and saving ────────────────────────────────────────────────────────

impl Config {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from an explicit file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PALAVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            Config::default().save_to(&path)?;
        }
        Ok(path)
    }

    /// Persist to the default config file path.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::file_path())
    }

    /// Persist to an explicit path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply PALAVER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PALAVER_HANDLE") {
            self.handle = v;
        }
        if let Ok(v) = std::env::var("PALAVER_WHOIS_PORT") {
            if let Ok(p) = v.parse() {
                self.whois_port = p;
            }
        }
        if let Ok(v) = std::env::var("PALAVER_AUTOREPLY") {
            self.autoreply = v;
        }
        if let Ok(v) = std::env::var("PALAVER_IMAGE_DIR") {
            self.image_dir = PathBuf::from(v);
        }
    }
}
