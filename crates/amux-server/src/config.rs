//! Daemon configuration: a TOML file with command-line overrides on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the HTTP and WebSocket API.
    pub listen: SocketAddr,
    /// Directory holding per-session metadata and transcripts.
    pub data_dir: PathBuf,
    /// Command used to start adapter processes.
    pub adapter_command: String,
    /// Arguments passed to the adapter command ahead of the session flags.
    pub adapter_args: Vec<String>,
    /// Extra prompt text handed to every adapter.
    pub prompt_addendum: Option<String>,
    /// Origins allowed by CORS; "*" allows any.
    pub allow_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            data_dir: default_data_dir(),
            adapter_command: "amux-adapter".to_string(),
            adapter_args: Vec::new(),
            prompt_addendum: None,
            allow_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl Config {
    /// Read a config file. An explicit path must exist; the default path
    /// falls back to defaults when absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path(), false),
        };
        if !path.exists() {
            if required {
                bail!("config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

pub fn default_config_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("amux").join("config.toml");
    }
    home().join(".config").join("amux").join("config.toml")
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("amux");
    }
    home().join(".local").join("share").join("amux")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
