use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// A language server launched over stdio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LspServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl LspServerConfig {
    /// Full command line, program first.
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Bridge settings, read from `~/.config/tether/config.json`.
///
/// Missing fields fall back to their defaults so older config files keep
/// working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upper bound for a blocking content fetch.
    pub sync_fetch_timeout_ms: u64,
    /// How long a removal or rename of the watched file may wait for its
    /// other half before it stops counting as a move.
    pub move_window_ms: u64,
    /// Extension (without dot) → stdio language server.
    pub servers: HashMap<String, LspServerConfig>,
    /// Extension (without dot) → websocket URL of an already running server.
    pub ws_servers: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            sync_fetch_timeout_ms: 5000,
            move_window_ms: 1000,
            servers: HashMap::new(),
            ws_servers: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn sync_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_fetch_timeout_ms)
    }

    pub fn move_window(&self) -> Duration {
        Duration::from_millis(self.move_window_ms)
    }

    /// Load the global config. A missing file yields defaults; an invalid one
    /// is logged and ignored.
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("{}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::file_io(path, e))?;
        serde_json::from_str(&contents).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::file_io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| Error::file_io(path, e))
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("tether").join("config.json"));
    }
    dirs::config_dir().map(|dir| dir.join("tether").join("config.json"))
}
