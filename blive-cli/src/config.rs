//! `blive.toml` plus environment overrides.

use anyhow::{Context, Result};
use blive::ClientConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_CONFIG_FILE: &str = "blive.toml";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Rooms to listen to.
    pub rooms: Vec<u64>,
    /// Broadcasters whose rooms should be followed.
    pub users: Vec<u64>,
    pub log_dir: PathBuf,
    /// Connect only while the room is live.
    pub monitor: bool,
    pub client: ClientConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rooms: Vec::new(),
            users: Vec::new(),
            log_dir: PathBuf::from("."),
            monitor: false,
            client: ClientConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `path`, or `./blive.toml` when it exists, then apply the
    /// environment (`LIVE_ROOM_ID`, `COOKIE`, `LOG_PATH`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(rooms) = var("LIVE_ROOM_ID") {
            for room in parse_id_list(&rooms).context("Invalid LIVE_ROOM_ID")? {
                if !self.rooms.contains(&room) {
                    self.rooms.push(room);
                }
            }
        }
        if let Some(cookie) = var("COOKIE").filter(|c| !c.trim().is_empty()) {
            self.client.cookies = Some(cookie);
        }
        if let Some(log_path) = var("LOG_PATH").filter(|p| !p.trim().is_empty()) {
            self.log_dir = PathBuf::from(log_path);
        }
        Ok(())
    }
}

/// Parse `"1, 2,3"` into ids, skipping empty entries.
pub fn parse_id_list(value: &str) -> Result<Vec<u64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().with_context(|| format!("`{s}` is not a number")))
        .collect()
}
