// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration.
//!
//! Everything lives under one home directory, `$MODELDEPOT_HOME` or
//! `~/.modeldepot`:
//!
//! ```text
//! ~/.modeldepot/
//!   config.json   optional overrides (see ConfigFile)
//!   state.json    persisted downloads and linked models
//!   incoming/     staging directory for in-flight transfers
//!   models/       the model library
//! ```
//!
//! Relative paths in `config.json` are resolved against the home directory.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "MODELDEPOT_HOME";

const CONFIG_FILE: &str = "config.json";

/// On-disk overrides. Every field is optional.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub staging_dir: Option<PathBuf>,
    pub library_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    /// Window for coalescing progress writes (default: 500)
    pub progress_debounce_ms: Option<u64>,
    /// Period of the background sweeper (default: 30)
    pub sweep_interval_secs: Option<u64>,
    /// Events a slow subscriber may fall behind by (default: 256)
    pub event_capacity: Option<usize>,
    /// HTTP connect timeout (default: 30)
    pub http_connect_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct DepotConfig {
    pub home: PathBuf,
    pub staging_dir: PathBuf,
    pub library_dir: PathBuf,
    pub state_file: PathBuf,
    pub progress_debounce_ms: u64,
    pub sweep_interval_secs: u64,
    pub event_capacity: usize,
    pub http_connect_timeout_secs: u64,
    pub user_agent: String,
}

fn default_user_agent() -> String {
    format!("modeldepot/{}", env!("CARGO_PKG_VERSION"))
}

impl DepotConfig {
    /// Defaults rooted at `home`.
    pub fn for_root(home: impl Into<PathBuf>) -> Self {
        Self::resolve(home.into(), ConfigFile::default())
    }

    /// Load `config.json` from the home directory, if present.
    pub fn load() -> Result<Self> {
        let home = home_dir()?;
        let path = home.join(CONFIG_FILE);
        let file = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            ConfigFile::default()
        };
        Ok(Self::resolve(home, file))
    }

    fn resolve(home: PathBuf, file: ConfigFile) -> Self {
        let under_home = |path: Option<PathBuf>, default: &str| match path {
            Some(p) if p.is_absolute() => p,
            Some(p) => home.join(p),
            None => home.join(default),
        };

        Self {
            staging_dir: under_home(file.staging_dir, "incoming"),
            library_dir: under_home(file.library_dir, "models"),
            state_file: under_home(file.state_file, "state.json"),
            progress_debounce_ms: file.progress_debounce_ms.unwrap_or(500),
            sweep_interval_secs: file.sweep_interval_secs.unwrap_or(30).max(1),
            event_capacity: file.event_capacity.unwrap_or(256).max(1),
            http_connect_timeout_secs: file.http_connect_timeout_secs.unwrap_or(30),
            user_agent: file.user_agent.unwrap_or_else(default_user_agent),
            home,
        }
    }

    pub fn progress_debounce(&self) -> Duration {
        Duration::from_millis(self.progress_debounce_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout_secs)
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE)
    }
}

/// `$MODELDEPOT_HOME`, else `~/.modeldepot`.
pub fn home_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".modeldepot"))
}
