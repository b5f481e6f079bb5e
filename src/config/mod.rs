use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::credentials::validate_key;

/// Config file read when `REFRESHER_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "jwt_refresher.db";

/// Service configuration.
///
/// Loaded from TOML, then overridden by `REFRESHER_*` environment variables.
#[derive(Clone, Deserialize)]
pub struct RefresherConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Admin API credentials
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Base64-encoded 32-byte key for token encryption
    #[serde(default)]
    pub encryption_key: String,
    /// Log file name, relative to the data directory
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_port() -> u16 {
    3007
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_file() -> String {
    "refresher.log".to_string()
}

fn default_tick_interval_secs() -> u64 {
    60
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
            username: String::new(),
            password: String::new(),
            encryption_key: String::new(),
            log_file: default_log_file(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

// Secrets stay out of debug output
impl fmt::Debug for RefresherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefresherConfig")
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("username", &self.username)
            .field("log_file", &self.log_file)
            .field("tick_interval_secs", &self.tick_interval_secs)
            .finish_non_exhaustive()
    }
}

impl RefresherConfig {
    /// Loads the config file (if present), applies environment overrides and
    /// validates the result.
    pub fn load() -> Result<Self> {
        let path = std::env::var("REFRESHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_with(&path, |key| std::env::var(key).ok())
    }

    /// Same as [`RefresherConfig::load`] with an explicit path and variable
    /// lookup.
    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        cfg.apply_env_overrides_from(lookup);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Overrides fields from environment variables. Unparseable numbers are
    /// ignored.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("REFRESHER_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.port = port;
            }
        }
        if let Some(v) = get("REFRESHER_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("REFRESHER_USERNAME") {
            self.username = v;
        }
        if let Some(v) = get("REFRESHER_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = get("REFRESHER_ENCRYPTION_KEY") {
            self.encryption_key = v;
        }
        if let Some(v) = get("REFRESHER_LOG_FILE") {
            self.log_file = v;
        }
        if let Some(v) = get("REFRESHER_TICK_INTERVAL_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.tick_interval_secs = secs;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() || self.password.is_empty() {
            bail!("username and password must be set via config file or REFRESHER_USERNAME / REFRESHER_PASSWORD");
        }
        if self.encryption_key.is_empty() {
            bail!("encryption_key must be set via config file or REFRESHER_ENCRYPTION_KEY (base64-encoded 32-byte key)");
        }
        validate_key(&self.encryption_key).context("Invalid encryption key")?;
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Moves a database left at `legacy` into `data_dir`.
///
/// Does nothing if `legacy` does not exist or `data_dir` already has a
/// database. Returns true if a file was moved.
pub fn relocate_legacy_database(legacy: &Path, data_dir: &Path) -> Result<bool> {
    if !legacy.exists() {
        return Ok(false);
    }

    let target = data_dir.join(DB_FILE_NAME);
    if target.exists() {
        warn!(
            legacy = %legacy.display(),
            target = %target.display(),
            "Database already present in data directory, legacy database will not be used"
        );
        return Ok(false);
    }

    info!(from = %legacy.display(), to = %target.display(), "Relocating legacy database");
    if let Err(e) = std::fs::rename(legacy, &target) {
        // Rename fails across filesystems
        warn!(error = %e, "Rename failed, copying database instead");
        std::fs::copy(legacy, &target).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                legacy.display(),
                target.display()
            )
        })?;
        std::fs::remove_file(legacy)
            .with_context(|| format!("Failed to remove {}", legacy.display()))?;
    }

    Ok(true)
}
