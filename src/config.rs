// Client tuning knobs: TTLs, backoff, timeouts and history bounds

use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a typing heartbeat stays visible without a refresh.
    pub typing_ttl_ms: u64,
    /// How long an online heartbeat stays visible without a refresh.
    pub online_ttl_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction of the delay added or removed at random, e.g. 0.2 for +-20%.
    pub backoff_jitter: f64,
    pub resync_timeout_ms: u64,
    /// Total persistence attempts per send before the message is marked failed.
    pub send_attempts: u32,
    pub send_timeout_ms: u64,
    pub max_history: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            typing_ttl_ms: 3_000,
            online_ttl_ms: 30_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_jitter: 0.2,
            resync_timeout_ms: 10_000,
            send_attempts: 3,
            send_timeout_ms: 10_000,
            max_history: 1_000,
        }
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point `load_default` at a different file. Only the first call wins.
pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    let dir = dirs::config_dir()
        .ok_or_else(|| ChatError::Config("Could not determine config directory".to_string()))?;
    Ok(dir.join("famchat").join("config.json"))
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&contents)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded sync config from {}", path.display());
        Ok(config)
    }

    /// Load from the default location, falling back to built-in defaults
    /// when no file exists. Environment overrides are applied either way.
    pub fn load_default() -> Result<Self> {
        let path = default_config_path()?;
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            info!("No config at {}, using defaults", path.display());
            SyncConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_number("FAMCHAT_TYPING_TTL_MS") {
            self.typing_ttl_ms = ms;
        }
        if let Some(ms) = env_number("FAMCHAT_RESYNC_TIMEOUT_MS") {
            self.resync_timeout_ms = ms;
        }
        if let Some(attempts) = env_number("FAMCHAT_SEND_ATTEMPTS") {
            self.send_attempts = attempts as u32;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.typing_ttl_ms == 0 || self.online_ttl_ms == 0 {
            return Err(ChatError::Config("presence TTLs must be non-zero".to_string()));
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ChatError::Config(format!(
                "invalid backoff window {}ms..{}ms",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(ChatError::Config(format!(
                "backoff jitter {} outside [0, 1)",
                self.backoff_jitter
            )));
        }
        if self.send_attempts == 0 {
            return Err(ChatError::Config("send_attempts must be at least 1".to_string()));
        }
        if self.resync_timeout_ms == 0 || self.send_timeout_ms == 0 {
            return Err(ChatError::Config("timeouts must be non-zero".to_string()));
        }
        if self.max_history == 0 {
            return Err(ChatError::Config("max_history must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn online_ttl(&self) -> Duration {
        Duration::from_millis(self.online_ttl_ms)
    }

    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}
