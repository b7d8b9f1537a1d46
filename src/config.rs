//! Configuration loading and persistence.
//!
//! Handles reading and writing the scriptbox configuration file. Every
//! runtime limit that is not a hard ceiling lives here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

/// Configuration for the script runtime.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Directory holding `scripts.json`, `settings.json` and this file.
    pub data_dir: PathBuf,
    /// HTTP timeout used when a request doesn't specify one.
    pub http_default_timeout_ms: u64,
    /// Upper clamp for per-request HTTP timeouts.
    pub http_max_timeout_ms: u64,
    /// Largest request body a script may send.
    pub http_max_request_body_bytes: usize,
    /// Largest response body that is buffered for a script.
    pub http_max_response_bytes: usize,
    /// How long `ws.send` waits for a connecting socket to open.
    pub ws_send_wait_ms: u64,
    /// Handshake timeout for `ws.connect`.
    pub ws_connect_timeout_ms: u64,
    /// Open WebSocket connections allowed per script.
    pub max_connections_per_script: usize,
    /// In-flight bridge requests allowed per script.
    pub max_pending_requests: usize,
    /// Per-script log ring capacity.
    pub max_log_entries: usize,
    /// Log messages longer than this (characters) are truncated.
    pub max_log_message_len: usize,
    /// Best-effort Lua heap limit per script.
    pub memory_limit_bytes: usize,
    /// Capacity of each host<->script channel.
    pub channel_capacity: usize,
    /// Retry a failed compile once after stripping non-ASCII text.
    pub compile_fallback: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::config_dir()
            .map(|d| d.join("scriptbox"))
            .unwrap_or_else(|| PathBuf::from(".scriptbox"));

        Self {
            data_dir,
            http_default_timeout_ms: 10_000,
            http_max_timeout_ms: 30_000,
            http_max_request_body_bytes: 1024 * 1024,
            http_max_response_bytes: 5 * 1024 * 1024,
            ws_send_wait_ms: 5_000,
            ws_connect_timeout_ms: 10_000,
            max_connections_per_script: 8,
            max_pending_requests: 64,
            max_log_entries: 500,
            max_log_message_len: 2000,
            memory_limit_bytes: 64 * 1024 * 1024,
            channel_capacity: 256,
            compile_fallback: true,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `SCRIPTBOX_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SCRIPTBOX_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("scriptbox")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = match Self::load_from(&dir.join("config.json")) {
            Ok(config) => config,
            Err(e) => {
                log::debug!("[config] Using defaults: {e:#}");
                Self::default()
            }
        };
        config.data_dir = dir;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file at an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SCRIPTBOX_CONFIG_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(timeout) = std::env::var("SCRIPTBOX_HTTP_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.http_default_timeout_ms = ms.min(self.http_max_timeout_ms);
            }
        }

        if let Ok(entries) = std::env::var("SCRIPTBOX_MAX_LOG_ENTRIES") {
            if let Ok(max) = entries.parse::<usize>() {
                self.max_log_entries = max.max(1);
            }
        }

        if let Ok(limit) = std::env::var("SCRIPTBOX_MEMORY_LIMIT") {
            if let Ok(bytes) = limit.parse::<usize>() {
                self.memory_limit_bytes = bytes;
            }
        }

        if std::env::var("SCRIPTBOX_STRICT_COMPILE").is_ok_and(|v| v == "1") {
            self.compile_fallback = false;
        }
    }

    /// Persists the current configuration to `data_dir/config.json`.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Path of the persisted script list.
    #[must_use]
    pub fn scripts_path(&self) -> PathBuf {
        self.data_dir.join("scripts.json")
    }

    /// Path of the settings collaborator's file.
    #[must_use]
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    /// Default HTTP timeout as a [`Duration`].
    #[must_use]
    pub fn http_default_timeout(&self) -> Duration {
        Duration::from_millis(self.http_default_timeout_ms)
    }

    /// Clamp a script-supplied timeout into `[1ms, http_max_timeout_ms]`.
    #[must_use]
    pub fn clamp_http_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms.unwrap_or(self.http_default_timeout_ms);
        Duration::from_millis(ms.clamp(1, self.http_max_timeout_ms.max(1)))
    }
}
