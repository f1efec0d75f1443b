//! Session configuration.
//!
//! Stored as JSON at `~/.guts/gut-sync.json` by default. Every field has a
//! default so a missing file (or a partial one) is valid. The CLI builds one
//! `SyncConfig` at startup and threads it through session construction; it is
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Name of the config file inside the guts home directory.
pub const CONFIG_FILE_NAME: &str = "gut-sync.json";

/// How commands reach the remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One persistent ssh ControlMaster session shared by every command.
    #[default]
    Multiplexed,
    /// A fresh ssh invocation per command.
    Direct,
}

impl std::str::FromStr for TransportKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "multiplexed" => Ok(TransportKind::Multiplexed),
            "direct" => Ok(TransportKind::Direct),
            other => Err(SyncError::Config(format!(
                "unknown transport '{}' (expected 'multiplexed' or 'direct')",
                other
            ))),
        }
    }
}

/// Tunable settings for a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last change event before a flush.
    pub debounce_ms: u64,
    /// Pause between wiring an upstream and the first pull during bootstrap.
    pub bootstrap_delay_ms: u64,
    /// Delay before a watcher process that exited is started again.
    pub watch_restart_delay_ms: u64,
    /// Per-node directory holding the backend build and daemon links,
    /// relative to that node's home directory unless absolute.
    pub guts_home: String,
    /// Backend version expected by `gut-sync build`.
    pub backend_version: String,
    /// Branch pulled from the peer.
    pub branch: String,
    /// Message used for automatic commits.
    pub commit_message: String,
    pub transport: TransportKind,
    /// Use autossh (with a monitor port) for the tunnel instead of plain ssh.
    pub use_autossh: bool,
    /// Candidates tried by the port allocator before giving up.
    pub port_attempts: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            bootstrap_delay_ms: 2000,
            watch_restart_delay_ms: 1000,
            guts_home: ".guts".to_string(),
            backend_version: "2.2.2".to_string(),
            branch: "master".to_string(),
            commit_message: "autocommit".to_string(),
            transport: TransportKind::default(),
            use_autossh: false,
            port_attempts: 64,
        }
    }
}

impl SyncConfig {
    /// Load config from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&data).map_err(|e| {
            SyncError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to `path` (write to a temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Default config location on the local machine.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".guts").join(CONFIG_FILE_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(SyncError::Config("debounce_ms must be positive".into()));
        }
        if self.guts_home.trim().is_empty() {
            return Err(SyncError::Config("guts_home must not be empty".into()));
        }
        if self.port_attempts == 0 {
            return Err(SyncError::Config("port_attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn bootstrap_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_delay_ms)
    }

    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_millis(self.watch_restart_delay_ms)
    }
}
