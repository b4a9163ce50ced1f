//! elogd configuration.
//!
//! Loaded from a TOML file (`--config`, default `elogd.toml`). Only the
//! database name is required; everything else has workable defaults.
//!
//! ```toml
//! listen = "0.0.0.0:8000"
//! upload-folder = "/var/lib/elogd/uploads"
//!
//! [database]
//! name = "/var/lib/elogd/elogd.db"
//!
//! [actions]
//! new-entry = "/usr/local/bin/notify-entry"
//!
//! [[users]]
//! login = "ada"
//! name = "Ada Lovelace"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::users::User;

/// Errors while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// elogd configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,

    /// Root of the blob tree for attachments.
    #[serde(default = "default_upload_folder")]
    pub upload_folder: PathBuf,

    /// Address the HTTP adapter binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Session secret, reserved for front-end use. Unused by the core.
    #[serde(default)]
    pub secret: Option<String>,

    /// Edit locks expire after this long.
    #[serde(default = "default_lock_ttl_minutes")]
    pub lock_ttl_minutes: i64,

    #[serde(default)]
    pub actions: ActionsConfig,

    /// Static user directory for author autocompletion.
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file.
    pub name: PathBuf,
}

/// Commands to run when signals fire, plus the worker-pool bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ActionsConfig {
    pub new_entry: Option<String>,
    pub edit_entry: Option<String>,
    pub new_logbook: Option<String>,
    pub edit_logbook: Option<String>,

    /// Jobs waiting for a worker; overflow is dropped with a warning.
    #[serde(default = "default_action_queue")]
    pub queue: usize,

    /// Handlers running at once.
    #[serde(default = "default_action_workers")]
    pub workers: usize,
}

fn default_upload_folder() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_lock_ttl_minutes() -> i64 {
    60
}

fn default_action_queue() -> usize {
    64
}

fn default_action_workers() -> usize {
    2
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            new_entry: None,
            edit_entry: None,
            new_logbook: None,
            edit_logbook: None,
            queue: default_action_queue(),
            workers: default_action_workers(),
        }
    }
}

impl Config {
    /// Load config from the given path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
