//! Loopback configuration.
//!
//! Read from the JSON file named on the command line (or in
//! `PEERSHARE_CONFIG`). A missing path means defaults; a file that does not
//! parse is reported and replaced by defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PEERSHARE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Host display name, also its id on the in-memory network.
    pub name: String,
    /// Directory shared by the host.
    pub share_dir: PathBuf,
    /// Where uploads land.
    pub upload_dir: PathBuf,
    /// Session passphrase; empty means plaintext.
    pub passphrase: String,
    pub allow_uploads: bool,
    /// Host chunk size in bytes.
    pub chunk_size: u64,
    /// Re-upload each downloaded file as `copy-<name>`.
    pub reupload: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "loopback".into(),
            share_dir: PathBuf::from("."),
            upload_dir: std::env::temp_dir().join("peershare-uploads"),
            passphrase: String::new(),
            allow_uploads: true,
            chunk_size: peershare_protocol::constants::DEFAULT_CHUNK_SIZE,
            reupload: true,
        }
    }
}

impl Config {
    /// Loads the file named by the first argument or [`CONFIG_ENV`].
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::args_os()
            .nth(1)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        match path {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Config>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    "failed to parse loopback config, using defaults: {e}"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn passphrase(&self) -> Option<&str> {
        Some(self.passphrase.as_str()).filter(|p| !p.is_empty())
    }
}
