//! Server configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::negotiator::Limits;
use crate::{Error, Result};

/// Settings for one server process, usually read from a TOML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Directory holding the bare repositories.
    pub projects_root: PathBuf,
    /// Externally visible base URL used in action hrefs.
    pub server_url: String,
    /// Lifetime of issued transfer actions, in seconds.
    pub action_ttl_secs: u64,
    pub max_batch_objects: usize,
    pub max_object_size: Option<u64>,
    pub allow_anonymous_download: bool,
    pub allow_anonymous_upload: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            projects_root: PathBuf::from("."),
            server_url: "http://localhost:5000".to_string(),
            action_ttl_secs: 3600,
            max_batch_objects: 1000,
            max_object_size: None,
            allow_anonymous_download: true,
            allow_anonymous_upload: false,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn server_url(&self) -> Result<Url> {
        Url::parse(&self.server_url)
            .map_err(|e| Error::Config(format!("invalid server_url {:?}: {}", self.server_url, e)))
    }

    pub fn action_ttl(&self) -> Result<chrono::Duration> {
        i64::try_from(self.action_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| Error::Config(format!("action_ttl_secs out of range: {}", self.action_ttl_secs)))
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_batch_objects: self.max_batch_objects,
            max_object_size: self.max_object_size,
        }
    }
}
