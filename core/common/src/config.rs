//! Site configuration.
//!
//! A [`SiteConfig`] is read from `.sitesync.json` at the workspace root. It
//! is validated once and then shared read-only; a changed file produces a
//! new value that replaces the old one wholesale.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, RemotePath, Result};

/// File name of the per-workspace configuration file.
pub const CONFIG_FILE_NAME: &str = ".sitesync.json";

/// Remote file-transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Sftp,
}

impl Protocol {
    /// Well-known port for the protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp => 21,
            Protocol::Sftp => 22,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ftp => write!(f, "ftp"),
            Protocol::Sftp => write!(f, "sftp"),
        }
    }
}

/// Login credentials for the remote account.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Private key for SFTP public-key authentication.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key_path", &self.private_key_path)
            .finish()
    }
}

/// File watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatcherConfig {
    /// Glob selecting the files whose events are considered.
    pub files: String,
    /// Upload files after they are created or changed.
    pub auto_upload: bool,
    /// Delete remote counterparts of deleted files.
    pub auto_delete: bool,
    pub ignore_create: bool,
    pub ignore_update: bool,
    pub ignore_delete: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            files: "**/*".to_string(),
            auto_upload: false,
            auto_delete: false,
            ignore_create: false,
            ignore_update: false,
            ignore_delete: false,
        }
    }
}

/// Configuration of one remote site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    /// Display name of the site.
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub protocol: Protocol,
    /// Port; defaults to the protocol's well-known port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Remote directory the workspace root maps to.
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    #[serde(default = "default_true")]
    pub upload_on_save: bool,
    /// Reserved, currently has no effect.
    #[serde(default)]
    pub use_temp_file: bool,
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Extra glob patterns excluded from every transfer.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Handshake timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_remote_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    15
}

impl SiteConfig {
    /// Create a configuration with defaults for everything but the endpoint.
    pub fn new(host: impl Into<String>, protocol: Protocol) -> Self {
        let host = host.into();
        Self {
            name: host.clone(),
            host,
            protocol,
            port: None,
            credentials: Credentials::default(),
            remote_path: default_remote_path(),
            upload_on_save: true,
            use_temp_file: false,
            watcher: WatcherConfig::default(),
            ignore: Vec::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    /// Parse and validate a configuration from JSON text.
    ///
    /// # Errors
    /// - Malformed JSON or unknown protocol
    /// - Any violation reported by [`SiteConfig::validate`]
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Check the invariants components rely on.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        if self.port == Some(0) {
            return Err(Error::Config("port must be in 1..=65535".to_string()));
        }
        if self.remote_path.trim().is_empty() {
            return Err(Error::Config("remotePath must not be empty".to_string()));
        }
        if self.watcher.files.trim().is_empty() {
            return Err(Error::Config("watcher.files must not be empty".to_string()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "connectTimeoutSecs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Remote directory the workspace root maps to.
    pub fn remote_root(&self) -> RemotePath {
        RemotePath::parse(&self.remote_path)
    }

    /// `host:port` pair for socket connections.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }
}
