//! File-based configuration.
//!
//! Every field is optional in the file. Unset addresses fall back to the
//! environment variables in [`listener`](crate::listener) at bind time.
//!
//! ```toml
//! listen_addr = ":8443"
//! shutdown_timeout_secs = 30
//! hsts_max_age = 63072000
//!
//! [tls]
//! cert_path = "/etc/sluice/tls.cert"
//! key_path = "/etc/sluice/tls.key"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::tls::TlsSettings;

const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TCP address, `host:port` or `:port`.
    pub listen_addr: Option<String>,
    /// Unix socket path. Takes precedence over `listen_addr` when set.
    pub listen_path: Option<PathBuf>,
    pub tls: Option<TlsFiles>,
    /// Graceful drain window given to [`Server::stop`](crate::Server::stop).
    pub shutdown_timeout_secs: u64,
    /// Enables [`hsts`](crate::middleware::hsts) when set.
    pub hsts_max_age: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: None,
            listen_path: None,
            tls: None,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            hsts_max_age: None,
        }
    }
}

impl Config {
    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Loads the configured certificate and key, if any.
    pub fn tls_settings(&self) -> Result<Option<TlsSettings>> {
        self.tls
            .as_ref()
            .map(|files| TlsSettings::from_pem_files(&files.cert_path, &files.key_path))
            .transpose()
    }
}
