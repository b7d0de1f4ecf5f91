//! Configuration file structures for mxlink.
//!
//! The configuration is a YAML file split into two sections: the Matrix account
//! and the sync tunables. Every value can be overridden from the environment
//! with the `MXLINK_` prefix, `__` separating nested keys.
//!
//! # Configuration File Format
//!
//! ```yaml
//! matrix:
//!   # User id, email address or phone number (+33...)
//!   login: "@alice:example.org"
//!   password: "secret-password"
//!   # Optional, discovered from the user id when missing
//!   homeserver: "https://matrix.example.org"
//!
//! sync:
//!   # Seconds before a sync paused by network trouble is retried
//!   resync_interval: 10
//!   # Long-poll timeouts in milliseconds, before and after the first sync
//!   initial_timeout: 10000
//!   timeout: 30000
//!   max_connections: 4
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```bash
//! export MXLINK_MATRIX__PASSWORD="secret-from-env"
//! export MXLINK_SYNC__TIMEOUT=60000
//! ```

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;

use crate::matrix::{ApiConfig, Error, Secret, Session};

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "MXLINK_";

/// Root configuration structure.
#[derive(Deserialize, Debug)]
pub struct Config {
    /// Matrix account configuration
    pub matrix: Matrix,
    /// Sync loop tunables
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Matrix account configuration.
///
/// # YAML Section
///
/// ```yaml
/// matrix:
///   login: "@alice:example.org"
///   password: "your-password"
/// ```
#[derive(Deserialize, Debug)]
pub struct Matrix {
    /// User id, email address or phone number used to login.
    ///
    /// # Examples
    ///
    /// - `@alice:example.org`
    /// - `alice@example.org`
    /// - `+33612345678`
    pub login: String,

    /// Account password.
    ///
    /// Needed for the first login and to login again when the access token
    /// expires.
    #[serde(default)]
    pub password: Option<Secret>,

    /// Homeserver base URL. Discovered from `login` when it is a user id.
    #[serde(default)]
    pub homeserver: Option<String>,

    /// Access token of an existing session, used instead of a password login.
    #[serde(default)]
    pub access_token: Option<Secret>,

    /// Device to login as.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Sync loop tunables.
#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct SyncSettings {
    /// Seconds before a sync paused by network trouble is retried.
    pub resync_interval: u64,
    /// Long-poll timeout in milliseconds until the first successful sync.
    pub initial_timeout: u64,
    /// Long-poll timeout in milliseconds afterwards.
    pub timeout: u64,
    /// Concurrent requests per host.
    pub max_connections: usize,
    /// Look up `.well-known` over plain http, for local test servers.
    pub insecure_discovery: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            resync_interval: 10,
            initial_timeout: 10_000,
            timeout: 30_000,
            max_connections: 4,
            insecure_discovery: false,
        }
    }
}

impl Config {
    /// Loads the configuration from a YAML file, then applies environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, or if a required value is
    /// missing or has the wrong type.
    pub fn load(path: &str) -> Result<Config, figment::Error> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Builds the session described by the `matrix` section.
    ///
    /// The password and access token move into the session and are no longer
    /// held by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the homeserver is not an http(s) URL.
    pub fn session(&mut self) -> Result<Session, Error> {
        let matrix = &mut self.matrix;
        let mut session = Session::new(matrix.login.as_str());
        if let Some(homeserver) = matrix.homeserver.as_deref().filter(|url| !url.is_empty()) {
            session = session.with_homeserver(homeserver)?;
        }
        if let Some(password) = matrix.password.take() {
            session = session.with_password(password);
        }
        if let Some(access_token) = matrix.access_token.take() {
            session = session.with_access_token(access_token);
        }
        if let Some(device_id) = &matrix.device_id {
            session = session.with_device_id(device_id.as_str());
        }
        Ok(session)
    }

    /// Orchestrator settings, downloads going below `data_dir`.
    pub fn api_config(&self, data_dir: &Path) -> ApiConfig {
        ApiConfig {
            resync_interval: Duration::from_secs(self.sync.resync_interval),
            initial_timeout: Duration::from_millis(self.sync.initial_timeout),
            timeout: Duration::from_millis(self.sync.timeout),
            max_connections: self.sync.max_connections,
            insecure_discovery: self.sync.insecure_discovery,
            download_dir: data_dir.to_path_buf(),
        }
    }
}
