//! Response structures for the client-server API endpoints the orchestrator
//! reads itself.
//!
//! Façade operations hand raw JSON back to their callers; only the bootstrap
//! and sync steps deserialize into these types.

use std::{collections::HashMap, fmt};

use serde::Deserialize;
use serde_json::Value;

use crate::matrix::{Error, Secret, encryption::SIGNED_ONE_TIME_KEY_ALGORITHM};

/// Parses a response value into one of the structures below.
pub(crate) fn parse<T: for<'de> Deserialize<'de>>(value: &Value) -> Result<T, Error> {
    T::deserialize(value).map_err(|e| Error::malformed(format!("unexpected response: {e}")))
}

/// Response from `/.well-known/matrix/client`.
#[derive(Deserialize, Debug)]
pub struct WellKnownResponse {
    #[serde(rename = "m.homeserver")]
    pub homeserver: WellKnownHomeserver,
}

#[derive(Deserialize, Debug)]
pub struct WellKnownHomeserver {
    pub base_url: String,
}

/// Response from `/_matrix/client/versions`.
#[derive(Deserialize, Debug)]
pub struct VersionsResponse {
    #[serde(default)]
    pub versions: Vec<String>,
}

impl VersionsResponse {
    /// Whether the server offers a client-server API version we speak:
    /// `r0.5.0` or later, or any `v1.x`.
    pub fn is_compatible(&self) -> bool {
        self.versions.iter().any(|version| {
            if let Some(minor) = version.strip_prefix("v1.") {
                return minor.parse::<u32>().is_ok();
            }
            match version.strip_prefix("r0.") {
                Some(rest) => rest
                    .split('.')
                    .next()
                    .and_then(|minor| minor.parse::<u32>().ok())
                    .is_some_and(|minor| minor >= 5),
                None => false,
            }
        })
    }
}

/// Response from `/login`.
#[derive(Deserialize, Debug)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: Secret,
    pub device_id: String,
}

impl fmt::Display for LoginResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // access token left out on purpose
        write!(f, "user_id={}, device_id={}", self.user_id, self.device_id)
    }
}

/// Response from `/account/whoami`.
#[derive(Deserialize, Debug)]
pub struct WhoamiResponse {
    pub user_id: String,
    pub device_id: Option<String>,
}

/// Response from `/user/{userId}/filter`.
#[derive(Deserialize, Debug)]
pub struct FilterResponse {
    #[serde(default)]
    pub filter_id: String,
}

/// Response from `/keys/upload`.
#[derive(Deserialize, Debug, Default)]
pub struct KeysUploadResponse {
    #[serde(default)]
    pub one_time_key_counts: HashMap<String, u64>,
}

impl KeysUploadResponse {
    pub fn signed_count(&self) -> u64 {
        self.one_time_key_counts
            .get(SIGNED_ONE_TIME_KEY_ALGORITHM)
            .copied()
            .unwrap_or(0)
    }
}

/// The fields of a `/sync` response the orchestrator acts on.
#[derive(Deserialize, Debug)]
pub struct SyncResponse {
    #[serde(default)]
    pub next_batch: String,
    /// Absent when the server did not report counts in this batch
    pub device_one_time_keys_count: Option<HashMap<String, u64>>,
}

impl SyncResponse {
    /// Remaining signed one-time keys, if the server reported them.
    pub fn signed_count(&self) -> Option<u64> {
        self.device_one_time_keys_count
            .as_ref()
            .map(|counts| counts.get(SIGNED_ONE_TIME_KEY_ALGORITHM).copied().unwrap_or(0))
    }
}
