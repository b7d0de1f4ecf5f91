//! Per-account session state owned by the orchestrator.

use std::time::Instant;

use matrix_sdk::ruma::MilliSecondsSinceUnixEpoch;
use serde_json::Value;

use crate::{
    matrix::{Error, ErrorKind, secret::Secret},
    utils::normalize_homeserver,
};

/// Credentials and sync position of one logged in account.
///
/// A `Session` is built by the embedder (from configuration or a persisted
/// store) and then handed to [`crate::matrix::MatrixApi`], which becomes its
/// only owner.
///
/// # Examples
///
/// ```
/// use mxlink::matrix::{Secret, Session};
///
/// let session = Session::new("@alice:example.org")
///     .with_password(Secret::new("secret"))
///     .with_homeserver("https://example.org:443/")
///     .unwrap();
/// assert_eq!(session.homeserver(), Some("https://example.org"));
/// ```
#[derive(Debug)]
pub struct Session {
    /// User id, email or phone number typed by the user
    login_identifier: String,
    /// Fully qualified user id returned by the server
    matrix_id: Option<String>,
    password: Option<Secret>,
    /// Normalized `scheme://host[:port]`
    homeserver: Option<String>,
    device_id: Option<String>,
    access_token: Option<Secret>,
    /// `Some("")` when the server accepted the filter without returning an id
    filter_id: Option<String>,
    /// `next_batch` of the last processed sync
    sync_cursor: Option<String>,
    event_counter: u64,
    pub(crate) homeserver_verified: bool,
    pub(crate) login_success: bool,
    pub(crate) room_list_loaded: bool,
    pub(crate) full_state_loaded: bool,
    pub(crate) sync_failed: bool,
    pub(crate) has_tried_connecting: bool,
    /// One-time keys handed out by the encryption capability, not yet accepted
    pub(crate) pending_one_time_keys: Option<Value>,
    /// Deadline of the scheduled resync, if any
    pub(crate) resync_at: Option<Instant>,
}

impl Session {
    pub fn new(login_identifier: impl Into<String>) -> Self {
        Session {
            login_identifier: login_identifier.into().trim().to_owned(),
            matrix_id: None,
            password: None,
            homeserver: None,
            device_id: None,
            access_token: None,
            filter_id: None,
            sync_cursor: None,
            event_counter: 0,
            homeserver_verified: false,
            login_success: false,
            room_list_loaded: false,
            full_state_loaded: false,
            sync_failed: false,
            has_tried_connecting: false,
            pending_one_time_keys: None,
            resync_at: None,
        }
    }

    pub fn with_password(mut self, password: Secret) -> Self {
        self.set_password(Some(password));
        self
    }

    /// Sets the homeserver, normalizing it first.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::InvalidInput`] error if the value is not an
    /// http(s) URL.
    pub fn with_homeserver(mut self, homeserver: &str) -> Result<Self, Error> {
        self.set_homeserver(homeserver)?;
        Ok(self)
    }

    /// Injects an access token from a previous login.
    pub fn with_access_token(mut self, access_token: Secret) -> Self {
        if !access_token.is_empty() {
            self.access_token = Some(access_token);
        }
        self
    }

    pub fn with_matrix_id(mut self, matrix_id: impl Into<String>) -> Self {
        self.matrix_id = Some(matrix_id.into());
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_filter_id(mut self, filter_id: impl Into<String>) -> Self {
        self.filter_id = Some(filter_id.into());
        self
    }

    /// Restores the `next_batch` of a previous run.
    pub fn with_sync_cursor(mut self, cursor: &str) -> Self {
        self.advance_cursor(cursor);
        self
    }

    pub fn login_identifier(&self) -> &str {
        &self.login_identifier
    }

    pub fn matrix_id(&self) -> Option<&str> {
        self.matrix_id.as_deref()
    }

    pub fn homeserver(&self) -> Option<&str> {
        self.homeserver.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn access_token(&self) -> Option<&Secret> {
        self.access_token.as_ref()
    }

    pub fn filter_id(&self) -> Option<&str> {
        self.filter_id.as_deref()
    }

    pub fn sync_cursor(&self) -> Option<&str> {
        self.sync_cursor.as_deref()
    }

    pub fn password(&self) -> Option<&Secret> {
        self.password.as_ref()
    }

    pub fn has_password(&self) -> bool {
        self.password.as_ref().is_some_and(|password| !password.is_empty())
    }

    pub fn is_sync_failed(&self) -> bool {
        self.sync_failed
    }

    pub fn is_full_state_loaded(&self) -> bool {
        self.full_state_loaded
    }

    pub fn is_room_list_loaded(&self) -> bool {
        self.room_list_loaded
    }

    pub fn is_homeserver_verified(&self) -> bool {
        self.homeserver_verified
    }

    pub fn is_login_success(&self) -> bool {
        self.login_success
    }

    pub fn is_resync_pending(&self) -> bool {
        self.resync_at.is_some()
    }

    /// Replaces the password; the previous one is zeroized on drop.
    pub fn set_password(&mut self, password: Option<Secret>) {
        self.password = password.filter(|password| !password.is_empty());
    }

    pub(crate) fn set_homeserver(&mut self, homeserver: &str) -> Result<(), Error> {
        let normalized = normalize_homeserver(homeserver).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("invalid homeserver url {homeserver}"),
            )
        })?;
        if self.homeserver.as_deref() != Some(normalized.as_str()) {
            self.homeserver_verified = false;
        }
        self.homeserver = Some(normalized);
        Ok(())
    }

    /// Stores the credentials returned by a successful login.
    ///
    /// `login_success` is left to the first successful sync, so the bootstrap
    /// sync still uses the short long-poll timeout.
    pub(crate) fn set_login(&mut self, matrix_id: &str, device_id: &str, access_token: Secret) {
        self.matrix_id = Some(matrix_id.to_owned());
        self.device_id = Some(device_id.to_owned());
        self.access_token = Some(access_token);
    }

    pub(crate) fn set_identity(&mut self, matrix_id: &str, device_id: Option<&str>) {
        self.matrix_id = Some(matrix_id.to_owned());
        if let Some(device_id) = device_id {
            self.device_id = Some(device_id.to_owned());
        }
    }

    pub(crate) fn set_filter_id(&mut self, filter_id: &str) {
        self.filter_id = Some(filter_id.to_owned());
    }

    pub(crate) fn clear_access_token(&mut self) {
        self.access_token = None;
    }

    /// Moves the sync cursor forward.
    ///
    /// Empty tokens are ignored so a cursor once set is never cleared.
    /// Returns `true` if the cursor changed.
    pub(crate) fn advance_cursor(&mut self, next_batch: &str) -> bool {
        if next_batch.is_empty() {
            return false;
        }
        self.full_state_loaded = true;
        if self.sync_cursor.as_deref() == Some(next_batch) {
            return false;
        }
        self.sync_cursor = Some(next_batch.to_owned());
        true
    }

    /// Returns a transaction id (`m<ms>.<counter>`) never handed out before in
    /// this session.
    pub(crate) fn next_transaction_id(&mut self) -> String {
        let counter = self.event_counter;
        self.event_counter += 1;
        format!("m{}.{}", MilliSecondsSinceUnixEpoch::now().get(), counter)
    }
}
