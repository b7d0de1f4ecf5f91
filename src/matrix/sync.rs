//! Bootstrap state machine and the standing sync loop.
//!
//! This module provides the [`SyncDriver`] run by the sync task of a
//! [`crate::matrix::MatrixApi`].
//!
//! # Overview
//!
//! The driver walks the bootstrap states one at a time:
//!
//! `Init → ResolveHomeserver → VerifyHomeserver → Login → UploadKeys →
//! UploadFilter → JoinedRooms → Syncing`
//!
//! and then stays in `Syncing`, issuing the next long-poll only once the
//! previous response has been processed. Every failure goes through a single
//! recovery funnel which either moves to another state (re-login), pauses the
//! task until the network comes back, waits out a rate limit, or reports the
//! error and stops.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use reqwest::Method;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::{
    matrix::{
        Action, Error, ErrorClass, ErrorKind, Secret, Session,
        api::ApiInner,
        response_structs::{
            FilterResponse, KeysUploadResponse, LoginResponse, SyncResponse, VersionsResponse,
            WellKnownResponse, WhoamiResponse, parse,
        },
    },
    transport::{Priority, Request, zeroize_strings},
    utils::normalize_homeserver,
};

/// Filter uploaded once per account.
const FILTER: &str = include_str!("../../assets/filter.json");
/// Wait applied when a rate limit comes without a hint.
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);
/// Client-side slack on top of the server long-poll timeout.
const SYNC_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);
/// Upper bound on consecutive one-time key uploads.
const MAX_KEY_UPLOADS: usize = 8;
const DEVICE_DISPLAY_NAME: &str = "mxlink";

/// Step of the session bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Init,
    ResolveHomeserver,
    VerifyHomeserver,
    Login,
    UploadKeys,
    UploadFilter,
    JoinedRooms,
    Syncing,
}

impl SyncState {
    /// Action failures of this state are reported with.
    pub fn action(self) -> Action {
        match self {
            SyncState::Init | SyncState::ResolveHomeserver => Action::ResolveHomeserver,
            SyncState::VerifyHomeserver => Action::VerifyHomeserver,
            SyncState::Login => Action::Login,
            SyncState::UploadKeys => Action::UploadKeys,
            SyncState::UploadFilter => Action::UploadFilter,
            SyncState::JoinedRooms => Action::JoinedRooms,
            SyncState::Syncing => Action::Sync,
        }
    }
}

/// Why [`SyncDriver::run`] returned.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    /// Cancelled, or an unrecoverable error was reported
    Stopped,
    /// Network trouble; resume the given state after the resync wait
    Paused(SyncState),
    /// Resume the given state after the delay
    RateLimited(Duration, SyncState),
}

/// Builds the `/sync` long-poll for the current session state.
///
/// `full_state=true` is only sent until a first cursor has been received.
pub(crate) fn sync_request(session: &Session, initial_timeout: Duration, timeout: Duration) -> Request {
    let poll = if session.is_login_success() {
        timeout
    } else {
        initial_timeout
    };

    let mut request = Request::get(&["sync"])
        .priority(Priority::High)
        .timeout(poll + SYNC_TIMEOUT_MARGIN)
        .query("timeout", poll.as_millis().to_string());
    if let Some(filter_id) = session.filter_id().filter(|id| !id.is_empty()) {
        request = request.query("filter", filter_id);
    }
    if let Some(since) = session.sync_cursor() {
        request = request.query("since", since);
    }
    if !session.is_full_state_loaded() {
        request = request.query("full_state", "true");
    }
    request
}

/// Server name of a `@user:server` identifier.
fn server_name(login_identifier: &str) -> Option<&str> {
    let (_, server) = login_identifier.strip_prefix('@')?.split_once(':')?;
    Some(server).filter(|server| !server.is_empty())
}

/// `identifier` object of a password login.
///
/// `+` starts a phone number, an `@` anywhere but first an email address.
fn login_identifier(login: &str) -> Value {
    if let Some(phone) = login.strip_prefix('+') {
        json!({"type": "m.id.thirdparty", "medium": "msisdn", "address": phone})
    } else if login.contains('@') && !login.starts_with('@') {
        json!({"type": "m.id.thirdparty", "medium": "email", "address": login})
    } else {
        json!({"type": "m.id.user", "user": login})
    }
}

fn login_body(session: &Session) -> Result<Value, Error> {
    let password = session
        .password()
        .ok_or_else(|| Error::new(ErrorKind::EmptyPassword, "a password is required to login"))?;
    let mut body = json!({
        "type": "m.login.password",
        "identifier": login_identifier(session.login_identifier()),
        "password": password.expose(),
        "initial_device_display_name": DEVICE_DISPLAY_NAME,
    });
    if let Some(device_id) = session.device_id() {
        body["device_id"] = json!(device_id);
    }
    Ok(body)
}

/// Removes and wipes the access token of a login response, which is then safe
/// to hand to the session handler.
fn strip_access_token(response: &mut Value) {
    if let Some(mut token) = response
        .as_object_mut()
        .and_then(|fields| fields.remove("access_token"))
    {
        zeroize_strings(&mut token);
    }
}

/// Drives one session from bootstrap to the standing sync loop.
pub(crate) struct SyncDriver {
    inner: Arc<ApiInner>,
    cancel: CancellationToken,
    /// Set by a re-login, cleared by the next successful sync
    relogin_attempted: bool,
}

impl SyncDriver {
    pub(crate) fn new(inner: Arc<ApiInner>, cancel: CancellationToken) -> Self {
        SyncDriver {
            inner,
            cancel,
            relogin_attempted: false,
        }
    }

    /// Driver taking over after a re-login started outside of it.
    pub(crate) fn after_relogin(mut self) -> Self {
        self.relogin_attempted = true;
        self
    }

    /// Runs from `state` until the session is stopped or fails for good.
    pub(crate) async fn drive(mut self, mut state: SyncState) {
        loop {
            state = match self.run(state).await {
                Exit::Stopped => break,
                Exit::Paused(resume) => {
                    if !self.wait_for_resync().await {
                        break;
                    }
                    info!("resume sync");
                    resume
                }
                Exit::RateLimited(delay, resume) => {
                    debug!("rate limited, wait {:?}", delay);
                    let waited = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => false,
                        _ = sleep(delay) => true,
                    };
                    if !waited {
                        break;
                    }
                    resume
                }
            };
        }
        debug!("sync task stopped");
    }

    async fn run(&mut self, mut state: SyncState) -> Exit {
        loop {
            if self.cancel.is_cancelled() {
                return Exit::Stopped;
            }
            trace!("enter {:?}", state);
            let inner = Arc::clone(&self.inner);
            let result = tokio::select! {
                result = self.step(state) => result,
                _ = inner.sync_interrupt.notified() => {
                    debug!("{:?} interrupted, sync paused", state);
                    return Exit::Paused(state);
                }
            };
            state = match result {
                Ok(next) => next,
                Err(error) => match self.recover(state, error).await {
                    Ok(next) => next,
                    Err(exit) => return exit,
                },
            };
        }
    }

    /// Waits for the scheduled resync, or for the network to come back.
    ///
    /// Another pause meanwhile replaces the timer.
    /// Returns `false` if the session was cancelled meanwhile.
    async fn wait_for_resync(&self) -> bool {
        let mut deadline = Instant::now() + self.inner.config.resync_interval;
        let resumed = loop {
            // Registered before the flag is read so no change is missed
            let changed = self.inner.network_changed.notified();
            let interrupted = self.inner.sync_interrupt.notified();
            let available = self.inner.network_available.load(Ordering::SeqCst);
            self.inner.session.lock().await.resync_at = available.then(|| deadline.into_std());
            if available {
                debug!("resync in {:?}", self.inner.config.resync_interval);
            } else {
                debug!("network unavailable, wait for it");
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break false,
                _ = changed => {
                    if self.inner.network_available.load(Ordering::SeqCst) {
                        break true;
                    }
                }
                _ = interrupted => {
                    debug!("paused again, reset resync timer");
                    deadline = Instant::now() + self.inner.config.resync_interval;
                }
                _ = sleep_until(deadline), if available => break true,
            }
        };
        self.inner.session.lock().await.resync_at = None;
        resumed
    }

    fn report(&self, action: Action, response: Option<&Value>, error: Option<&Error>) {
        self.inner.report(action, response, error);
    }

    async fn send(&self, request: Request) -> Result<Value, Error> {
        self.inner.net.send(request, &self.cancel).await
    }

    async fn step(&mut self, state: SyncState) -> Result<SyncState, Error> {
        match state {
            SyncState::Init => self.init().await,
            SyncState::ResolveHomeserver => self.resolve_homeserver().await,
            SyncState::VerifyHomeserver => self.verify_homeserver().await,
            SyncState::Login => self.login().await,
            SyncState::UploadKeys => self.upload_keys().await,
            SyncState::UploadFilter => self.upload_filter().await,
            SyncState::JoinedRooms => self.joined_rooms().await,
            SyncState::Syncing => self.sync().await,
        }
    }

    async fn init(&self) -> Result<SyncState, Error> {
        let homeserver = {
            let mut session = self.inner.session.lock().await;
            session.has_tried_connecting = true;
            session.homeserver().map(ToOwned::to_owned)
        };
        match homeserver {
            Some(homeserver) => {
                self.inner.net.set_homeserver(&homeserver).await?;
                Ok(SyncState::VerifyHomeserver)
            }
            None => Ok(SyncState::ResolveHomeserver),
        }
    }

    async fn resolve_homeserver(&self) -> Result<SyncState, Error> {
        let login = self.inner.session.lock().await.login_identifier().to_owned();
        let server_name = server_name(&login).ok_or_else(|| {
            Error::new(
                ErrorKind::NoHomeserver,
                format!("no homeserver given and none can be derived from {login}"),
            )
        })?;
        info!("discover homeserver of {}", server_name);

        let no_homeserver = |reason: String| {
            Error::new(
                ErrorKind::NoHomeserver,
                format!("discovery failed for {server_name}: {reason}"),
            )
        };
        let response = self
            .inner
            .net
            .discover(server_name, self.inner.config.insecure_discovery, &self.cancel)
            .await
            .map_err(|e| {
                if e.kind() == &ErrorKind::Cancelled {
                    e
                } else {
                    no_homeserver(e.to_string())
                }
            })?;
        let well_known: WellKnownResponse =
            parse(&response).map_err(|e| no_homeserver(e.to_string()))?;
        let homeserver = normalize_homeserver(&well_known.homeserver.base_url)
            .ok_or_else(|| no_homeserver(format!("invalid base url {}", well_known.homeserver.base_url)))?;

        info!("homeserver of {} is {}", server_name, homeserver);
        self.inner.session.lock().await.set_homeserver(&homeserver)?;
        self.inner.net.set_homeserver(&homeserver).await?;
        self.report(Action::ResolveHomeserver, Some(&response), None);
        Ok(SyncState::VerifyHomeserver)
    }

    async fn verify_homeserver(&self) -> Result<SyncState, Error> {
        let response = self
            .send(Request::new(Method::GET, &["_matrix", "client", "versions"]))
            .await?;
        let versions: VersionsResponse = parse(&response)?;
        if !versions.is_compatible() {
            return Err(Error::new(
                ErrorKind::IncompatibleHomeserver,
                format!("unsupported versions {:?}", versions.versions),
            ));
        }

        let (access_token, needs_whoami) = {
            let mut session = self.inner.session.lock().await;
            session.homeserver_verified = true;
            (
                session.access_token().map(|token| Secret::new(token.expose())),
                session.matrix_id().is_none(),
            )
        };
        debug!("homeserver verified");
        self.report(Action::VerifyHomeserver, Some(&response), None);

        let Some(access_token) = access_token else {
            if !self.inner.session.lock().await.has_password() {
                return Err(Error::new(
                    ErrorKind::EmptyPassword,
                    "a password is required to login",
                ));
            }
            return Ok(SyncState::Login);
        };

        self.inner.net.set_access_token(Some(access_token)).await;
        if needs_whoami {
            let response = self.send(Request::get(&["account", "whoami"])).await?;
            let whoami: WhoamiResponse = parse(&response)?;
            debug!("restored session of {}", whoami.user_id);
            self.inner
                .session
                .lock()
                .await
                .set_identity(&whoami.user_id, whoami.device_id.as_deref());
        }
        self.bind_encryption().await;
        Ok(SyncState::UploadKeys)
    }

    async fn login(&self) -> Result<SyncState, Error> {
        let body = login_body(&*self.inner.session.lock().await)?;
        info!("login as {}", self.inner.session.lock().await.login_identifier());

        let mut response = self
            .send(Request::post(&["login"], body).sensitive())
            .await?;
        let login: LoginResponse = parse(&response)?;
        debug!("logged in: {}", login);
        strip_access_token(&mut response);

        self.inner
            .net
            .set_access_token(Some(Secret::new(login.access_token.expose())))
            .await;
        self.inner
            .session
            .lock()
            .await
            .set_login(&login.user_id, &login.device_id, login.access_token);
        self.bind_encryption().await;
        self.report(Action::Login, Some(&response), None);
        Ok(SyncState::UploadKeys)
    }

    /// Binds the encryption capability to the logged in user and device.
    async fn bind_encryption(&self) {
        let identity = {
            let session = self.inner.session.lock().await;
            session
                .matrix_id()
                .zip(session.device_id())
                .map(|(user_id, device_id)| (user_id.to_owned(), device_id.to_owned()))
        };
        let Some((user_id, device_id)) = identity else {
            warn!("no device known, encryption left unbound");
            return;
        };
        if let Some(encryption) = self.inner.encryption.lock().await.as_mut() {
            encryption.set_session_identity(&user_id, &device_id);
        }
    }

    async fn upload_keys(&self) -> Result<SyncState, Error> {
        let device_keys = {
            let encryption = self.inner.encryption.lock().await;
            encryption
                .as_ref()
                .map(|encryption| encryption.get_device_keys_payload())
        };
        let Some(device_keys) = device_keys else {
            trace!("no encryption, skip key upload");
            return Ok(SyncState::UploadFilter);
        };

        let response = self
            .send(Request::post(
                &["keys", "upload"],
                json!({"device_keys": device_keys}),
            ))
            .await?;
        let upload: KeysUploadResponse = parse(&response)?;
        self.report(Action::UploadKeys, Some(&response), None);
        self.replenish_keys(upload.signed_count()).await?;
        Ok(SyncState::UploadFilter)
    }

    /// Tops the published one-time keys up to half the account capacity.
    ///
    /// # Arguments
    ///
    /// * `count` - Signed one-time keys the server still holds
    async fn replenish_keys(&self, mut count: u64) -> Result<(), Error> {
        for _ in 0..MAX_KEY_UPLOADS {
            let payload = {
                let mut encryption = self.inner.encryption.lock().await;
                let Some(encryption) = encryption.as_mut() else {
                    return Ok(());
                };
                let limit = (encryption.max_one_time_keys() / 2) as u64;
                if count >= limit {
                    return Ok(());
                }
                let missing = (limit - count) as usize;
                debug!("{} one-time keys left, create {}", count, missing);
                encryption.create_one_time_keys(missing);
                encryption.get_one_time_keys_payload()
            };

            self.inner.session.lock().await.pending_one_time_keys = Some(payload.clone());
            let response = self
                .send(Request::post(
                    &["keys", "upload"],
                    json!({"one_time_keys": payload}),
                ))
                .await?;
            let upload: KeysUploadResponse = parse(&response)?;

            self.inner.session.lock().await.pending_one_time_keys = None;
            if let Some(encryption) = self.inner.encryption.lock().await.as_mut() {
                encryption.mark_keys_as_published();
            }
            count = upload.signed_count();
        }
        warn!("one-time key count still at {} after {} uploads", count, MAX_KEY_UPLOADS);
        Ok(())
    }

    async fn upload_filter(&self) -> Result<SyncState, Error> {
        let user_id = {
            let session = self.inner.session.lock().await;
            if session.filter_id().is_some() {
                return Ok(SyncState::JoinedRooms);
            }
            session
                .matrix_id()
                .map(ToOwned::to_owned)
                .ok_or_else(|| Error::invalid_input("user id unknown, cannot upload filter"))?
        };

        let filter: Value = serde_json::from_str(FILTER)?;
        let response = self
            .send(Request::post(&["user", &user_id, "filter"], filter))
            .await?;
        let filter: FilterResponse = parse(&response)?;
        if filter.filter_id.is_empty() {
            warn!("server returned no filter id, sync unfiltered");
        }
        self.inner.session.lock().await.set_filter_id(&filter.filter_id);
        self.report(Action::UploadFilter, Some(&response), None);
        Ok(SyncState::JoinedRooms)
    }

    async fn joined_rooms(&self) -> Result<SyncState, Error> {
        if self.inner.session.lock().await.is_room_list_loaded() {
            return Ok(SyncState::Syncing);
        }
        let response = self.send(Request::get(&["joined_rooms"])).await?;
        self.inner.session.lock().await.room_list_loaded = true;
        self.report(Action::JoinedRooms, Some(&response), None);
        Ok(SyncState::Syncing)
    }

    async fn sync(&mut self) -> Result<SyncState, Error> {
        let request = {
            let session = self.inner.session.lock().await;
            sync_request(
                &session,
                self.inner.config.initial_timeout,
                self.inner.config.timeout,
            )
        };
        trace!("sync since {:?}", request.query_value("since"));

        let response = self.send(request).await?;
        let sync: SyncResponse = parse(&response)?;
        {
            let mut session = self.inner.session.lock().await;
            if session.sync_failed {
                info!("sync recovered");
            }
            session.advance_cursor(&sync.next_batch);
            session.sync_failed = false;
            session.login_success = true;
        }
        self.relogin_attempted = false;
        self.report(Action::Sync, Some(&response), None);

        if let Some(count) = sync.signed_count() {
            self.replenish_keys(count).await?;
        }
        Ok(SyncState::Syncing)
    }

    /// Recovery funnel, applied to every failure of every state.
    ///
    /// Returns the state to continue with, or why the driver has to stop
    /// or wait.
    async fn recover(&mut self, state: SyncState, error: Error) -> Result<SyncState, Exit> {
        if self.cancel.is_cancelled() || error.kind() == &ErrorKind::Cancelled {
            debug!("{:?} cancelled", state);
            return Err(Exit::Stopped);
        }
        let action = state.action();

        match error.class() {
            ErrorClass::Reauthenticate => {
                let can_relogin =
                    !self.relogin_attempted && self.inner.session.lock().await.has_password();
                if !can_relogin {
                    error!("{:?} failed, cannot login again: {}", action, error);
                    self.report(action, None, Some(&error));
                    return Err(Exit::Stopped);
                }

                warn!("access token rejected, login again");
                self.relogin_attempted = true;
                self.inner.forget_access_token().await;
                self.report(Action::Relogin, None, None);
                Ok(SyncState::Login)
            }
            ErrorClass::TransientNetwork => {
                warn!("{:?} failed, sync paused: {}", action, error);
                self.inner.pause_sync().await;
                Err(Exit::Paused(state))
            }
            ErrorClass::RateLimited => {
                let delay = error.retry_after().unwrap_or(DEFAULT_RATE_LIMIT_DELAY);
                warn!("{:?} rate limited, retry in {:?}", action, delay);
                self.report(action, None, Some(&error));
                Err(Exit::RateLimited(delay, state))
            }
            ErrorClass::Fatal | ErrorClass::RequestSpecific => {
                if state == SyncState::Login && error.kind() == &ErrorKind::Forbidden {
                    // Wrong password, a new one has to be supplied
                    self.inner.session.lock().await.set_password(None);
                }
                error!("{:?} failed: {}", action, error);
                self.report(action, None, Some(&error));
                Err(Exit::Stopped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{
        ApiConfig, MatrixApi, MockEncryption,
        api::tests::{Events, channel_handler},
    };
    use mockall::predicate::eq;
    use mockito::{Matcher, Mock, ServerGuard};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    fn test_config() -> ApiConfig {
        ApiConfig {
            resync_interval: Duration::from_millis(100),
            initial_timeout: Duration::from_millis(0),
            timeout: Duration::from_millis(0),
            insecure_discovery: true,
            ..ApiConfig::default()
        }
    }

    async fn next_event(events: &mut Events) -> (Action, Option<Value>, Option<ErrorKind>) {
        timeout(WAIT, events.recv())
            .await
            .expect("no event in time")
            .expect("handler dropped")
    }

    /// Polls the session until `check` holds.
    async fn wait_for_session(api: &MatrixApi, check: impl Fn(&Session) -> bool) {
        timeout(WAIT, async {
            while !api.with_session(&check).await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session state not reached in time");
    }

    async fn mock_versions(server: &mut ServerGuard) -> Mock {
        server
            .mock("GET", "/_matrix/client/versions")
            .with_status(200)
            .with_body(r#"{"versions": ["r0.6.1", "v1.1"]}"#)
            .create_async()
            .await
    }

    async fn mock_joined_rooms(server: &mut ServerGuard) -> Mock {
        server
            .mock("GET", "/_matrix/client/v3/joined_rooms")
            .with_status(200)
            .with_body(r#"{"joined_rooms": ["!room:example.org"]}"#)
            .create_async()
            .await
    }

    /// Session restored from a token, with filter and room list known.
    fn restored_session(server: &ServerGuard, cursor: Option<&str>) -> Session {
        let mut session = Session::new("@alice:example.org")
            .with_password(Secret::new("secret"))
            .with_homeserver(&server.url())
            .unwrap()
            .with_matrix_id("@alice:example.org")
            .with_device_id("DEVICE")
            .with_access_token(Secret::new("old-token"))
            .with_filter_id("f1");
        if let Some(cursor) = cursor {
            session = session.with_sync_cursor(cursor);
        }
        session
    }

    #[test]
    fn test_sync_request_first_call() {
        let session = Session::new("@alice:example.org");
        let request = sync_request(
            &session,
            Duration::from_millis(10_000),
            Duration::from_millis(30_000),
        );
        assert_eq!(request.path(), "/_matrix/client/v3/sync");
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.query_value("full_state"), Some("true"));
        assert_eq!(request.query_value("since"), None);
        assert_eq!(request.query_value("filter"), None);
        assert_eq!(request.query_value("timeout"), Some("10000"));
    }

    #[test]
    fn test_sync_request_after_first_batch() {
        let mut session = Session::new("@alice:example.org").with_filter_id("f1");
        session.advance_cursor("s1");
        session.login_success = true;

        let request = sync_request(
            &session,
            Duration::from_millis(10_000),
            Duration::from_millis(30_000),
        );
        assert_eq!(request.query_value("full_state"), None);
        assert_eq!(request.query_value("since"), Some("s1"));
        assert_eq!(request.query_value("filter"), Some("f1"));
        assert_eq!(request.query_value("timeout"), Some("30000"));
        assert_eq!(request.timeout, Some(Duration::from_secs(40)));
    }

    #[test]
    fn test_sync_request_after_login_keeps_initial_timeout() {
        let mut session = Session::new("@alice:example.org");
        session.set_login("@alice:example.org", "DEVICE", Secret::new("token"));

        let request = sync_request(
            &session,
            Duration::from_millis(10_000),
            Duration::from_millis(30_000),
        );
        assert_eq!(request.query_value("timeout"), Some("10000"));
    }

    #[test]
    fn test_empty_filter_id_is_not_sent() {
        let session = Session::new("@alice:example.org").with_filter_id("");
        let request = sync_request(&session, Duration::ZERO, Duration::ZERO);
        assert_eq!(request.query_value("filter"), None);
    }

    #[test]
    fn test_login_identifier_types() {
        assert_eq!(
            login_identifier("@alice:example.org"),
            json!({"type": "m.id.user", "user": "@alice:example.org"})
        );
        assert_eq!(
            login_identifier("alice"),
            json!({"type": "m.id.user", "user": "alice"})
        );
        assert_eq!(
            login_identifier("alice@example.org"),
            json!({"type": "m.id.thirdparty", "medium": "email", "address": "alice@example.org"})
        );
        assert_eq!(
            login_identifier("+33612345678"),
            json!({"type": "m.id.thirdparty", "medium": "msisdn", "address": "33612345678"})
        );
    }

    #[test]
    fn test_server_name() {
        assert_eq!(server_name("@alice:example.org"), Some("example.org"));
        assert_eq!(server_name("@alice:localhost:8008"), Some("localhost:8008"));
        assert_eq!(server_name("alice"), None);
        assert_eq!(server_name("alice@example.org"), None);
        assert_eq!(server_name("@alice:"), None);
    }

    #[test]
    fn test_login_body_keeps_device() {
        let session = Session::new("alice")
            .with_password(Secret::new("secret"))
            .with_device_id("DEVICE");
        let body = login_body(&session).unwrap();
        assert_eq!(body["password"], "secret");
        assert_eq!(body["device_id"], "DEVICE");
        assert_eq!(body["initial_device_display_name"], DEVICE_DISPLAY_NAME);

        let error = login_body(&Session::new("alice")).unwrap_err();
        assert_eq!(error.kind(), &ErrorKind::EmptyPassword);
    }

    #[test]
    fn test_strip_access_token_keeps_other_fields() {
        let mut response = json!({
            "user_id": "@alice:example.org",
            "access_token": "new-token",
            "device_id": "DEVICE",
        });
        strip_access_token(&mut response);
        assert_eq!(
            response,
            json!({"user_id": "@alice:example.org", "device_id": "DEVICE"})
        );

        let mut not_an_object = json!("new-token");
        strip_access_token(&mut not_an_object);
        assert_eq!(not_an_object, "new-token");
    }

    #[tokio::test]
    async fn test_full_bootstrap_in_order() {
        let mut server = mockito::Server::new_async().await;
        let host = server.host_with_port();
        let base_url = server.url();
        server
            .mock("GET", "/.well-known/matrix/client")
            .with_status(200)
            .with_body(json!({"m.homeserver": {"base_url": base_url}}).to_string())
            .create_async()
            .await;
        mock_versions(&mut server).await;
        let login = server
            .mock("POST", "/_matrix/client/v3/login")
            .match_body(Matcher::PartialJson(json!({
                "type": "m.login.password",
                "identifier": {"type": "m.id.user", "user": format!("@alice:{host}")},
                "password": "secret"
            })))
            .with_status(200)
            .with_body(
                json!({
                    "user_id": format!("@alice:{host}"),
                    "access_token": "new-token",
                    "device_id": "DEVICE"
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let filter = server
            .mock(
                "POST",
                format!("/_matrix/client/v3/user/@alice:{host}/filter").as_str(),
            )
            .match_header("authorization", "Bearer new-token")
            .with_status(200)
            .with_body(r#"{"filter_id": "f1"}"#)
            .create_async()
            .await;
        mock_joined_rooms(&mut server).await;
        let first_sync = server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("full_state".to_owned(), "true".to_owned()),
                Matcher::UrlEncoded("filter".to_owned(), "f1".to_owned()),
                Matcher::UrlEncoded("timeout".to_owned(), "0".to_owned()),
            ]))
            .with_status(200)
            .with_body(r#"{"next_batch": "s1"}"#)
            .expect(1)
            .create_async()
            .await;
        let next_sync = server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("since".to_owned(), "s1".to_owned()),
                Matcher::UrlEncoded("timeout".to_owned(), "1".to_owned()),
            ]))
            .with_status(200)
            .with_body(r#"{"next_batch": "s1"}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let session = Session::new(format!("@alice:{host}")).with_password(Secret::new("secret"));
        let (handler, mut events) = channel_handler();
        let config = ApiConfig {
            timeout: Duration::from_millis(1),
            ..test_config()
        };
        let api = MatrixApi::new(session, None, handler, config)
            .await
            .unwrap();
        api.start_sync().await;

        let mut actions = Vec::new();
        for _ in 0..7 {
            let (action, response, error) = next_event(&mut events).await;
            assert!(error.is_none(), "{action:?} failed with {error:?}");
            let response = response.unwrap();
            if action == Action::Login {
                assert_eq!(response["device_id"], "DEVICE");
                assert!(response.get("access_token").is_none());
            }
            actions.push(action);
        }
        api.stop_sync().await;

        assert_eq!(
            actions,
            vec![
                Action::ResolveHomeserver,
                Action::VerifyHomeserver,
                Action::Login,
                Action::UploadFilter,
                Action::JoinedRooms,
                Action::Sync,
                Action::Sync,
            ]
        );
        login.assert_async().await;
        filter.assert_async().await;
        first_sync.assert_async().await;
        next_sync.assert_async().await;

        api.with_session(|session| {
            assert_eq!(session.homeserver(), normalize_homeserver(&base_url).as_deref());
            assert_eq!(session.matrix_id(), Some(format!("@alice:{host}").as_str()));
            assert_eq!(session.access_token().unwrap().expose(), "new-token");
            assert_eq!(session.filter_id(), Some("f1"));
            assert_eq!(session.sync_cursor(), Some("s1"));
            assert!(session.is_room_list_loaded());
            assert!(session.is_login_success());
        })
        .await;
    }

    #[tokio::test]
    async fn test_failed_discovery_is_fatal_once() {
        let mut server = mockito::Server::new_async().await;
        let well_known = server
            .mock("GET", "/.well-known/matrix/client")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let session = Session::new(format!("@alice:{}", server.host_with_port()))
            .with_password(Secret::new("secret"));
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        let (action, response, error) = next_event(&mut events).await;
        assert_eq!(action, Action::ResolveHomeserver);
        assert!(response.is_none());
        assert_eq!(error, Some(ErrorKind::NoHomeserver));

        // Several resync intervals: nothing else may happen
        sleep(Duration::from_millis(400)).await;
        assert!(events.try_recv().is_err());
        assert!(!api.is_syncing().await);
        assert!(!api.with_session(Session::is_resync_pending).await);
        well_known.assert_async().await;
    }

    #[tokio::test]
    async fn test_identifier_without_server_is_fatal() {
        let (handler, mut events) = channel_handler();
        let session = Session::new("alice").with_password(Secret::new("secret"));
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        let (action, _, error) = next_event(&mut events).await;
        assert_eq!(action, Action::ResolveHomeserver);
        assert_eq!(error, Some(ErrorKind::NoHomeserver));
    }

    #[tokio::test]
    async fn test_missing_password_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;

        let session = Session::new("@alice:example.org")
            .with_homeserver(&server.url())
            .unwrap();
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        let (action, _, error) = next_event(&mut events).await;
        assert_eq!(action, Action::VerifyHomeserver);
        assert_eq!(error, Some(ErrorKind::EmptyPassword));
    }

    #[tokio::test]
    async fn test_incompatible_homeserver() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/_matrix/client/versions")
            .with_status(200)
            .with_body(r#"{"versions": ["r0.0.1"]}"#)
            .create_async()
            .await;

        let session = restored_session(&server, None);
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        let (action, _, error) = next_event(&mut events).await;
        assert_eq!(action, Action::VerifyHomeserver);
        assert_eq!(error, Some(ErrorKind::IncompatibleHomeserver));
    }

    #[tokio::test]
    async fn test_wrong_password_clears_it() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        server
            .mock("POST", "/_matrix/client/v3/login")
            .with_status(403)
            .with_body(r#"{"errcode": "M_FORBIDDEN", "error": "Invalid password"}"#)
            .expect(1)
            .create_async()
            .await;

        let session = Session::new("@alice:example.org")
            .with_password(Secret::new("wrong"))
            .with_homeserver(&server.url())
            .unwrap();
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        let (action, _, error) = next_event(&mut events).await;
        assert_eq!(action, Action::Login);
        assert_eq!(error, Some(ErrorKind::Forbidden));
        assert!(!api.with_session(Session::has_password).await);
    }

    #[tokio::test]
    async fn test_whoami_fills_identity_of_injected_token() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        let whoami = server
            .mock("GET", "/_matrix/client/v3/account/whoami")
            .match_header("authorization", "Bearer injected")
            .with_status(200)
            .with_body(r#"{"user_id": "@alice:example.org", "device_id": "DEVICE"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/_matrix/client/v3/user/@alice:example.org/filter")
            .with_status(200)
            .with_body(r#"{"filter_id": "f9"}"#)
            .create_async()
            .await;
        mock_joined_rooms(&mut server).await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"next_batch": "s1"}"#)
            .create_async()
            .await;

        let session = Session::new("@alice:example.org")
            .with_homeserver(&server.url())
            .unwrap()
            .with_access_token(Secret::new("injected"));
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        assert_eq!(next_event(&mut events).await.0, Action::UploadFilter);
        assert_eq!(next_event(&mut events).await.0, Action::JoinedRooms);
        assert_eq!(next_event(&mut events).await.0, Action::Sync);
        api.stop_sync().await;

        whoami.assert_async().await;
        api.with_session(|session| {
            assert_eq!(session.matrix_id(), Some("@alice:example.org"));
            assert_eq!(session.device_id(), Some("DEVICE"));
            assert_eq!(session.filter_id(), Some("f9"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_unknown_token_triggers_single_relogin() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        let rejected = server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_header("authorization", "Bearer old-token")
            .match_query(Matcher::UrlEncoded("since".to_owned(), "s5".to_owned()))
            .with_status(401)
            .with_body(r#"{"errcode": "M_UNKNOWN_TOKEN", "error": "Token expired"}"#)
            .expect(1)
            .create_async()
            .await;
        let login = server
            .mock("POST", "/_matrix/client/v3/login")
            .match_body(Matcher::PartialJson(json!({"device_id": "DEVICE"})))
            .with_status(200)
            .with_body(
                r#"{"user_id": "@alice:example.org", "access_token": "new-token", "device_id": "DEVICE"}"#,
            )
            .expect(1)
            .create_async()
            .await;
        let resumed = server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_header("authorization", "Bearer new-token")
            .match_query(Matcher::UrlEncoded("since".to_owned(), "s5".to_owned()))
            .with_status(200)
            .with_body(r#"{"next_batch": "s6"}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_header("authorization", "Bearer new-token")
            .match_query(Matcher::UrlEncoded("since".to_owned(), "s6".to_owned()))
            .with_status(200)
            .with_body(r#"{"next_batch": "s6"}"#)
            .create_async()
            .await;
        let joined_rooms = mock_joined_rooms(&mut server).await;

        let mut encryption = MockEncryption::new();
        encryption
            .expect_get_device_keys_payload()
            .returning(|| json!({"device_id": "DEVICE"}));
        encryption.expect_max_one_time_keys().return_const(50usize);
        encryption.expect_set_session_identity().times(2).return_const(());
        encryption.expect_clear_session_identity().times(1).return_const(());
        server
            .mock("POST", "/_matrix/client/v3/keys/upload")
            .with_status(200)
            .with_body(r#"{"one_time_key_counts": {"signed_curve25519": 25}}"#)
            .create_async()
            .await;

        let session = restored_session(&server, Some("s5"));
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, Some(Box::new(encryption)), handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        let mut actions = Vec::new();
        loop {
            let (action, _, error) = next_event(&mut events).await;
            assert!(error.is_none(), "{action:?} failed with {error:?}");
            actions.push(action);
            if action == Action::Sync {
                break;
            }
        }
        api.stop_sync().await;

        assert_eq!(
            actions,
            vec![
                Action::VerifyHomeserver,
                Action::UploadKeys,
                Action::JoinedRooms,
                Action::Relogin,
                Action::Login,
                Action::UploadKeys,
                Action::Sync,
            ]
        );
        rejected.assert_async().await;
        login.assert_async().await;
        resumed.assert_async().await;
        joined_rooms.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_token_without_password_is_reported() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        mock_joined_rooms(&mut server).await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"errcode": "M_UNKNOWN_TOKEN", "error": "Token expired"}"#)
            .create_async()
            .await;
        let login = server
            .mock("POST", "/_matrix/client/v3/login")
            .expect(0)
            .create_async()
            .await;

        let session = Session::new("@alice:example.org")
            .with_homeserver(&server.url())
            .unwrap()
            .with_matrix_id("@alice:example.org")
            .with_access_token(Secret::new("old-token"))
            .with_filter_id("f1");
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        assert_eq!(next_event(&mut events).await.0, Action::JoinedRooms);
        let (action, _, error) = next_event(&mut events).await;
        assert_eq!(action, Action::Sync);
        assert_eq!(error, Some(ErrorKind::UnknownToken));
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_failure_pauses_and_resumes_same_cursor() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        mock_joined_rooms(&mut server).await;
        // Not JSON: parsed as a transient failure
        let broken = server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::UrlEncoded("since".to_owned(), "s5".to_owned()))
            .with_status(200)
            .with_body("<html>gateway</html>")
            .expect(1)
            .create_async()
            .await;

        let session = restored_session(&server, Some("s5"));
        let (handler, mut events) = channel_handler();
        let config = ApiConfig {
            resync_interval: Duration::from_millis(500),
            ..test_config()
        };
        let api = MatrixApi::new(session, None, handler, config)
            .await
            .unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        assert_eq!(next_event(&mut events).await.0, Action::JoinedRooms);
        let (action, response, error) = next_event(&mut events).await;
        assert_eq!(action, Action::SyncPaused);
        assert!(response.is_none());
        assert!(error.is_none());
        assert!(api.with_session(Session::is_sync_failed).await);
        broken.assert_async().await;

        // The first matching mock still missing hits answers
        let repaired = server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::UrlEncoded("since".to_owned(), "s5".to_owned()))
            .with_status(200)
            .with_body(r#"{"next_batch": "s6"}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::UrlEncoded("since".to_owned(), "s6".to_owned()))
            .with_status(200)
            .with_body(r#"{"next_batch": "s6"}"#)
            .create_async()
            .await;

        let (action, _, error) = next_event(&mut events).await;
        assert_eq!(action, Action::Sync);
        assert!(error.is_none());
        api.stop_sync().await;

        repaired.assert_async().await;
        api.with_session(|session| {
            assert!(!session.is_sync_failed());
            assert_eq!(session.sync_cursor(), Some("s6"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_offline_pause_waits_for_network() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        mock_joined_rooms(&mut server).await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let session = restored_session(&server, Some("s5"));
        let (handler, mut events) = channel_handler();
        let config = ApiConfig {
            resync_interval: Duration::from_secs(2),
            ..test_config()
        };
        let api = MatrixApi::new(session, None, handler, config).await.unwrap();
        api.set_network_available(false);
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        assert_eq!(next_event(&mut events).await.0, Action::JoinedRooms);
        assert_eq!(next_event(&mut events).await.0, Action::SyncPaused);

        // No resync is scheduled while offline
        sleep(Duration::from_millis(400)).await;
        assert!(events.try_recv().is_err());
        assert!(!api.with_session(Session::is_resync_pending).await);

        // Back online the sync is retried at once, then on a timer
        api.set_network_available(true);
        assert_eq!(next_event(&mut events).await.0, Action::SyncPaused);
        wait_for_session(&api, Session::is_resync_pending).await;

        api.stop_sync().await;
        assert!(!api.with_session(Session::is_resync_pending).await);
    }

    #[tokio::test]
    async fn test_second_pause_replaces_resync_timer() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        mock_joined_rooms(&mut server).await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;
        server
            .mock("GET", "/_matrix/client/v3/rooms/!room:example.org/members")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let session = restored_session(&server, Some("s5"));
        let (handler, mut events) = channel_handler();
        let config = ApiConfig {
            resync_interval: Duration::from_secs(30),
            ..test_config()
        };
        let api = MatrixApi::new(session, None, handler, config).await.unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        assert_eq!(next_event(&mut events).await.0, Action::JoinedRooms);
        assert_eq!(next_event(&mut events).await.0, Action::SyncPaused);
        wait_for_session(&api, Session::is_resync_pending).await;
        let first = api.with_session(|session| session.resync_at).await.unwrap();

        sleep(Duration::from_millis(50)).await;
        api.get_members("!room:example.org").await.unwrap_err();
        assert_eq!(next_event(&mut events).await.0, Action::SyncPaused);
        wait_for_session(&api, |session| {
            session.resync_at.is_some_and(|resync_at| resync_at > first)
        })
        .await;
        assert!(events.try_recv().is_err());
        api.stop_sync().await;
    }

    #[tokio::test]
    async fn test_rate_limit_waits_and_retries() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        let limited = server
            .mock("GET", "/_matrix/client/v3/joined_rooms")
            .with_status(429)
            .with_body(r#"{"errcode": "M_LIMIT_EXCEEDED", "retry_after_ms": 300}"#)
            .expect(1)
            .create_async()
            .await;

        let session = restored_session(&server, None);
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        let (action, _, error) = next_event(&mut events).await;
        assert_eq!(action, Action::JoinedRooms);
        assert_eq!(error, Some(ErrorKind::LimitExceeded));
        limited.assert_async().await;

        mock_joined_rooms(&mut server).await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"next_batch": "s1"}"#)
            .create_async()
            .await;

        let (action, _, error) = next_event(&mut events).await;
        assert_eq!(action, Action::JoinedRooms);
        assert!(error.is_none());
        api.stop_sync().await;
    }

    #[tokio::test]
    async fn test_key_upload_replenishes_exact_difference() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        let device_keys = server
            .mock("POST", "/_matrix/client/v3/keys/upload")
            .match_body(Matcher::PartialJson(json!({"device_keys": {"device_id": "DEVICE"}})))
            .with_status(200)
            .with_body(r#"{"one_time_key_counts": {"signed_curve25519": 10}}"#)
            .expect(1)
            .create_async()
            .await;
        let one_time_keys = server
            .mock("POST", "/_matrix/client/v3/keys/upload")
            .match_body(Matcher::PartialJson(json!({"one_time_keys": {"signed_curve25519:AAAA": "key"}})))
            .with_status(200)
            .with_body(r#"{"one_time_key_counts": {"signed_curve25519": 50}}"#)
            .expect(1)
            .create_async()
            .await;
        mock_joined_rooms(&mut server).await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"next_batch": "s1", "device_one_time_keys_count": {"signed_curve25519": 50}}"#)
            .create_async()
            .await;

        let mut encryption = MockEncryption::new();
        encryption.expect_set_session_identity().return_const(());
        encryption
            .expect_get_device_keys_payload()
            .times(1)
            .returning(|| json!({"device_id": "DEVICE"}));
        encryption.expect_max_one_time_keys().return_const(100usize);
        encryption
            .expect_create_one_time_keys()
            .with(eq(40))
            .times(1)
            .return_const(());
        encryption
            .expect_get_one_time_keys_payload()
            .times(1)
            .returning(|| json!({"signed_curve25519:AAAA": "key"}));
        encryption
            .expect_mark_keys_as_published()
            .times(1)
            .return_const(());

        let session = restored_session(&server, None);
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, Some(Box::new(encryption)), handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        assert_eq!(next_event(&mut events).await.0, Action::UploadKeys);
        assert_eq!(next_event(&mut events).await.0, Action::JoinedRooms);
        assert_eq!(next_event(&mut events).await.0, Action::Sync);
        api.stop_sync().await;

        device_keys.assert_async().await;
        one_time_keys.assert_async().await;
        assert!(api.with_session(|session| session.pending_one_time_keys.is_none()).await);
    }

    #[tokio::test]
    async fn test_sync_counter_triggers_replenishment() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        mock_joined_rooms(&mut server).await;
        server
            .mock("POST", "/_matrix/client/v3/keys/upload")
            .match_body(Matcher::PartialJson(json!({"device_keys": {}})))
            .with_status(200)
            .with_body(r#"{"one_time_key_counts": {"signed_curve25519": 50}}"#)
            .create_async()
            .await;
        let one_time_keys = server
            .mock("POST", "/_matrix/client/v3/keys/upload")
            .match_body(Matcher::PartialJson(json!({"one_time_keys": {}})))
            .with_status(200)
            .with_body(r#"{"one_time_key_counts": {"signed_curve25519": 50}}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::UrlEncoded("full_state".to_owned(), "true".to_owned()))
            .with_status(200)
            .with_body(r#"{"next_batch": "s1", "device_one_time_keys_count": {"signed_curve25519": 3}}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::UrlEncoded("since".to_owned(), "s1".to_owned()))
            .with_status(200)
            .with_body(r#"{"next_batch": "s1", "device_one_time_keys_count": {"signed_curve25519": 50}}"#)
            .create_async()
            .await;

        let mut encryption = MockEncryption::new();
        encryption.expect_set_session_identity().return_const(());
        encryption
            .expect_get_device_keys_payload()
            .returning(|| json!({}));
        encryption.expect_max_one_time_keys().return_const(100usize);
        encryption
            .expect_create_one_time_keys()
            .with(eq(47))
            .times(1)
            .return_const(());
        encryption
            .expect_get_one_time_keys_payload()
            .returning(|| json!({}));
        encryption.expect_mark_keys_as_published().return_const(());

        let session = restored_session(&server, None);
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, Some(Box::new(encryption)), handler, test_config())
            .await
            .unwrap();
        api.start_sync().await;

        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        assert_eq!(next_event(&mut events).await.0, Action::UploadKeys);
        assert_eq!(next_event(&mut events).await.0, Action::JoinedRooms);
        assert_eq!(next_event(&mut events).await.0, Action::Sync);
        assert_eq!(next_event(&mut events).await.0, Action::Sync);
        api.stop_sync().await;

        one_time_keys.assert_async().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut server = mockito::Server::new_async().await;
        mock_versions(&mut server).await;
        mock_joined_rooms(&mut server).await;
        server
            .mock("GET", "/_matrix/client/v3/sync")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"next_batch": "s1"}"#)
            .create_async()
            .await;

        let session = restored_session(&server, None);
        let (handler, mut events) = channel_handler();
        let api = MatrixApi::new(session, None, handler, test_config())
            .await
            .unwrap();

        api.start_sync().await;
        assert_eq!(next_event(&mut events).await.0, Action::VerifyHomeserver);
        api.stop_sync().await;
        assert!(!api.is_syncing().await);

        api.start_sync().await;
        loop {
            if next_event(&mut events).await.0 == Action::Sync {
                break;
            }
        }
        assert!(api.is_syncing().await);
        api.stop_sync().await;
    }
}
