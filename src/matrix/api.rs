//! Session owner and request façade.
//!
//! [`MatrixApi`] is a cheap-to-clone handle on one account: the session, the
//! encryption capability, the transport and the sync task. Façade calls can be
//! issued from anywhere, concurrently with the sync task and with each other.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use matrix_sdk::ruma::events::room::message::RoomMessageEventContent;
use serde_json::{Map, Value, json};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    matrix::{
        Action, Encryption, Error, ErrorClass, ErrorKind, FileInfo, FileStatus, Medium, Message,
        MessageStatus, SIGNED_ONE_TIME_KEY_ALGORITHM, Secret, Session, SessionHandler, ThreePid,
        sync::{SyncDriver, SyncState},
    },
    transport::{MatrixNet, Progress, Request},
};

/// Number of events requested per history page.
const PAGE_SIZE: u32 = 50;
/// Server-side wait of key queries and claims, in milliseconds.
const KEYS_TIMEOUT_MS: u64 = 10_000;
/// How long a typing notification stays valid, in milliseconds.
const TYPING_TIMEOUT_MS: u64 = 30_000;
const ROOM_ENCRYPTION_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Tunables of a [`MatrixApi`].
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Delay before a sync paused by network trouble is retried
    pub resync_interval: Duration,
    /// Long-poll timeout until the first successful sync
    pub initial_timeout: Duration,
    /// Long-poll timeout afterwards
    pub timeout: Duration,
    /// Concurrent requests per host
    pub max_connections: usize,
    /// Look up `.well-known` over plain http
    pub insecure_discovery: bool,
    /// Root directory of downloaded attachments
    pub download_dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            resync_interval: Duration::from_secs(10),
            initial_timeout: Duration::from_millis(10_000),
            timeout: Duration::from_millis(30_000),
            max_connections: 4,
            insecure_discovery: false,
            download_dir: PathBuf::from("downloads"),
        }
    }
}

/// State shared by the façade and the sync task.
pub(crate) struct ApiInner {
    pub(crate) net: MatrixNet,
    pub(crate) session: Mutex<Session>,
    pub(crate) encryption: Mutex<Option<Box<dyn Encryption>>>,
    pub(crate) handler: Box<dyn SessionHandler>,
    pub(crate) config: ApiConfig,
    pub(crate) network_available: AtomicBool,
    /// Woken whenever `network_available` changes
    pub(crate) network_changed: Notify,
    /// Woken when a façade call hits network trouble, to pause the sync task
    pub(crate) sync_interrupt: Notify,
    lifecycle: Mutex<Lifecycle>,
}

impl ApiInner {
    pub(crate) fn report(&self, action: Action, response: Option<&Value>, error: Option<&Error>) {
        self.handler.on_action(action, response, error);
    }

    /// Forgets the rejected access token and the device identity bound to it.
    pub(crate) async fn forget_access_token(&self) {
        self.session.lock().await.clear_access_token();
        self.net.set_access_token(None).await;
        if let Some(encryption) = self.encryption.lock().await.as_mut() {
            encryption.clear_session_identity();
        }
    }

    /// Flags the sync as failed and tells the handler.
    pub(crate) async fn pause_sync(&self) {
        self.session.lock().await.sync_failed = true;
        self.report(Action::SyncPaused, None, None);
    }
}

/// Session-wide cancellation token and the running sync task.
struct Lifecycle {
    cancel: CancellationToken,
    sync_task: Option<JoinHandle<()>>,
}

/// Handle on one Matrix account.
///
/// # Examples
///
/// ```no_run
/// use mxlink::matrix::{Action, ApiConfig, Error, MatrixApi, Message, Session};
/// use serde_json::Value;
///
/// # async fn example() -> Result<(), Error> {
/// let session = Session::new("@alice:example.org").with_homeserver("https://example.org")?;
/// let handler = |action: Action, _: Option<&Value>, _: Option<&Error>| println!("{action:?}");
/// let api = MatrixApi::new(session, None, handler, ApiConfig::default()).await?;
///
/// let mut message = Message::text("hello");
/// api.send_message("!room:example.org", &mut message, false).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MatrixApi {
    inner: Arc<ApiInner>,
}

impl MatrixApi {
    /// Creates the handle. Nothing is sent until [`MatrixApi::start_sync`] or
    /// a façade call.
    ///
    /// # Arguments
    ///
    /// * `session` - Credentials and sync position to start from
    /// * `encryption` - Olm account of the device, if end-to-end encryption is used
    /// * `handler` - Receives every bootstrap and sync event
    /// * `config` - Timeouts and limits
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub async fn new(
        session: Session,
        encryption: Option<Box<dyn Encryption>>,
        handler: impl SessionHandler + 'static,
        config: ApiConfig,
    ) -> Result<Self, Error> {
        let net = MatrixNet::new(config.max_connections)?;
        if let Some(homeserver) = session.homeserver() {
            net.set_homeserver(homeserver).await?;
        }
        if let Some(access_token) = session.access_token() {
            net.set_access_token(Some(Secret::new(access_token.expose())))
                .await;
        }

        Ok(MatrixApi {
            inner: Arc::new(ApiInner {
                net,
                session: Mutex::new(session),
                encryption: Mutex::new(encryption),
                handler: Box::new(handler),
                config,
                network_available: AtomicBool::new(true),
                network_changed: Notify::new(),
                sync_interrupt: Notify::new(),
                lifecycle: Mutex::new(Lifecycle {
                    cancel: CancellationToken::new(),
                    sync_task: None,
                }),
            }),
        })
    }

    /// Starts (or restarts) bootstrap and the sync loop.
    ///
    /// A fresh cancellation token is installed first, so a session stopped
    /// with [`MatrixApi::stop_sync`] can be started again.
    pub async fn start_sync(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(task) = lifecycle.sync_task.take() {
            lifecycle.cancel.cancel();
            task.abort();
        }

        info!("start sync");
        lifecycle.cancel = CancellationToken::new();
        let driver = SyncDriver::new(Arc::clone(&self.inner), lifecycle.cancel.clone());
        lifecycle.sync_task = Some(tokio::spawn(driver.drive(SyncState::Init)));
    }

    /// Replaces the sync task with one starting at a new login.
    ///
    /// Nothing happens once the session was stopped.
    async fn restart_with_login(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.cancel.is_cancelled() {
            debug!("session stopped, no login");
            return;
        }
        if let Some(task) = lifecycle.sync_task.take() {
            task.abort();
            let _ = task.await;
        }

        info!("restart sync with a new login");
        let driver = SyncDriver::new(Arc::clone(&self.inner), lifecycle.cancel.clone())
            .after_relogin();
        lifecycle.sync_task = Some(tokio::spawn(driver.drive(SyncState::Login)));
    }

    /// Cancels every in-flight request of the session and stops the sync loop.
    pub async fn stop_sync(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        info!("stop sync");
        lifecycle.cancel.cancel();
        if let Some(task) = lifecycle.sync_task.take() {
            task.abort();
        }
        self.inner.session.lock().await.resync_at = None;
    }

    /// Whether the sync task is still running.
    pub async fn is_syncing(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle
            .sync_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Reports network reachability. Going online wakes a paused sync at once;
    /// while offline no resync is scheduled.
    pub fn set_network_available(&self, available: bool) {
        let previous = self.inner.network_available.swap(available, Ordering::SeqCst);
        if previous != available {
            debug!("network available: {}", available);
            self.inner.network_changed.notify_waiters();
        }
    }

    /// Runs `f` on the session, e.g. to export credentials for persistence.
    pub async fn with_session<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        let session = self.inner.session.lock().await;
        f(&*session)
    }

    /// Replaces the password used for the next login; the old one is zeroized.
    pub async fn set_password(&self, password: Option<Secret>) {
        self.inner.session.lock().await.set_password(password);
    }

    async fn cancel_token(&self) -> CancellationToken {
        self.inner.lifecycle.lock().await.cancel.clone()
    }

    async fn send(&self, request: Request) -> Result<Value, Error> {
        let cancel = self.cancel_token().await;
        self.inner.net.send(request, &cancel).await
    }

    /// Sends a façade request; failures go through [`MatrixApi::recover`]
    /// before being returned.
    async fn request(&self, action: Action, request: Request) -> Result<Value, Error> {
        let result = self.send(request).await;
        if let Err(error) = &result {
            self.recover(action, error).await;
        }
        result
    }

    /// Recovery funnel of façade calls.
    ///
    /// An expired token starts a new login and network trouble pauses the
    /// sync task. Other failures are reported with `action`, except a missing
    /// room state event.
    async fn recover(&self, action: Action, error: &Error) {
        match error.class() {
            _ if error.kind() == &ErrorKind::Cancelled => {
                debug!("{:?} cancelled", action);
            }
            ErrorClass::Reauthenticate => self.relogin(action, error).await,
            ErrorClass::TransientNetwork => {
                warn!("{:?} failed, sync paused: {}", action, error);
                self.inner.pause_sync().await;
                self.inner.sync_interrupt.notify_waiters();
            }
            _ if error.is_not_found() && action.is_room_state_lookup() => {
                debug!("{:?}: no such state event", action);
            }
            _ => {
                warn!("{:?} failed: {}", action, error);
                self.inner.report(action, None, Some(error));
            }
        }
    }

    async fn relogin(&self, action: Action, error: &Error) {
        {
            let mut session = self.inner.session.lock().await;
            if session.access_token().is_none() {
                debug!("{:?} failed, login already under way", action);
                return;
            }
            if !session.has_password() {
                drop(session);
                error!("{:?} failed, cannot login again: {}", action, error);
                self.inner.report(action, None, Some(error));
                return;
            }
            session.clear_access_token();
        }

        warn!("access token rejected, login again");
        self.inner.forget_access_token().await;
        self.inner.report(Action::Relogin, None, None);
        self.restart_with_login().await;
    }

    async fn own_user_id(&self) -> Result<String, Error> {
        self.inner
            .session
            .lock()
            .await
            .matrix_id()
            .map(ToOwned::to_owned)
            .ok_or_else(|| Error::invalid_input("not logged in"))
    }

    async fn next_transaction_id(&self) -> String {
        self.inner.session.lock().await.next_transaction_id()
    }

    /// Sends a text message to a room.
    ///
    /// The message keeps its transaction id across resends; a new one is only
    /// generated when it has none. In an encrypted room the event is wrapped
    /// by the encryption capability and sent as `m.room.encrypted`.
    ///
    /// # Returns
    ///
    /// The server response (`{"event_id": ...}`). The message is marked sent
    /// and carries the event id, or is marked as failed.
    ///
    /// # Errors
    ///
    /// Transport errors, or [`ErrorKind::NoEncryption`] for an encrypted room
    /// without an encryption capability.
    pub async fn send_message(
        &self,
        room_id: &str,
        message: &mut Message,
        room_encrypted: bool,
    ) -> Result<Value, Error> {
        let txn_id = match &message.txn_id {
            Some(txn_id) => txn_id.clone(),
            None => {
                let txn_id = self.next_transaction_id().await;
                message.txn_id = Some(txn_id.clone());
                txn_id
            }
        };
        message.status = MessageStatus::Sending;

        match self.send_text(room_id, &message.body, &txn_id, room_encrypted).await {
            Ok(response) => {
                message.status = MessageStatus::Sent;
                message.event_id = response
                    .get("event_id")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                Ok(response)
            }
            Err(error) => {
                warn!("failed to send message {} to {}: {}", txn_id, room_id, error);
                message.status = MessageStatus::SendFailed;
                Err(error)
            }
        }
    }

    async fn send_text(
        &self,
        room_id: &str,
        body: &str,
        txn_id: &str,
        room_encrypted: bool,
    ) -> Result<Value, Error> {
        let content = serde_json::to_value(RoomMessageEventContent::text_markdown(body))?;
        let (event_type, content) = if room_encrypted {
            let plaintext = json!({
                "type": "m.room.message",
                "content": content,
                "room_id": room_id,
            })
            .to_string();
            let mut encryption = self.inner.encryption.lock().await;
            let encryption = encryption
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::NoEncryption, "room is encrypted"))?;
            ("m.room.encrypted", encryption.encrypt_for_room(room_id, &plaintext)?)
        } else {
            ("m.room.message", content)
        };

        let request = Request::put(
            &["rooms", room_id, "send", event_type, txn_id],
            content,
        );
        self.request(Action::SendMessage, request).await
    }

    /// Moves both the fully-read and the read marker to `message`.
    pub async fn set_read_marker(&self, room_id: &str, message: &Message) -> Result<Value, Error> {
        let event_id = message
            .event_id
            .as_deref()
            .ok_or_else(|| Error::invalid_input("message has no event id"))?;
        let request = Request::post(
            &["rooms", room_id, "read_markers"],
            json!({"m.fully_read": event_id, "m.read": event_id}),
        );
        self.request(Action::SetReadMarker, request).await
    }

    /// Full current state of a room.
    pub async fn get_room_state(&self, room_id: &str) -> Result<Value, Error> {
        self.request(Action::GetRoomState, Request::get(&["rooms", room_id, "state"]))
            .await
    }

    /// Content of the `m.room.name` state event.
    pub async fn get_room_name(&self, room_id: &str) -> Result<Value, Error> {
        self.request(
            Action::GetRoomName,
            Request::get(&["rooms", room_id, "state", "m.room.name"]),
        )
        .await
    }

    /// Content of the `m.room.encryption` state event; [`ErrorKind::NotFound`]
    /// for an unencrypted room.
    pub async fn get_room_encryption(&self, room_id: &str) -> Result<Value, Error> {
        self.request(
            Action::GetRoomEncryption,
            Request::get(&["rooms", room_id, "state", "m.room.encryption"]),
        )
        .await
    }

    /// Enables megolm encryption in a room. There is no way back.
    pub async fn set_room_encryption(&self, room_id: &str) -> Result<Value, Error> {
        let request = Request::put(
            &["rooms", room_id, "state", "m.room.encryption"],
            json!({"algorithm": ROOM_ENCRYPTION_ALGORITHM}),
        );
        self.request(Action::SetRoomEncryption, request).await
    }

    pub async fn get_members(&self, room_id: &str) -> Result<Value, Error> {
        self.request(Action::GetMembers, Request::get(&["rooms", room_id, "members"]))
            .await
    }

    pub async fn get_joined_members(&self, room_id: &str) -> Result<Value, Error> {
        self.request(
            Action::GetJoinedMembers,
            Request::get(&["rooms", room_id, "joined_members"]),
        )
        .await
    }

    /// Fetches a page of older events, going backwards from `from`.
    pub async fn paginate(
        &self,
        room_id: &str,
        from: &str,
        to: Option<&str>,
    ) -> Result<Value, Error> {
        let mut request = Request::get(&["rooms", room_id, "messages"])
            .query("from", from)
            .query("dir", "b")
            .query("limit", PAGE_SIZE.to_string());
        if let Some(to) = to {
            request = request.query("to", to);
        }
        self.request(Action::Paginate, request).await
    }

    /// Downloads the device lists of `users`.
    ///
    /// # Arguments
    ///
    /// * `users` - User ids, at least one
    /// * `since` - Sync token; when set only devices changed since are returned
    pub async fn query_keys(&self, users: &[String], since: Option<&str>) -> Result<Value, Error> {
        if users.is_empty() {
            return Err(Error::invalid_input("no user to query keys for"));
        }
        let device_keys: Map<String, Value> = users
            .iter()
            .map(|user| (user.clone(), json!([])))
            .collect();
        let mut body = json!({"device_keys": device_keys, "timeout": KEYS_TIMEOUT_MS});
        if let Some(since) = since {
            body["token"] = json!(since);
        }
        self.request(Action::QueryKeys, Request::post(&["keys", "query"], body))
            .await
    }

    /// Claims one signed one-time key for every listed device.
    ///
    /// # Arguments
    ///
    /// * `devices` - Device ids by user id, at least one user
    pub async fn claim_keys(&self, devices: &BTreeMap<String, Vec<String>>) -> Result<Value, Error> {
        if devices.is_empty() {
            return Err(Error::invalid_input("no device to claim keys for"));
        }
        let one_time_keys: Map<String, Value> = devices
            .iter()
            .map(|(user, device_ids)| {
                let algorithms: Map<String, Value> = device_ids
                    .iter()
                    .map(|device_id| (device_id.clone(), json!(SIGNED_ONE_TIME_KEY_ALGORITHM)))
                    .collect();
                (user.clone(), Value::Object(algorithms))
            })
            .collect();
        let request = Request::post(
            &["keys", "claim"],
            json!({"one_time_keys": one_time_keys, "timeout": KEYS_TIMEOUT_MS}),
        );
        self.request(Action::ClaimKeys, request).await
    }

    /// Shares the outbound group session of a room with its members' devices.
    pub async fn upload_group_keys(
        &self,
        room_id: &str,
        members: &[String],
    ) -> Result<Value, Error> {
        let messages = {
            let mut encryption = self.inner.encryption.lock().await;
            let encryption = encryption
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::NoEncryption, "no encryption"))?;
            encryption.create_group_keys(room_id, members)?
        };
        let txn_id = self.next_transaction_id().await;
        let request = Request::put(
            &["sendToDevice", "m.room.encrypted", &txn_id],
            json!({"messages": messages}),
        );
        self.request(Action::UploadGroupKeys, request).await
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<Value, Error> {
        self.request(
            Action::LeaveRoom,
            Request::post(&["rooms", room_id, "leave"], json!({})),
        )
        .await
    }

    /// Display name of `user_id`, `None` if the user has none.
    pub async fn get_display_name(&self, user_id: &str) -> Result<Option<String>, Error> {
        let response = self
            .request(
                Action::GetDisplayName,
                Request::get(&["profile", user_id, "displayname"]),
            )
            .await?;
        Ok(string_field(&response, "displayname"))
    }

    pub async fn set_display_name(&self, display_name: &str) -> Result<Value, Error> {
        let user_id = self.own_user_id().await?;
        let request = Request::put(
            &["profile", &user_id, "displayname"],
            json!({"displayname": display_name}),
        );
        self.request(Action::SetDisplayName, request).await
    }

    /// `mxc://` avatar of `user_id`, `None` if the user has none.
    pub async fn get_avatar(&self, user_id: &str) -> Result<Option<String>, Error> {
        let response = self
            .request(
                Action::GetAvatar,
                Request::get(&["profile", user_id, "avatar_url"]),
            )
            .await?;
        Ok(string_field(&response, "avatar_url").filter(|url| !url.is_empty()))
    }

    /// Uploads `path` as the account avatar, or removes the avatar.
    pub async fn set_avatar(&self, path: Option<&Path>) -> Result<Value, Error> {
        let user_id = self.own_user_id().await?;
        let avatar_url = match path {
            Some(path) => self.upload_media(path).await?,
            None => String::new(),
        };
        let request = Request::put(
            &["profile", &user_id, "avatar_url"],
            json!({"avatar_url": avatar_url}),
        );
        self.request(Action::SetAvatar, request).await
    }

    /// Uploads a file to the media repository.
    ///
    /// # Returns
    ///
    /// The `mxc://` reference of the uploaded file.
    pub async fn upload_media(&self, path: &Path) -> Result<String, Error> {
        let cancel = self.cancel_token().await;
        let response = match self.inner.net.upload(path, &guess_mime(path), &cancel).await {
            Ok(response) => response,
            Err(error) => {
                self.recover(Action::UploadMedia, &error).await;
                return Err(error);
            }
        };
        string_field(&response, "content_uri")
            .ok_or_else(|| Error::malformed("upload response without content_uri"))
    }

    /// Third-party identifiers bound to the account. Unknown media are skipped.
    pub async fn get_3pids(&self) -> Result<Vec<ThreePid>, Error> {
        let response = self
            .request(Action::Get3pids, Request::get(&["account", "3pid"]))
            .await?;
        let threepids = response
            .get("threepids")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|threepid| serde_json::from_value(threepid.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(threepids)
    }

    /// Unbinds a third-party identifier.
    ///
    /// # Returns
    ///
    /// The medium of the deleted identifier.
    pub async fn delete_3pid(&self, medium: Medium, address: &str) -> Result<Medium, Error> {
        let request = Request::post(
            &["account", "3pid", "delete"],
            json!({"medium": medium.as_str(), "address": address}),
        );
        self.request(Action::Delete3pid, request).await?;
        Ok(medium)
    }

    /// Sends a typing notification in the background. Failures are only logged.
    pub fn set_typing(&self, room_id: &str, typing: bool) -> JoinHandle<()> {
        let api = self.clone();
        let room_id = room_id.to_owned();
        tokio::spawn(async move {
            let user_id = match api.own_user_id().await {
                Ok(user_id) => user_id,
                Err(e) => {
                    warn!("cannot send typing notification: {}", e);
                    return;
                }
            };
            let mut body = json!({"typing": typing});
            if typing {
                body["timeout"] = json!(TYPING_TIMEOUT_MS);
            }
            let request = Request::put(&["rooms", &room_id, "typing", &user_id], body);
            if let Err(e) = api.send(request).await {
                warn!("failed to send typing notification to {}: {}", room_id, e);
            }
        })
    }

    /// Downloads an attachment below the configured download directory.
    ///
    /// The file is decrypted when the message it belongs to was encrypted and
    /// the file carries key material.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AlreadyResolved`] if the file was already downloaded or is
    /// known to be missing, otherwise as [`MatrixNet::download`].
    pub async fn download_file(
        &self,
        file: &mut FileInfo,
        message: Option<&Message>,
        progress: Option<&Progress>,
    ) -> Result<bool, Error> {
        if file.status != FileStatus::Unknown {
            return Err(Error::new(
                ErrorKind::AlreadyResolved,
                format!("{} already resolved", file.url),
            ));
        }
        let decrypt = message.is_some_and(|message| message.encrypted) && file.encryption.is_some();
        let cancel = self.cancel_token().await;
        let result = self
            .inner
            .net
            .download(
                file,
                decrypt,
                &self.inner.config.download_dir,
                &cancel,
                progress,
            )
            .await;
        if let Err(error) = &result {
            self.recover(Action::DownloadFile, error).await;
        }
        result
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(ToOwned::to_owned)
}

/// Content type of an upload, from its extension.
fn guess_mime(path: &Path) -> mime::Mime {
    mime_guess::from_path(path).first_or_octet_stream()
}

impl std::fmt::Debug for MatrixApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixApi").finish_non_exhaustive()
    }
}
