//! Session persistence between runs.
//!
//! The orchestrator itself never touches the disk. Embedders that want to
//! survive a restart without a new login keep the credentials and the sync
//! cursor in a [`SessionStore`].

use std::path::{Path, PathBuf};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use zeroize::Zeroizing;

use crate::matrix::{Error, ErrorKind, MatrixApi, Secret, Session};

/// Persisted part of a [`Session`].
///
/// This is serialized to JSON; absent values are left out of the file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    homeserver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    matrix_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<Secret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter_id: Option<String>,
    /// The latest sync cursor, to resume syncing where the last run stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sync_token: Option<String>,
}

impl StoredSession {
    fn from_session(session: &Session) -> Self {
        StoredSession {
            homeserver: session.homeserver().map(ToOwned::to_owned),
            matrix_id: session.matrix_id().map(ToOwned::to_owned),
            device_id: session.device_id().map(ToOwned::to_owned),
            access_token: session.access_token().map(|token| Secret::new(token.expose())),
            filter_id: session.filter_id().map(ToOwned::to_owned),
            sync_token: session.sync_cursor().map(ToOwned::to_owned),
        }
    }
}

/// Session file manager.
///
/// # File Structure
///
/// The data directory contains a `session` JSON file with the homeserver,
/// the credentials, the filter id and the sync cursor.
///
/// # Examples
///
/// ```no_run
/// use mxlink::matrix::{Session, store::SessionStore};
///
/// # async fn example() -> Result<(), mxlink::matrix::Error> {
/// let store = SessionStore::new("path/to/data".as_ref()).await?;
/// let session = store.restore(Session::new("@alice:example.org"));
/// # Ok(())
/// # }
/// ```
pub struct SessionStore {
    /// Session found on disk when the store was opened
    stored: Option<StoredSession>,
    /// Path to the session file. Value is `dir_path/session`
    session_path: PathBuf,
}

impl SessionStore {
    /// Opens the store in `dir_path`, loading the session file if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(dir_path: &Path) -> Result<SessionStore, Error> {
        debug!("read session at {}", dir_path.display());
        fs::create_dir_all(dir_path).await?;

        let session_path = dir_path.join("session");
        let stored = match SessionStore::get_session(&session_path).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                debug!("no stored session: {}", e);
                None
            }
        };

        Ok(SessionStore {
            stored,
            session_path,
        })
    }

    async fn get_session(session_path: &Path) -> Result<StoredSession, Error> {
        if !fs::try_exists(session_path).await.unwrap_or_default() {
            return Err(Error::new(ErrorKind::Io, "session file does not exist"));
        }

        let session_data = Zeroizing::new(fs::read_to_string(session_path).await?);
        Ok(serde_json::from_str(&session_data)?)
    }

    /// Checks if a session was found when the store was opened.
    pub fn has_session(&self) -> bool {
        self.stored.is_some()
    }

    /// Returns the sync cursor found when the store was opened.
    pub fn get_sync_token(&self) -> Option<&str> {
        self.stored
            .as_ref()
            .and_then(|stored| stored.sync_token.as_deref())
    }

    /// Fills `session` with what was stored.
    ///
    /// Configured values win over stored ones for the homeserver; a stored
    /// homeserver that is no longer valid is ignored.
    pub fn restore(&self, mut session: Session) -> Session {
        let Some(stored) = &self.stored else {
            return session;
        };

        if session.homeserver().is_none()
            && let Some(homeserver) = &stored.homeserver
            && let Err(e) = session.set_homeserver(homeserver)
        {
            warn!("ignore stored homeserver: {}", e);
        }
        if let Some(matrix_id) = &stored.matrix_id {
            session = session.with_matrix_id(matrix_id.as_str());
        }
        if let Some(device_id) = &stored.device_id {
            session = session.with_device_id(device_id.as_str());
        }
        if let Some(access_token) = &stored.access_token {
            session = session.with_access_token(Secret::new(access_token.expose()));
        }
        if let Some(filter_id) = &stored.filter_id {
            session = session.with_filter_id(filter_id.as_str());
        }
        if let Some(sync_token) = &stored.sync_token {
            session = session.with_sync_cursor(sync_token);
        }
        session
    }

    /// Writes the credentials and sync cursor of `session`, replacing the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file cannot be written.
    pub async fn persist_session(&self, session: &Session) -> Result<(), Error> {
        trace!("persist session");

        self.write(&StoredSession::from_session(session)).await
    }

    /// Persists the session currently held by `api`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file cannot be written.
    pub async fn persist_api_session(&self, api: &MatrixApi) -> Result<(), Error> {
        trace!("persist api session");

        let stored = api.with_session(StoredSession::from_session).await;
        self.write(&stored).await
    }

    async fn write(&self, stored: &StoredSession) -> Result<(), Error> {
        let serialized = Zeroizing::new(serde_json::to_string(stored)?);
        fs::write(&self.session_path, serialized.as_bytes()).await?;

        trace!("session persisted");
        Ok(())
    }

    /// Persists the sync cursor, keeping the rest of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file cannot be read, parsed, or written.
    pub async fn persist_sync_token(&self, sync_token: &str) -> Result<(), Error> {
        trace!("persist sync token {}", sync_token);

        let mut stored = SessionStore::get_session(&self.session_path)
            .await
            .unwrap_or_default();
        stored.sync_token = Some(sync_token.to_owned());
        self.write(&stored).await
    }
}
