//! Matrix protocol orchestrator.
//!
//! This module drives one Matrix account over the transport queue:
//! - Bootstrap (homeserver discovery and verification, login, key upload,
//!   filter upload, joined rooms)
//! - The standing sync long-poll and its error-recovery funnel
//! - One-time key replenishment
//! - A request façade for room, profile, key and media operations
//!
//! # Architecture
//!
//! [`MatrixApi`] owns the [`Session`] and the optional [`Encryption`]
//! capability. `start_sync` spawns a single dispatch task that advances the
//! bootstrap state machine and then loops on `/sync`; every state change is
//! reported through the [`SessionHandler`] given at construction.
//!
//! # Examples
//!
//! ```no_run
//! use mxlink::matrix::{Action, ApiConfig, MatrixApi, Secret, Session};
//!
//! # async fn example() -> Result<(), mxlink::matrix::Error> {
//! let session = Session::new("@alice:example.org").with_password(Secret::new("secret"));
//! let api = MatrixApi::new(
//!     session,
//!     None,
//!     |action: Action, _: Option<&serde_json::Value>, error: Option<&mxlink::matrix::Error>| {
//!         println!("{action:?} {error:?}");
//!     },
//!     ApiConfig::default(),
//! )
//! .await?;
//! api.start_sync().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod encryption;
mod error;
mod message;
mod response_structs;
mod secret;
mod session;
pub mod store;
mod sync;

use serde_json::Value;

pub use crate::matrix::api::{ApiConfig, MatrixApi};
pub use crate::matrix::encryption::{Encryption, MockEncryption, SIGNED_ONE_TIME_KEY_ALGORITHM};
pub use crate::matrix::error::{Error, ErrorClass, ErrorKind};
pub use crate::matrix::message::{
    FileEncryption, FileInfo, FileStatus, Medium, Message, MessageStatus, ThreePid,
};
pub use crate::matrix::secret::Secret;
pub use crate::matrix::session::Session;
pub use crate::matrix::sync::SyncState;

/// Event reported to the [`SessionHandler`].
///
/// Bootstrap and sync steps report their own action on success (with the
/// response) and on unrecoverable failure (with the error). Façade calls
/// return their result to the caller and report only failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ResolveHomeserver,
    VerifyHomeserver,
    Login,
    /// The access token was rejected; a new login is under way
    Relogin,
    UploadKeys,
    UploadFilter,
    JoinedRooms,
    Sync,
    /// Network trouble; sync resumes on its own
    SyncPaused,
    SendMessage,
    SetReadMarker,
    GetRoomState,
    GetRoomName,
    GetRoomEncryption,
    SetRoomEncryption,
    GetMembers,
    GetJoinedMembers,
    Paginate,
    QueryKeys,
    ClaimKeys,
    UploadGroupKeys,
    LeaveRoom,
    GetDisplayName,
    SetDisplayName,
    GetAvatar,
    SetAvatar,
    UploadMedia,
    Get3pids,
    Delete3pid,
    DownloadFile,
}

impl Action {
    /// Whether the action is a bootstrap or sync step of the sync task.
    pub fn is_sync_step(self) -> bool {
        matches!(
            self,
            Action::ResolveHomeserver
                | Action::VerifyHomeserver
                | Action::Login
                | Action::UploadKeys
                | Action::UploadFilter
                | Action::JoinedRooms
                | Action::Sync
        )
    }

    /// Room state lookups, for which a missing event is an answer rather
    /// than a failure.
    fn is_room_state_lookup(self) -> bool {
        matches!(
            self,
            Action::GetRoomState | Action::GetRoomName | Action::GetRoomEncryption
        )
    }
}

/// Session-wide completion handler.
///
/// Called from the sync task, or from a failing façade call, with either a
/// response or an error. Pure notifications ([`Action::Relogin`],
/// [`Action::SyncPaused`]) carry neither.
pub trait SessionHandler: Send + Sync {
    fn on_action(&self, action: Action, response: Option<&Value>, error: Option<&Error>);
}

impl<F> SessionHandler for F
where
    F: Fn(Action, Option<&Value>, Option<&Error>) + Send + Sync,
{
    fn on_action(&self, action: Action, response: Option<&Value>, error: Option<&Error>) {
        self(action, response, error)
    }
}
