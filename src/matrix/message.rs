//! Messages and attachments exchanged with the history store.
//!
//! These are the small slices of the chat history model the orchestrator
//! reads and updates: delivery status, transaction ids and attachment files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Delivery state of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageStatus {
    #[default]
    Draft,
    Sending,
    Sent,
    SendFailed,
}

/// Resolution state of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileStatus {
    /// Not downloaded yet
    #[default]
    Unknown,
    Downloaded,
    /// The server does not have the file anymore
    Missing,
}

/// Key material of an encrypted attachment (the `file` object of an
/// `m.room.encrypted` media event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEncryption {
    /// AES-256 key, unpadded base64url (JWK `k`)
    pub key: String,
    /// Initial counter block, unpadded base64
    pub iv: String,
    /// SHA-256 of the ciphertext, unpadded base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// An attachment referenced by a message.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// `mxc://` reference
    pub url: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    /// Path relative to the download directory, set once downloaded
    pub path: Option<PathBuf>,
    pub status: FileStatus,
    pub encryption: Option<FileEncryption>,
}

impl FileInfo {
    pub fn new(url: impl Into<String>) -> Self {
        FileInfo {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// A room message as seen by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Server assigned event id, set once sent or when received
    pub event_id: Option<String>,
    /// Client transaction id, kept across resends
    pub txn_id: Option<String>,
    pub body: String,
    pub status: MessageStatus,
    /// Whether the message arrived as an `m.room.encrypted` event
    pub encrypted: bool,
    pub files: Vec<FileInfo>,
}

impl Message {
    pub fn text(body: impl Into<String>) -> Self {
        Message {
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Third-party identifier medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    Email,
    Msisdn,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Medium::Email => "email",
            Medium::Msisdn => "msisdn",
        }
    }
}

/// A third-party identifier bound to the account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThreePid {
    pub medium: Medium,
    pub address: String,
}
