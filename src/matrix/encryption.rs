//! End-to-end encryption capability driven by the orchestrator.
//!
//! The olm/megolm primitives themselves live outside this crate. The
//! orchestrator only drives them: it binds the account identity after login,
//! uploads device and one-time keys, wraps outgoing room events and produces
//! to-device payloads carrying group session keys.

use mockall::automock;
use serde_json::Value;

use crate::matrix::Error;

/// Algorithm of the one-time keys counted by the server.
pub const SIGNED_ONE_TIME_KEY_ALGORITHM: &str = "signed_curve25519";

/// Olm/megolm account of the logged in device.
///
/// Methods are only called from the orchestrator, one at a time.
#[automock]
pub trait Encryption: Send {
    /// Binds the account to the logged in user and device.
    fn set_session_identity(&mut self, user_id: &str, device_id: &str);
    /// Drops the binding set by [`Encryption::set_session_identity`].
    fn clear_session_identity(&mut self);
    /// Maximum number of one-time keys the account can hold.
    fn max_one_time_keys(&self) -> usize;
    /// Generates `count` new one-time keys.
    fn create_one_time_keys(&mut self, count: usize);
    /// Signed one-time keys not yet published, as the `one_time_keys` object
    /// of a `/keys/upload` body.
    fn get_one_time_keys_payload(&mut self) -> Value;
    /// Marks the keys returned by the last payload as published.
    fn mark_keys_as_published(&mut self);
    /// Signed device identity keys, as the `device_keys` object of a
    /// `/keys/upload` body.
    fn get_device_keys_payload(&self) -> Value;
    /// Encrypts a serialized room event for `room_id`, returning the
    /// `m.room.encrypted` content.
    fn encrypt_for_room(&mut self, room_id: &str, plaintext: &str) -> Result<Value, Error>;
    /// Creates the outbound group session of `room_id` and returns the
    /// `messages` object of a `/sendToDevice` body sharing it with `members`.
    fn create_group_keys(&mut self, room_id: &str, members: &[String]) -> Result<Value, Error>;
}
