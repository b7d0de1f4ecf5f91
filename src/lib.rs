//! mxlink - a Matrix client-server session engine.
//!
//! The crate bootstraps a session against a Matrix homeserver (discovery,
//! verification, login, key and filter upload), keeps a standing sync
//! long-poll running and recovers on its own from network trouble, rate
//! limiting and expired tokens.
//!
//! # Architecture
//!
//! - [`transport`] - HTTP requests against the homeserver, JSON and error
//!   parsing, authenticated media download with optional decryption
//! - [`matrix`] - the orchestrator: session state, bootstrap state machine,
//!   sync loop, recovery funnel and request façade
//! - [`config`] - YAML configuration with environment overrides
//! - [`utils`] - homeserver URL normalization and media references

pub mod config;
pub mod matrix;
pub mod transport;
pub mod utils;
