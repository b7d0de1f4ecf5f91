//! Typed errors for the Matrix session engine.
//!
//! Every failure produced by the transport queue or the orchestrator is an
//! [`Error`]: a closed [`ErrorKind`] plus a human readable message and, for
//! rate limiting, a retry hint. The recovery funnel never looks at messages,
//! only at [`Error::class`].

use std::{fmt, time::Duration};

use thiserror::Error;

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No homeserver was configured and none could be discovered.
    NoHomeserver,
    /// A password login was required but no password is known.
    EmptyPassword,
    /// The homeserver does not speak a supported client-server API version.
    IncompatibleHomeserver,
    /// `M_UNKNOWN_TOKEN`: the access token is invalid or expired.
    UnknownToken,
    /// `M_LIMIT_EXCEEDED`: the request was rate limited.
    LimitExceeded,
    /// `M_NOT_FOUND`.
    NotFound,
    /// `M_FORBIDDEN`, which includes a wrong password on login.
    Forbidden,
    /// Any other server error code.
    OtherServer(String),
    /// Non-success HTTP status without a Matrix error body.
    Http(u16),
    /// Host name resolution failed.
    Dns,
    /// TLS handshake or certificate failure.
    Tls,
    /// The request timed out.
    Timeout,
    /// The server could not be reached.
    Unreachable,
    /// The response body was not the JSON we expected.
    Malformed,
    /// The request was cancelled through its cancellation token.
    Cancelled,
    /// Local file system failure.
    Io,
    /// The file was already downloaded or marked missing.
    AlreadyResolved,
    /// The caller passed arguments the request cannot be built from.
    InvalidInput,
    /// An encrypted operation was requested without an encryption capability.
    NoEncryption,
}

/// How the orchestrator reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Surfaced once; new credentials or configuration are needed.
    Fatal,
    /// The token must be dropped and a new login performed.
    Reauthenticate,
    /// Network trouble: pause and retry later.
    TransientNetwork,
    /// Resend after the retry hint.
    RateLimited,
    /// Only the calling operation is affected.
    RequestSpecific,
}

/// Error returned by every transport and orchestrator operation.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Builds an error from a Matrix error code (`errcode`) and its `error` text.
    pub fn from_errcode(errcode: &str, message: impl Into<String>) -> Self {
        let kind = match errcode {
            "M_UNKNOWN_TOKEN" | "M_MISSING_TOKEN" => ErrorKind::UnknownToken,
            "M_LIMIT_EXCEEDED" => ErrorKind::LimitExceeded,
            "M_NOT_FOUND" => ErrorKind::NotFound,
            "M_FORBIDDEN" => ErrorKind::Forbidden,
            other => ErrorKind::OtherServer(other.to_owned()),
        };
        Error::new(kind, message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn cancelled() -> Self {
        Error::new(ErrorKind::Cancelled, "request cancelled")
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidInput, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Malformed, message)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Server supplied delay before the request may be sent again.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound | ErrorKind::Http(404))
    }

    /// Classifies the error for the recovery funnel.
    pub fn class(&self) -> ErrorClass {
        match self.kind {
            ErrorKind::NoHomeserver
            | ErrorKind::EmptyPassword
            | ErrorKind::IncompatibleHomeserver => ErrorClass::Fatal,
            ErrorKind::UnknownToken => ErrorClass::Reauthenticate,
            ErrorKind::Dns
            | ErrorKind::Tls
            | ErrorKind::Timeout
            | ErrorKind::Unreachable
            | ErrorKind::Malformed => ErrorClass::TransientNetwork,
            ErrorKind::LimitExceeded => ErrorClass::RateLimited,
            ErrorKind::NotFound
            | ErrorKind::Forbidden
            | ErrorKind::OtherServer(_)
            | ErrorKind::Http(_)
            | ErrorKind::Cancelled
            | ErrorKind::Io
            | ErrorKind::AlreadyResolved
            | ErrorKind::InvalidInput
            | ErrorKind::NoEncryption => ErrorClass::RequestSpecific,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::NoHomeserver => write!(f, "no homeserver"),
            ErrorKind::EmptyPassword => write!(f, "empty password"),
            ErrorKind::IncompatibleHomeserver => write!(f, "incompatible homeserver"),
            ErrorKind::UnknownToken => write!(f, "M_UNKNOWN_TOKEN"),
            ErrorKind::LimitExceeded => write!(f, "M_LIMIT_EXCEEDED"),
            ErrorKind::NotFound => write!(f, "M_NOT_FOUND"),
            ErrorKind::Forbidden => write!(f, "M_FORBIDDEN"),
            ErrorKind::OtherServer(code) => write!(f, "{code}"),
            ErrorKind::Http(status) => write!(f, "http status {status}"),
            ErrorKind::Dns => write!(f, "dns failure"),
            ErrorKind::Tls => write!(f, "tls failure"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Unreachable => write!(f, "unreachable"),
            ErrorKind::Malformed => write!(f, "malformed response"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Io => write!(f, "io failure"),
            ErrorKind::AlreadyResolved => write!(f, "already resolved"),
            ErrorKind::InvalidInput => write!(f, "invalid input"),
            ErrorKind::NoEncryption => write!(f, "encryption unavailable"),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            return Error::new(ErrorKind::Timeout, message);
        }
        if err.is_decode() {
            return Error::new(ErrorKind::Malformed, message);
        }

        // reqwest hides the resolver and TLS layers behind its source chain
        let chain = format!("{err:?}").to_lowercase();
        let kind = if chain.contains("dns error") || chain.contains("failed to lookup address") {
            ErrorKind::Dns
        } else if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl")
        {
            ErrorKind::Tls
        } else {
            ErrorKind::Unreachable
        };
        Error::new(kind, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Malformed, err.to_string())
    }
}
