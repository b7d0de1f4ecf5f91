//! HTTP sessions for the transport queue.
//!
//! This module provides the [`MatrixNet`] struct which executes [`Request`]s
//! against the homeserver and converts the responses into JSON values or
//! typed errors.

use std::{path::Path, time::Duration};

use log::{debug, trace};
use reqwest::{
    Client, Method, RequestBuilder, Response, StatusCode, Url,
    header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER},
};
use serde_json::{Map, Value};
use tokio::sync::{RwLock, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::{
    matrix::{Error, ErrorKind, Secret},
    transport::{Priority, Request},
};

const USER_AGENT: &str = concat!("mxlink/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// HTTP client for the Matrix client-server API.
///
/// Requests are spread over two lanes: `Priority::High` requests (the sync
/// long-poll) use a lane of their own, every other request shares the
/// remaining connections. No request is ever retried here.
///
/// # Examples
///
/// ```no_run
/// use mxlink::transport::{MatrixNet, Request};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), mxlink::matrix::Error> {
/// let net = MatrixNet::new(4)?;
/// net.set_homeserver("https://matrix.example.org").await?;
/// let rooms = net
///     .send(Request::get(&["joined_rooms"]), &CancellationToken::new())
///     .await?;
/// println!("{rooms}");
/// # Ok(())
/// # }
/// ```
pub struct MatrixNet {
    /// HTTP client, shared by every request of the session
    client: Client,
    /// Base URL requests are joined against
    homeserver: RwLock<Option<Url>>,
    /// Bearer token attached to every request once set
    access_token: RwLock<Option<Secret>>,
    /// Lane of ordinary requests
    default_lane: Semaphore,
    /// Lane of `Priority::High` requests
    high_lane: Semaphore,
}

impl MatrixNet {
    /// Creates a transport allowing at most `max_connections` concurrent requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built (TLS backend failure).
    pub fn new(max_connections: usize) -> Result<Self, Error> {
        let max_connections = max_connections.max(2);
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .pool_max_idle_per_host(max_connections)
            .build()?;

        Ok(MatrixNet {
            client,
            homeserver: RwLock::new(None),
            access_token: RwLock::new(None),
            default_lane: Semaphore::new(max_connections - 1),
            high_lane: Semaphore::new(1),
        })
    }

    /// Sets the base URL requests are joined against.
    pub async fn set_homeserver(&self, homeserver: &str) -> Result<(), Error> {
        let url = Url::parse(homeserver).map_err(|e| {
            Error::invalid_input(format!("invalid homeserver url {homeserver}: {e}"))
        })?;
        if url.cannot_be_a_base() {
            return Err(Error::invalid_input(format!(
                "homeserver url {homeserver} cannot be a base"
            )));
        }
        *self.homeserver.write().await = Some(url);
        Ok(())
    }

    /// Sets or clears the access token. The previous token is zeroized.
    pub async fn set_access_token(&self, access_token: Option<Secret>) {
        *self.access_token.write().await = access_token;
    }

    pub async fn has_access_token(&self) -> bool {
        self.access_token.read().await.is_some()
    }

    /// Sends a request and parses the JSON response.
    ///
    /// The access token, if any, is attached as a bearer credential. A body
    /// carrying a Matrix `errcode` is turned into an [`Error`]; for
    /// `M_LIMIT_EXCEEDED` the `retry_after_ms` hint is attached.
    ///
    /// # Errors
    ///
    /// Connection, TLS and timeout failures, cancellation through `cancel`,
    /// non-JSON bodies and Matrix error bodies.
    pub async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Value, Error> {
        let url = self.request_url(&request).await?;
        debug!("{} {}", request.method, request.path());

        let mut builder = self.authorized(self.client.request(request.method.clone(), url)).await;
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let value = self.execute(builder, request.priority, cancel).await?;
        trace!("response from {} -> {}", request.path(), value);
        Ok(value)
    }

    /// Fetches `/.well-known/matrix/client` of `server_name`.
    ///
    /// Discovery goes over https unless `insecure` is set.
    pub async fn discover(
        &self,
        server_name: &str,
        insecure: bool,
        cancel: &CancellationToken,
    ) -> Result<Value, Error> {
        let scheme = if insecure { "http" } else { "https" };
        let url = Url::parse(&format!("{scheme}://{server_name}/.well-known/matrix/client"))
            .map_err(|e| Error::invalid_input(format!("invalid server name {server_name}: {e}")))?;
        debug!("discover homeserver at {}", url);

        self.execute(self.client.get(url), Priority::Default, cancel)
            .await
    }

    /// Uploads a file to the media repository and returns the response
    /// (`{"content_uri": "mxc://..."}`).
    pub async fn upload(
        &self,
        path: &Path,
        content_type: &mime::Mime,
        cancel: &CancellationToken,
    ) -> Result<Value, Error> {
        let bytes = tokio::fs::read(path).await?;
        let mut request = Request::new(Method::POST, &["_matrix", "media", "v3", "upload"]);
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            request = request.query("filename", name);
        }
        let url = self.request_url(&request).await?;
        debug!("upload {} ({} bytes)", path.display(), bytes.len());

        let builder = self
            .authorized(self.client.post(url))
            .await
            .header(CONTENT_TYPE, content_type.as_ref())
            .body(bytes);
        self.execute(builder, Priority::Default, cancel).await
    }

    pub(crate) fn http_client(&self) -> &Client {
        &self.client
    }

    /// Joins a request's path and query against the homeserver.
    pub(crate) async fn request_url(&self, request: &Request) -> Result<Url, Error> {
        let Some(mut url) = self.homeserver.read().await.clone() else {
            return Err(Error::new(ErrorKind::NoHomeserver, "homeserver is not set"));
        };

        url.path_segments_mut()
            .map_err(|_| Error::invalid_input("homeserver url cannot be a base"))?
            .clear()
            .extend(request.segments.iter());
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }

    pub(crate) async fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.access_token.read().await.as_ref() {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        }
    }

    /// Waits for a free connection on the lane of `priority`.
    pub(crate) async fn acquire(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<SemaphorePermit<'_>, Error> {
        let lane = match priority {
            Priority::Default => &self.default_lane,
            Priority::High => &self.high_lane,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled()),
            permit = lane.acquire() => permit.map_err(|_| Error::cancelled()),
        }
    }

    /// Sends a built request on its lane and returns the raw response.
    pub(crate) async fn respond(
        &self,
        builder: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled()),
            response = builder.send() => Ok(response?),
        }
    }

    async fn execute(
        &self,
        builder: RequestBuilder,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<Value, Error> {
        let _permit = self.acquire(priority, cancel).await?;
        let response = self.respond(builder, cancel).await?;
        read_json(response, cancel).await
    }
}

/// Reads a whole response body and parses it with [`parse_response`].
pub(crate) async fn read_json(
    response: Response,
    cancel: &CancellationToken,
) -> Result<Value, Error> {
    let status = response.status();
    let retry_after = retry_after_header(response.headers());
    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::cancelled()),
        body = response.bytes() => body?,
    };
    parse_response(status, retry_after, &body)
}

/// Reads a `Retry-After` header given in seconds.
fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Converts a response into a JSON value or a typed error.
///
/// A JSON object with an `errcode` is always an error, whatever the status.
/// An empty successful body is read as `{}`.
pub(crate) fn parse_response(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &[u8],
) -> Result<Value, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        if status.is_success() {
            return Ok(Value::Object(Map::new()));
        }
        return Err(http_error(status));
    }

    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) if status.is_success() => {
            return Err(Error::malformed(format!("invalid json response: {e}")));
        }
        Err(_) => return Err(http_error(status)),
    };

    if let Some(errcode) = value.get("errcode").and_then(Value::as_str) {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or(errcode);
        let mut error = Error::from_errcode(errcode, message);
        if error.kind() == &ErrorKind::LimitExceeded {
            let hint = value
                .get("retry_after_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis)
                .or(retry_after);
            if let Some(hint) = hint {
                error = error.with_retry_after(hint);
            }
        }
        return Err(error);
    }

    if !status.is_success() {
        return Err(http_error(status));
    }
    Ok(value)
}

fn http_error(status: StatusCode) -> Error {
    let kind = match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::LimitExceeded,
        _ => ErrorKind::Http(status.as_u16()),
    };
    Error::new(kind, format!("unexpected status {status}"))
}
