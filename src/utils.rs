//! Utility functions for homeserver URLs, media references and paths.

use std::path::PathBuf;

use reqwest::Url;

/// Normalizes a homeserver URL to `scheme://host[:port]`.
///
/// The port is kept only when it is not the default one of the scheme (80 for
/// `http`, 443 for `https`). Path, query and fragment are discarded. A value
/// without a scheme is read as `https`.
///
/// # Returns
///
/// `None` if the value is not an http(s) URL with a host.
///
/// # Examples
///
/// ```
/// use mxlink::utils::normalize_homeserver;
///
/// assert_eq!(
///     normalize_homeserver("https://example.com:443/").as_deref(),
///     Some("https://example.com")
/// );
/// assert_eq!(
///     normalize_homeserver("http://example.com:8008").as_deref(),
///     Some("http://example.com:8008")
/// );
/// ```
pub fn normalize_homeserver(value: &str) -> Option<String> {
    let value = value.trim();
    let url = if value.contains("://") {
        Url::parse(value).ok()?
    } else {
        Url::parse(&format!("https://{value}")).ok()?
    };

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let host = url.host_str().filter(|host| !host.is_empty())?;

    // Url drops the port when it is the scheme default
    match url.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

/// Splits an `mxc://server/media_id` reference into its server and media id.
///
/// Both parts end up as file names below the download directory, so only
/// host name characters are accepted for the server and `[A-Za-z0-9_-]` for
/// the media id.
///
/// # Examples
///
/// ```
/// use mxlink::utils::parse_mxc;
///
/// assert_eq!(parse_mxc("mxc://example.org/abc"), Some(("example.org", "abc")));
/// assert_eq!(parse_mxc("mxc://../evil"), None);
/// ```
pub fn parse_mxc(uri: &str) -> Option<(&str, &str)> {
    let (server, media_id) = uri.strip_prefix("mxc://")?.split_once('/')?;
    if !is_server_name(server) || !is_media_id(media_id) {
        return None;
    }
    Some((server, media_id))
}

fn is_server_name(server: &str) -> bool {
    !server.is_empty()
        && server != "."
        && server != ".."
        && server
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}

fn is_media_id(media_id: &str) -> bool {
    !media_id.is_empty()
        && media_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// Constructs a file system path by joining a directory path with a subdirectory.
///
/// # Examples
///
/// ```
/// # use mxlink::utils::get_path;
/// let path = get_path("/home/user", "session");
/// # #[cfg(unix)]
/// assert_eq!(path, std::path::PathBuf::from("/home/user/session"));
/// ```
pub fn get_path(dir_path: &str, subdir_path: &str) -> PathBuf {
    [dir_path, subdir_path].iter().collect()
}
