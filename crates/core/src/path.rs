//! Stream path resolution and stream URI construction.
//!
//! The path used to request the RTSP stream comes from three candidates,
//! highest precedence first:
//!
//! 1. the user override stored on the bookmark (when non-empty),
//! 2. the `rtsp-path` advertised in the device's service descriptor,
//! 3. [`DEFAULT_STREAM_PATH`].
//!
//! ```
//! use edge_video::path::{resolve, DEFAULT_STREAM_PATH};
//!
//! assert_eq!(resolve(Some("/cam1"), Some("/live"), DEFAULT_STREAM_PATH), "/cam1");
//! assert_eq!(resolve(Some(""), Some("/live"), DEFAULT_STREAM_PATH), "/live");
//! assert_eq!(resolve(None, None, DEFAULT_STREAM_PATH), "/video");
//! ```

use std::fmt;

pub const DEFAULT_STREAM_PATH: &str = "/video";

/// Address the local tunnel endpoint listens on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Effective stream path. The user override is returned verbatim.
pub fn resolve(user_override: Option<&str>, device_path: Option<&str>, default_path: &str) -> String {
    match user_override {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => placeholder_path(device_path, default_path),
    }
}

/// Path that would be used without a user override (placeholder text).
pub fn placeholder_path(device_path: Option<&str>, default_path: &str) -> String {
    device_path.unwrap_or(default_path).to_string()
}

/// Trim whitespace and prepend `/` if missing.
///
/// `"video"` → `"/video"`, `" /video "` → `"/video"`, `""` → `"/"`
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// An RTSP URI pointing at the local end of a tunnel.
///
/// Renders as `rtsp://[user:pass@]host:port/path`. Credentials are only
/// included when the username is non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUri {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub username: String,
    pub password: String,
}

impl StreamUri {
    /// URI for a tunnel listening on [`LOOPBACK_HOST`].
    pub fn local(port: u16, path: &str) -> Self {
        Self {
            host: LOOPBACK_HOST.to_string(),
            port,
            path: normalize_path(path),
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_credentials(mut self, username: Option<&str>, password: Option<&str>) -> Self {
        self.username = username.unwrap_or_default().to_string();
        self.password = password.unwrap_or_default().to_string();
        self
    }

    /// `user:pass@`, or an empty string without a username.
    pub fn auth_prefix(&self) -> String {
        if self.username.is_empty() {
            String::new()
        } else {
            format!("{}:{}@", self.username, self.password)
        }
    }
}

impl fmt::Display for StreamUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rtsp://{}{}:{}{}",
            self.auth_prefix(),
            self.host,
            self.port,
            self.path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn user_override_wins() {
        assert_eq!(resolve(Some("/mine"), Some("/dev"), "/video"), "/mine");
    }

    #[test]
    fn user_override_not_normalized() {
        assert_eq!(resolve(Some(" cam "), None, "/video"), " cam ");
    }

    #[test]
    fn empty_override_falls_through() {
        assert_eq!(resolve(Some(""), Some("/dev"), "/video"), "/dev");
        assert_eq!(resolve(Some(""), None, "/video"), "/video");
    }

    #[test]
    fn placeholder_ignores_override() {
        assert_eq!(placeholder_path(Some("/dev"), "/video"), "/dev");
        assert_eq!(placeholder_path(None, "/video"), "/video");
    }

    #[test]
    fn normalize_inserts_slash() {
        assert_eq!(normalize_path("stream"), "/stream");
        assert_eq!(normalize_path("  stream\n"), "/stream");
        assert_eq!(normalize_path("/stream"), "/stream");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn normalize_keeps_existing_slashes() {
        assert_eq!(normalize_path("/stream"), "/stream");
        assert_eq!(normalize_path(" //stream"), "//stream");
    }

    #[test]
    fn uri_without_credentials() {
        let uri = StreamUri::local(4321, "/stream").with_credentials(Some(""), Some("x"));
        assert_eq!(uri.to_string(), "rtsp://127.0.0.1:4321/stream");
    }

    #[test]
    fn uri_with_credentials() {
        let uri = StreamUri::local(4321, "/stream").with_credentials(Some("bob"), Some("x"));
        assert_eq!(uri.to_string(), "rtsp://bob:x@127.0.0.1:4321/stream");
    }

    #[test]
    fn uri_username_without_password() {
        let uri = StreamUri::local(554, "live").with_credentials(Some("bob"), None);
        assert_eq!(uri.to_string(), "rtsp://bob:@127.0.0.1:554/live");
    }

    proptest! {
        #[test]
        fn resolve_precedence(
            user in proptest::option::of(".{0,12}"),
            device in proptest::option::of(".{0,12}"),
            default in ".{0,12}",
        ) {
            let resolved = resolve(user.as_deref(), device.as_deref(), &default);
            let expected = match (&user, &device) {
                (Some(u), _) if !u.is_empty() => u.clone(),
                (_, Some(d)) => d.clone(),
                _ => default.clone(),
            };
            prop_assert_eq!(resolved, expected);
        }

        #[test]
        fn normalize_is_idempotent(path in "[ a-z/]{0,16}") {
            let once = normalize_path(&path);
            prop_assert!(once.starts_with('/'));
            prop_assert_eq!(normalize_path(&once), once.clone());
        }

        #[test]
        fn normalize_prepends_one_slash(path in "[a-z][a-z/]{0,15}") {
            prop_assert_eq!(normalize_path(&path), format!("/{path}"));
        }
    }
}
