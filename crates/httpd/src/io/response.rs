//! Fully buffered responses and the helpers building their header values.

use std::fmt::Write as _;
use std::fs::File;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Response, StatusCode, Version, header};
use tracing::error;

use crate::protocol::{PayloadSize, ResponseHead, reason_phrase};

/// Body of an attached response.
#[derive(Debug, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Bytes(Bytes),
    File { file: File, len: u64 },
}

impl ResponseBody {
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A response ready to be written by a dispatcher.
#[derive(Debug)]
pub struct PreparedResponse {
    pub head: ResponseHead,
    pub body: ResponseBody,
    /// Send the head only, with the real `Content-Length`.
    pub headers_only: bool,
}

impl PreparedResponse {
    pub fn payload_size(&self) -> PayloadSize {
        PayloadSize::new_length(self.body.len())
    }

    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    /// A `text/plain` error page for requests that never reach a handler.
    /// The connection is closed after it.
    pub fn error(status: StatusCode, version: Version, details: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

        Self {
            head: build_head(status, version, headers, false),
            body: ResponseBody::Bytes(Bytes::from(error_text(status, details))),
            headers_only: false,
        }
    }
}

/// Builds a response head echoing the request version.
pub(crate) fn build_head(status: StatusCode, version: Version, headers: HeaderMap, keepalive: bool) -> ResponseHead {
    let mut head = Response::new(());
    *head.status_mut() = status;
    *head.version_mut() = if version == Version::HTTP_10 { Version::HTTP_10 } else { Version::HTTP_11 };
    *head.headers_mut() = headers;

    let connection = if keepalive { "keep-alive" } else { "close" };
    head.headers_mut().insert(header::CONNECTION, HeaderValue::from_static(connection));
    head
}

/// Body of an error page: `Error {code}: {reason}` then the details line.
pub(crate) fn error_text(status: StatusCode, details: &str) -> String {
    format!("Error {}: {}\n{details}", status.as_u16(), reason_phrase(status))
}

/// `Set-Cookie` value; a `None` value expires the cookie.
pub(crate) fn cookie_value(path: &str, name: &str, value: Option<&str>, http_only: bool, secure: bool) -> Option<HeaderValue> {
    let mut buf = match value {
        Some(value) => format!("{name}={value}; Path={path};"),
        None => format!("{name}=; Path={path}; Max-Age=0;"),
    };

    buf.push_str(" SameSite=Strict;");
    if http_only {
        buf.push_str(" HttpOnly;");
    }
    if secure {
        buf.push_str(" Secure;");
    }

    HeaderValue::try_from(buf).map_err(|e| error!(cookie = name, cause = %e, "invalid cookie header")).ok()
}

/// `Cache-Control` value: `max-age` in whole seconds, `no-store` when zero.
pub(crate) fn cache_control_value(max_age: Duration) -> HeaderValue {
    if max_age.is_zero() {
        return HeaderValue::from_static("no-store");
    }

    let mut buf = String::with_capacity(24);
    let _ = write!(buf, "max-age={}", max_age.as_secs());
    HeaderValue::try_from(buf).unwrap_or_else(|_| HeaderValue::from_static("no-store"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_values() {
        let set = cookie_value("/", "session", Some("abc"), true, false).unwrap();
        assert_eq!(set, "session=abc; Path=/; SameSite=Strict; HttpOnly;");

        let delete = cookie_value("/app", "session", None, false, true).unwrap();
        assert_eq!(delete, "session=; Path=/app; Max-Age=0; SameSite=Strict; Secure;");
    }

    #[test]
    fn cache_control() {
        assert_eq!(cache_control_value(Duration::ZERO), "no-store");
        assert_eq!(cache_control_value(Duration::from_secs(3600)), "max-age=3600");
    }

    #[test]
    fn error_page() {
        assert_eq!(error_text(StatusCode::NOT_FOUND, "no such page"), "Error 404: Not Found\nno such page");
        assert_eq!(error_text(StatusCode::PAYLOAD_TOO_LARGE, ""), "Error 413: Content Too Large\n");
    }

    #[test]
    fn head_connection_header() {
        let head = build_head(StatusCode::OK, Version::HTTP_10, HeaderMap::new(), false);
        assert_eq!(head.version(), Version::HTTP_10);
        assert_eq!(head.headers()[header::CONNECTION], "close");
    }

    #[test]
    fn error_response_closes() {
        let resp = PreparedResponse::error(StatusCode::SERVICE_UNAVAILABLE, Version::HTTP_11, "Server is shutting down");
        assert_eq!(resp.head.headers()[header::CONNECTION], "close");
        assert_eq!(resp.payload_size(), PayloadSize::Length(resp.body.len()));
        assert!(!resp.headers_only);
    }
}
