//! HTTP request head and the read-only request descriptor handed to handlers.
//!
//! [`RequestHeader`] wraps the `http::Request<()>` produced by the header codec.
//! [`RequestInfo`] is built from it once the request head passed validation:
//! method mapping (`HEAD` becomes `GET` with `headers_only`), path decoding,
//! keep-alive negotiation, cookie splitting and client address resolution.

use std::fmt;

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version, header};

use crate::config::{ClientAddressMode, HttpConfig};
use crate::connection::{ConnectionId, PeerAddr};
use crate::ensure;
use crate::protocol::{ParseError, PayloadSize};

#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether the client asked for `100 Continue` before sending its body.
    pub fn expects_continue(&self) -> bool {
        self.headers().get(header::EXPECT).is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

/// Identifies one request: the connection it arrived on plus its position on
/// that connection. Used as a logging field instead of global counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    conn: ConnectionId,
    seq: u64,
}

impl RequestId {
    pub fn new(conn: ConnectionId, seq: u64) -> Self {
        Self { conn, seq }
    }

    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conn, self.seq)
    }
}

const SUPPORTED_METHODS: [Method; 6] = [Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS];

/// Read-only request descriptor given to the handler.
#[derive(Debug)]
pub struct RequestInfo {
    id: RequestId,
    method: Method,
    version: Version,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    cookies: Vec<(String, String)>,
    client_addr: String,
    headers_only: bool,
    keepalive: bool,
    body_size: PayloadSize,
}

impl RequestInfo {
    /// Validates a parsed request head and builds the descriptor.
    pub(crate) fn new(
        id: RequestId,
        header: RequestHeader,
        body_size: PayloadSize,
        peer: &PeerAddr,
        config: &HttpConfig,
    ) -> Result<Self, ParseError> {
        let (parts, ()) = header.into_inner().into_parts();

        let (method, headers_only) = match parts.method {
            Method::HEAD => (Method::GET, true),
            m if SUPPORTED_METHODS.contains(&m) => (m, false),
            m => return Err(ParseError::UnsupportedMethod(m.to_string())),
        };

        ensure!(parts.uri.scheme().is_none() && parts.uri.path().starts_with('/'), ParseError::InvalidUri);
        let url_len = parts.uri.path_and_query().map_or(0, |pq| pq.as_str().len());
        ensure!(url_len <= config.max_url_len, ParseError::UriTooLong { max_len: config.max_url_len });

        let path = decode_path(parts.uri.path()).ok_or(ParseError::InvalidUri)?;
        ensure!(!path.split('/').any(|segment| segment == ".."), ParseError::ForbiddenPath);
        let query = parts.uri.query().map(str::to_owned);

        if method == Method::GET {
            ensure!(
                body_size.is_empty(),
                ParseError::invalid_content_length("refusing to process GET request with body")
            );
        }

        let cookies = parse_cookies(&parts.headers, config.max_request_cookies)?;
        let client_addr = resolve_client_addr(config.addr_mode, peer, &parts.headers)?;
        let keepalive = wants_keepalive(parts.version, &parts.headers);

        Ok(Self {
            id,
            method,
            version: parts.version,
            path,
            query,
            headers: parts.headers,
            cookies,
            client_addr,
            headers_only,
            keepalive,
            body_size,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Percent-decoded request path, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header<K: header::AsHeaderName>(&self, key: K) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn client_addr(&self) -> &str {
        &self.client_addr
    }

    /// True for `HEAD` requests: the response carries headers only.
    pub fn headers_only(&self) -> bool {
        self.headers_only
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn body_size(&self) -> PayloadSize {
        self.body_size
    }

    pub(crate) fn disable_keepalive(&mut self) {
        self.keepalive = false;
    }
}

fn wants_keepalive(version: Version, headers: &HeaderMap) -> bool {
    let mut keepalive = version == Version::HTTP_11;
    for value in headers.get_all(header::CONNECTION) {
        for token in value.as_bytes().split(|b| *b == b',').map(<[u8]>::trim_ascii) {
            if token.eq_ignore_ascii_case(b"close") {
                return false;
            }
            if token.eq_ignore_ascii_case(b"keep-alive") {
                keepalive = true;
            }
        }
    }
    keepalive
}

fn parse_cookies(headers: &HeaderMap, max_cookies: usize) -> Result<Vec<(String, String)>, ParseError> {
    let mut cookies = Vec::new();

    for value in headers.get_all(header::COOKIE) {
        let value = value.to_str().map_err(|_| ParseError::invalid_cookie("value is not visible ascii"))?;

        for pair in value.split(';').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = name.trim();

            ensure!(!name.is_empty() && name.bytes().all(is_token_char), ParseError::invalid_cookie(format!("bad name '{name}'")));
            ensure!(cookies.len() < max_cookies, ParseError::TooManyCookies { max_num: max_cookies });

            cookies.push((name.to_owned(), value.trim().to_owned()));
        }
    }

    Ok(cookies)
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Resolves the client address according to the configured mode.
pub(crate) fn resolve_client_addr(mode: ClientAddressMode, peer: &PeerAddr, headers: &HeaderMap) -> Result<String, ParseError> {
    let (name, value) = match mode {
        ClientAddressMode::Socket => return Ok(peer.to_string()),
        ClientAddressMode::XForwardedFor => {
            ("X-Forwarded-For", headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).and_then(|v| v.split(',').next()))
        }
        ClientAddressMode::XRealIp => ("X-Real-IP", headers.get("x-real-ip").and_then(|v| v.to_str().ok())),
    };

    match value.map(str::trim) {
        Some(addr) if !addr.is_empty() => Ok(addr.to_owned()),
        _ => Err(ParseError::MissingClientAddress { header: name }),
    }
}

/// Percent-decodes a request path. Returns `None` on malformed escapes or
/// when the result is not UTF-8.
fn decode_path(path: &str) -> Option<String> {
    if !path.contains('%') {
        return Some(path.to_owned());
    }

    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).ok()
}
