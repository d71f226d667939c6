use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("config error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("daemon is already started")]
    AlreadyStarted,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl HttpError {
    pub fn bind<S: ToString>(addr: S, source: io::Error) -> Self {
        Self::Bind { addr: addr.to_string(), source }
    }
}

/// Errors raised while turning raw bytes into a request descriptor.
///
/// Every variant maps to the status code sent back to the client, see
/// [`ParseError::status`].
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("unsupported http method '{0}'")]
    UnsupportedMethod(String),

    #[error("invalid http uri")]
    InvalidUri,

    #[error("request url is too long, limit is {max_len}")]
    UriTooLong { max_len: usize },

    #[error("unsafe url containing '..' components")]
    ForbiddenPath,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("unsupported transfer-encoding '{0}'")]
    UnsupportedTransferEncoding(String),

    #[error("malformed cookie: {reason}")]
    InvalidCookie { reason: String },

    #[error("too many cookies, server limit is {max_num}")]
    TooManyCookies { max_num: usize },

    #[error("missing expected {header} address header")]
    MissingClientAddress { header: &'static str },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_cookie<S: ToString>(str: S) -> Self {
        Self::InvalidCookie { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status code answered to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TooLargeHeader { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TooManyHeaders { .. } | Self::TooManyCookies { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::InvalidVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Self::UnsupportedMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::UriTooLong { .. } => StatusCode::URI_TOO_LONG,
            Self::ForbiddenPath => StatusCode::FORBIDDEN,
            Self::UnsupportedTransferEncoding(_) => StatusCode::NOT_IMPLEMENTED,
            Self::InvalidHeader { .. }
            | Self::InvalidMethod
            | Self::InvalidUri
            | Self::InvalidContentLength { .. }
            | Self::InvalidCookie { .. }
            | Self::MissingClientAddress { .. }
            | Self::InvalidBody { .. }
            | Self::Io { .. } => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Failure of a blocking body transfer on a request context.
///
/// These are the hard-error sentinels returned by `read` and `write`: they are
/// never panics, the connection is torn down by the dispatcher instead.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("connection aborted")]
    Aborted,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("request body exceeds limit of {max} bytes")]
    TooLarge { max: u64 },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl StreamError {
    pub fn protocol<S: ToString>(str: S) -> Self {
        Self::Protocol { reason: str.to_string() }
    }
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io { source } => source,
            StreamError::Aborted => io::Error::new(io::ErrorKind::ConnectionAborted, e),
            StreamError::ShuttingDown => io::Error::new(io::ErrorKind::Interrupted, e),
            StreamError::TooLarge { .. } | StreamError::Protocol { .. } => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}
