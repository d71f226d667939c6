//! Core HTTP protocol types shared by the codecs, the request context and the
//! dispatchers.
//!
//! - **Message framing** ([`message`]): [`Message`], [`PayloadItem`], [`PayloadSize`]
//! - **Requests** ([`request`]): the parsed [`RequestHeader`] and the
//!   validated, read-only [`RequestInfo`] descriptor handed to handlers
//! - **Responses** ([`response`]): [`ResponseHead`] and status reason phrases
//! - **Errors** ([`error`]): [`HttpError`], [`ParseError`], [`SendError`], [`StreamError`]

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;
pub use request::RequestId;
pub use request::RequestInfo;

mod response;
pub use response::ResponseHead;
pub use response::reason_phrase;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
pub use error::StreamError;
