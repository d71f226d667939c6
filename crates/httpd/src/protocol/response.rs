//! HTTP response head type and status reason phrases.

use http::{Response, StatusCode};

/// Response head before a body is attached: `http::Response<()>`.
pub type ResponseHead = Response<()>;

/// Reason phrase written on the status line.
///
/// Follows the current IANA registry names, which differ from
/// [`StatusCode::canonical_reason`] for a few codes (`413 Content Too Large`,
/// `422 Unprocessable Content`).
pub fn reason_phrase(status: StatusCode) -> &'static str {
    match status.as_u16() {
        413 => "Content Too Large",
        421 => "Misdirected Request",
        422 => "Unprocessable Content",
        425 => "Too Early",
        449 => "Reply With",
        450 => "Blocked by Windows Parental Controls",
        509 => "Bandwidth Limit Exceeded",
        _ => status.canonical_reason().unwrap_or("Unknown"),
    }
}
