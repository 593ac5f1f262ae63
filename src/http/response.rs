//! Response framing.
//!
//! Every response the server emits carries the same fixed header set:
//! `Server`, `Date` (RFC 7231, GMT), `Content-Type`, `Content-Length`,
//! and `Connection: close`. Partial-content responses add
//! `Content-Range`. Error responses carry a fixed HTML body.

use std::time::SystemTime;

use super::range::ByteRange;

/// Server token sent on every response.
pub const SERVER_TOKEN: &str = concat!("staticserv/", env!("CARGO_PKG_VERSION"));

/// Reason phrase for the status codes the server emits.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Fixed HTML error page with the numeric status and reason phrase.
#[must_use]
pub fn error_page(status: u16) -> String {
    let reason = reason_phrase(status);
    format!(
        "<html>\r\n\
         <head><title>{status} {reason}</title></head>\r\n\
         <body>\r\n\
         <center><h1>{status} {reason}</h1></center>\r\n\
         <hr><center>{SERVER_TOKEN}</center>\r\n\
         </body>\r\n\
         </html>\r\n"
    )
}

/// The head of an outgoing response, one status line plus the fixed
/// header set, ready to be written before the body bytes.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: String,
    /// Value of `Content-Length`: the full entity size, or the range
    /// length for 206.
    pub content_length: u64,
    /// Present only on 206 responses.
    pub content_range: Option<(ByteRange, u64)>,
}

impl ResponseHead {
    /// A head for a full-entity response.
    #[must_use]
    pub fn new(status: u16, content_type: &str, content_length: u64) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            content_length,
            content_range: None,
        }
    }

    /// A head for a 206 partial-content response over `range` of an
    /// entity of `size` bytes.
    #[must_use]
    pub fn partial(content_type: &str, range: ByteRange, size: u64) -> Self {
        Self {
            status: 206,
            content_type: content_type.to_string(),
            content_length: range.byte_len(),
            content_range: Some((range, size)),
        }
    }

    /// Serializes the status line and headers, terminated by the blank
    /// line.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
             Server: {SERVER_TOKEN}\r\n\
             Date: {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n",
            self.status,
            reason_phrase(self.status),
            httpdate::fmt_http_date(SystemTime::now()),
            self.content_type,
            self.content_length,
        );
        if let Some((range, size)) = &self.content_range {
            head.push_str(&format!(
                "Content-Range: bytes {}-{}/{size}\r\n",
                range.start, range.end
            ));
        }
        head.push_str("Connection: close\r\n\r\n");
        head
    }
}
