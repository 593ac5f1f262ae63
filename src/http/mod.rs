//! HTTP/1.1 wire utilities: request parsing, range handling, response
//! framing, and the content-type table.
//!
//! Only the subset of HTTP/1.1 the server speaks is implemented: GET and
//! HEAD, a single `Range` header, and `Connection: close` responses.

mod mime;
mod range;
mod request;
mod response;

pub use mime::content_type_for;
pub use range::{ByteRange, RangeSpec};
pub use request::{Method, ParseError, Request};
pub use response::{ResponseHead, error_page, reason_phrase};
