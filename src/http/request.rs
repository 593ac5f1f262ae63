//! HTTP/1.1 request parsing.
//!
//! Parses the request line plus the headers the server acts on. The
//! parser is deliberately narrow: it recognizes the method, the request
//! target, the protocol version, and the `Range` header value; all other
//! headers are skipped without interpretation.

use thiserror::Error;

use super::range::RangeSpec;

/// Errors produced while parsing a request head.
///
/// Every variant maps to a 400 response; the distinctions exist for
/// diagnostics, not for the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The request line is missing or not `METHOD SP TARGET SP VERSION`.
    #[error("malformed request line: {0:?}")]
    RequestLine(String),

    /// The protocol version is not `HTTP/1.0` or `HTTP/1.1`.
    #[error("unsupported protocol version: {0:?}")]
    Version(String),

    /// The head is not valid UTF-8.
    #[error("request head is not valid UTF-8")]
    Encoding,
}

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    /// Any syntactically valid method the server does not serve; the
    /// handler answers 405.
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            other => Self::Other(other.to_string()),
        }
    }

    /// The method token as it appeared on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Other(token) => token,
        }
    }
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// The request target exactly as sent, query string included.
    pub target: String,
    /// `Range` header value, already parsed, if one was present and
    /// well-formed. Malformed values are ignored per the serving rules.
    pub range: Option<RangeSpec>,
}

impl Request {
    /// Parses a request head from the bytes read up to (and possibly
    /// including) the blank line.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the head is not ASCII/UTF-8, the
    /// request line does not have three parts, or the version is not an
    /// HTTP/1.x the server speaks.
    pub fn parse(head: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(head).map_err(|_| ParseError::Encoding)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::RequestLine(request_line.to_string()));
        };
        if method.is_empty() || target.is_empty() || parts.next().is_some() {
            return Err(ParseError::RequestLine(request_line.to_string()));
        }
        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return Err(ParseError::Version(version.to_string()));
        }

        let mut range = None;
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("range") {
                    range = RangeSpec::parse(value.trim());
                }
            }
            // Header lines without a colon are tolerated and skipped.
        }

        Ok(Self {
            method: Method::from_token(method),
            target: target.to_string(),
            range,
        })
    }

    /// The target with any query string removed.
    #[must_use]
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_get() {
        let req = Request::parse(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/index.html");
        assert!(req.range.is_none());
    }

    #[test]
    fn test_parse_head() {
        let req = Request::parse(b"HEAD / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Head);
    }

    #[test]
    fn test_parse_http_1_0_accepted() {
        let req = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
    }

    #[test]
    fn test_parse_other_method_preserved() {
        let req = Request::parse(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Other("POST".to_string()));
        assert_eq!(req.method.as_str(), "POST");
    }

    #[test]
    fn test_parse_range_header() {
        let req =
            Request::parse(b"GET /hello.bin HTTP/1.1\r\nRange: bytes=2-4\r\n\r\n").unwrap();
        assert_eq!(req.range, Some(RangeSpec::FromTo { start: 2, end: Some(4) }));
    }

    #[test]
    fn test_parse_range_header_case_insensitive() {
        let req = Request::parse(b"GET /f HTTP/1.1\r\nrAnGe: bytes=0-\r\n\r\n").unwrap();
        assert_eq!(req.range, Some(RangeSpec::FromTo { start: 0, end: None }));
    }

    #[test]
    fn test_parse_malformed_range_ignored() {
        let req = Request::parse(b"GET /f HTTP/1.1\r\nRange: lines=2-4\r\n\r\n").unwrap();
        assert!(req.range.is_none());
    }

    #[test]
    fn test_parse_missing_parts_rejected() {
        assert!(matches!(
            Request::parse(b"GET /index.html\r\n\r\n"),
            Err(ParseError::RequestLine(_))
        ));
        assert!(matches!(
            Request::parse(b"\r\n\r\n"),
            Err(ParseError::RequestLine(_))
        ));
    }

    #[test]
    fn test_parse_extra_parts_rejected() {
        assert!(matches!(
            Request::parse(b"GET / HTTP/1.1 extra\r\n\r\n"),
            Err(ParseError::RequestLine(_))
        ));
    }

    #[test]
    fn test_parse_bad_version_rejected() {
        assert!(matches!(
            Request::parse(b"GET / HTTP/2.0\r\n\r\n"),
            Err(ParseError::Version(_))
        ));
        assert!(matches!(
            Request::parse(b"GET / SPDY\r\n\r\n"),
            Err(ParseError::Version(_))
        ));
    }

    #[test]
    fn test_parse_non_utf8_rejected() {
        assert_eq!(
            Request::parse(b"GET /\xff\xfe HTTP/1.1\r\n\r\n"),
            Err(ParseError::Encoding)
        );
    }

    #[test]
    fn test_path_strips_query() {
        let req = Request::parse(b"GET /style.css?v=3 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.target, "/style.css?v=3");
        assert_eq!(req.path(), "/style.css");
    }

    #[test]
    fn test_path_without_query_unchanged() {
        let req = Request::parse(b"GET /style.css HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/style.css");
    }
}
