//! `Range` header parsing and bounds resolution.

/// A parsed `Range: bytes=...` header value, before it is checked
/// against an entity size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=start-` or `bytes=start-end`.
    FromTo { start: u64, end: Option<u64> },
    /// `bytes=-len`: the final `len` bytes.
    Suffix { len: u64 },
}

/// An inclusive byte range resolved against a concrete entity size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes the range covers. Never zero; `resolve` guarantees
    /// `start <= end`.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl RangeSpec {
    /// Parses a `Range` header value. Returns `None` for anything that is
    /// not a single well-formed byte range; callers treat that as if the
    /// header were absent.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.strip_prefix("bytes=")?.trim();
        // Multi-range requests are out of scope.
        if spec.contains(',') {
            return None;
        }

        if let Some(len) = spec.strip_prefix('-') {
            let len = len.parse().ok()?;
            return Some(Self::Suffix { len });
        }

        let (start, end) = spec.split_once('-')?;
        let start = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().ok()?)
        };
        Some(Self::FromTo { start, end })
    }

    /// Resolves the spec against an entity of `size` bytes.
    ///
    /// Returns `None` when the resulting range is inverted or out of
    /// bounds; the caller answers 416.
    #[must_use]
    pub fn resolve(&self, size: u64) -> Option<ByteRange> {
        let (start, end) = match *self {
            Self::FromTo { start, end } => (start, end.unwrap_or(size.wrapping_sub(1))),
            Self::Suffix { len } => {
                if len == 0 || len > size {
                    return None;
                }
                (size - len, size - 1)
            }
        };

        if start > end || end >= size {
            return None;
        }
        Some(ByteRange { start, end })
    }
}
