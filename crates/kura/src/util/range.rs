use serde::{Deserialize, Serialize};

use crate::error::{KuraError, KuraResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    pub fn to_http_range(&self) -> String {
        if let Some(length) = self.length {
            format!("bytes={}-{}", self.offset, self.offset + length - 1)
        } else {
            format!("bytes={}-", self.offset)
        }
    }

    /// The range left to fetch after `received` bytes of this range already arrived.
    pub fn skip(&self, received: u64) -> Self {
        Self {
            offset: self.offset + received,
            length: self.length.map(|length| length.saturating_sub(received)),
        }
    }

    /// Parses an RFC 7233 byte-range-spec such as `0-499`.
    pub fn parse_spec<S>(s: S) -> KuraResult<Self>
    where
        S: AsRef<str>,
    {
        let invalid = || KuraError::ManifestParseError(format!("Invalid byte range {}", s.as_ref()));
        let (start, end) = s.as_ref().split_once('-').ok_or_else(invalid)?;

        let first_byte_pos = start.trim().parse::<u64>().map_err(|_| invalid())?;
        let last_byte_pos = end.trim().parse::<u64>().ok();
        if matches!(last_byte_pos, Some(last) if last < first_byte_pos) {
            return Err(invalid());
        }

        Ok(Self {
            offset: first_byte_pos,
            // 0 - 500 means 501 bytes
            length: last_byte_pos.map(|last_byte_pos| last_byte_pos - first_byte_pos + 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_http_range() {
        let range = ByteRange::new(10, Some(10));
        assert_eq!(range.to_http_range(), "bytes=10-19");

        let range = ByteRange::new(10, None);
        assert_eq!(range.to_http_range(), "bytes=10-");
    }

    #[test]
    fn test_skip_received() {
        let range = ByteRange::new(100, Some(50)).skip(20);
        assert_eq!(range, ByteRange::new(120, Some(30)));

        let range = ByteRange::new(0, None).skip(7);
        assert_eq!(range.to_http_range(), "bytes=7-");
    }

    #[test]
    fn test_parse_spec() {
        assert_eq!(
            ByteRange::parse_spec("0-499").unwrap(),
            ByteRange::new(0, Some(500))
        );
        assert_eq!(
            ByteRange::parse_spec("863-").unwrap(),
            ByteRange::new(863, None)
        );
        assert!(ByteRange::parse_spec("500-10").is_err());
        assert!(ByteRange::parse_spec("abc").is_err());
    }
}
