//! Line framing for network transport
//!
//! Every frame is one `\n`-terminated line. Lines are kept as raw bytes so
//! the relay can retransmit them untouched and a line that is not valid
//! UTF-8 only costs that line, not the connection.

use bytes::{BufMut, Bytes, BytesMut};
use partynet_core::WireLine;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum line size (1 MiB, excluding the terminator)
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Line too large: {0} bytes (max {MAX_LINE_SIZE})")]
    TooLarge(usize),
    #[error("Line contains a terminator")]
    EmbeddedTerminator,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Decode error: {0}")]
    Decode(#[from] partynet_core::Error),
}

/// Codec for newline-delimited frames
///
/// Decoding strips the `\n` terminator and a preceding `\r` if present. At
/// end of stream a trailing unterminated line is still yielded.
pub struct LineCodec {
    /// Maximum accepted line length
    max_len: usize,
    /// Where to resume the terminator scan
    next_index: usize,
}

impl LineCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::with_max_len(MAX_LINE_SIZE)
    }

    /// Create codec with a custom line limit
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len,
            next_index: 0,
        }
    }

    fn finish_line(mut line: BytesMut) -> Bytes {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        line.freeze()
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A line of exactly max_len bytes still has its terminator within reach
        let scan_to = src.len().min(self.max_len + 1);
        let found = src[self.next_index..scan_to]
            .iter()
            .position(|b| *b == b'\n');

        match found {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;
                let mut line = src.split_to(end + 1);
                line.truncate(end);
                Ok(Some(Self::finish_line(line)))
            }
            None if src.len() > self.max_len => Err(FrameError::TooLarge(src.len())),
            None => {
                self.next_index = scan_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        self.next_index = 0;
        let line = src.split_to(src.len());
        Ok(Some(Self::finish_line(line)))
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_len {
            return Err(FrameError::TooLarge(item.len()));
        }
        if item.contains(&b'\n') {
            return Err(FrameError::EmbeddedTerminator);
        }

        dst.reserve(item.len() + 1);
        dst.put_slice(&item);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Decode one framed line. Empty lines yield `None`.
pub fn parse_line(line: &[u8]) -> Result<Option<WireLine>, FrameError> {
    if line.is_empty() {
        return Ok(None);
    }
    let text = std::str::from_utf8(line)?;
    Ok(Some(WireLine::parse(text)?))
}

/// Encode a wire line into frame bytes (terminator added by the codec)
pub fn encode_line(line: &WireLine) -> Result<Bytes, FrameError> {
    Ok(Bytes::from(line.encode()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_lines_wait_for_terminator() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"cmd:pe"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ers\r\nnext");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&line[..], b"cmd:peers");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let tail = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(&tail[..], b"next");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_appends_terminator() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"bcmd:quit"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"bcmd:quit\n");

        assert!(matches!(
            codec.encode(Bytes::from_static(b"a\nb"), &mut buf),
            Err(FrameError::EmbeddedTerminator)
        ));
    }

    #[test]
    fn test_line_limit() {
        let mut codec = LineCodec::with_max_len(4);
        let mut buf = BytesMut::from(&b"abcd\n"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"abcd");

        let mut buf = BytesMut::from(&b"abcde"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge(5))));
    }

    #[test]
    fn test_parse_line_kinds() {
        assert!(parse_line(b"").unwrap().is_none());
        assert_eq!(
            parse_line(b"cmd:peers").unwrap(),
            Some(WireLine::Command("peers".into()))
        );
        assert!(matches!(parse_line(b"{broken"), Err(FrameError::Decode(_))));
        assert!(matches!(parse_line(&[0xff, 0xfe]), Err(FrameError::Utf8(_))));
    }
}
