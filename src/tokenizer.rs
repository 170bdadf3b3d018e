//! Stream framing: splitting an append-only byte stream into discrete
//! messages per a configurable rule (Module A).
//!
//! `Tokenizer::extract` is a deterministic function of the framing rule and
//! the concatenation of all prior inputs: feeding the same bytes in
//! different chunkings yields the same sequence of emitted messages,
//! because the unframed tail is retained internally and nothing is ever
//! inspected past what a complete message requires.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;

use crate::error::TokenizerError;

/// Byte order used to decode a length-prefix field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Configuration for the length-prefix framing mode.
#[derive(Clone)]
pub struct LengthPrefixConfig {
    /// Bytes preceding the length field that are not part of the length
    /// itself (e.g. a fixed command-id header).
    pub header_offset: usize,
    /// Width of the length field in bytes: 1, 2, 4, or 8.
    pub length_field_width: usize,
    pub endianness: Endianness,
    /// If true, the decoded length already counts `header_offset +
    /// length_field_width`; if false, the decoded length is the content
    /// length alone and the total message length is computed by adding
    /// the header and field width back in.
    pub content_includes_header: bool,
}

impl LengthPrefixConfig {
    fn decode_length(&self, field_bytes: &[u8]) -> u64 {
        match (self.length_field_width, self.endianness) {
            (1, _) => field_bytes[0] as u64,
            (2, Endianness::Little) => u16::from_le_bytes([field_bytes[0], field_bytes[1]]) as u64,
            (2, Endianness::Big) => u16::from_be_bytes([field_bytes[0], field_bytes[1]]) as u64,
            (4, Endianness::Little) => u32::from_le_bytes(field_bytes[..4].try_into().unwrap()) as u64,
            (4, Endianness::Big) => u32::from_be_bytes(field_bytes[..4].try_into().unwrap()) as u64,
            (8, Endianness::Little) => u64::from_le_bytes(field_bytes[..8].try_into().unwrap()),
            (8, Endianness::Big) => u64::from_be_bytes(field_bytes[..8].try_into().unwrap()),
            (width, _) => panic!("unsupported length_field_width: {width}"),
        }
    }
}

/// A pure callable framing rule: given the buffered-so-far bytes, returns
/// the number of bytes in the next complete message, or `0` if the buffer
/// does not yet hold a complete message.
pub type FramingFn = Arc<dyn Fn(&[u8]) -> usize + Send + Sync>;

/// The framing rule a [`Tokenizer`] is configured with.
#[derive(Clone)]
pub enum Framing {
    /// Emit each message up to and including the delimiter sequence.
    Delimiter(Bytes),
    /// Emit each message as `header_offset + length_field_width +
    /// content_length` bytes, per `LengthPrefixConfig`.
    LengthPrefix(LengthPrefixConfig),
    /// Emit messages per a caller-supplied pure function.
    Callable(FramingFn),
}

const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Stream framer. Holds an internal growable buffer across calls to
/// `extract`; only the unframed tail is retained between calls.
pub struct Tokenizer {
    framing: Framing,
    buffer: BytesMut,
    max_message_len: usize,
}

impl Tokenizer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::new(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    /// Append `bytes` to the internal buffer and return zero or more
    /// complete messages, in arrival order. The buffer retains only the
    /// unframed tail afterwards.
    pub fn extract(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>, TokenizerError> {
        self.buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();
        loop {
            match self.next_message_len()? {
                Some(len) => {
                    let message = self.buffer.split_to(len).freeze();
                    messages.push(message);
                }
                None => break,
            }
        }
        Ok(messages)
    }

    /// Discard the unframed tail, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn check_ceiling(&mut self, len: usize) -> Result<(), TokenizerError> {
        if len > self.max_message_len {
            self.buffer.clear();
            return Err(TokenizerError::Overflow {
                len,
                ceiling: self.max_message_len,
            });
        }
        Ok(())
    }

    /// Returns the length of the next complete message in the buffer, or
    /// `None` if more bytes are needed.
    fn next_message_len(&mut self) -> Result<Option<usize>, TokenizerError> {
        match &self.framing {
            Framing::Delimiter(delim) => {
                if delim.is_empty() {
                    return Ok(None);
                }
                match find_subsequence(&self.buffer, delim) {
                    Some(idx) => Ok(Some(idx + delim.len())),
                    None => {
                        self.check_ceiling(self.buffer.len())?;
                        Ok(None)
                    }
                }
            }
            Framing::LengthPrefix(cfg) => {
                let header_and_field = cfg.header_offset + cfg.length_field_width;
                if self.buffer.len() < header_and_field {
                    return Ok(None);
                }
                let field_bytes = &self.buffer[cfg.header_offset..header_and_field];
                let decoded = cfg.decode_length(field_bytes);
                let total: usize = if cfg.content_includes_header {
                    decoded as usize
                } else {
                    header_and_field + decoded as usize
                };
                self.check_ceiling(total)?;
                if self.buffer.len() < total {
                    Ok(None)
                } else {
                    Ok(Some(total))
                }
            }
            Framing::Callable(f) => {
                let n = f(&self.buffer);
                if n == 0 {
                    self.check_ceiling(self.buffer.len())?;
                    return Ok(None);
                }
                self.check_ceiling(n)?;
                if self.buffer.len() < n {
                    Ok(None)
                } else {
                    Ok(Some(n))
                }
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1 — delimited tokenizer.
    #[test]
    fn delimiter_framing_splits_and_retains_tail() {
        let mut tok = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"\n")));

        let first = tok.extract(b"ab").unwrap();
        assert!(first.is_empty());

        let second = tok.extract(b"c\nde\nf").unwrap();
        assert_eq!(second, vec![Bytes::from_static(b"abc\n"), Bytes::from_static(b"de\n")]);

        // residual "f" held internally; feeding the delimiter completes it
        let third = tok.extract(b"\n").unwrap();
        assert_eq!(third, vec![Bytes::from_static(b"f\n")]);
    }

    #[test]
    fn length_prefix_framing_content_excludes_header() {
        let cfg = LengthPrefixConfig {
            header_offset: 0,
            length_field_width: 2,
            endianness: Endianness::Big,
            content_includes_header: false,
        };
        let mut tok = Tokenizer::new(Framing::LengthPrefix(cfg));

        let mut input = vec![0u8, 3];
        input.extend_from_slice(b"abc");
        input.extend_from_slice(&[0, 2]);
        input.extend_from_slice(b"xy");

        let messages = tok.extract(&input).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0][..], &[0, 3, b'a', b'b', b'c']);
        assert_eq!(&messages[1][..], &[0, 2, b'x', b'y']);
    }

    #[test]
    fn length_prefix_framing_waits_for_full_message() {
        let cfg = LengthPrefixConfig {
            header_offset: 0,
            length_field_width: 1,
            endianness: Endianness::Little,
            content_includes_header: false,
        };
        let mut tok = Tokenizer::new(Framing::LengthPrefix(cfg));

        let partial = tok.extract(&[5, b'a', b'b']).unwrap();
        assert!(partial.is_empty());

        let rest = tok.extract(&[b'c', b'd', b'e']).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(&rest[0][..], &[5, b'a', b'b', b'c', b'd', b'e']);
    }

    #[test]
    fn callable_framing_reports_incomplete_as_zero() {
        let framing: FramingFn = Arc::new(|buf: &[u8]| if buf.len() < 4 { 0 } else { 4 });
        let mut tok = Tokenizer::new(Framing::Callable(framing));

        assert!(tok.extract(b"ab").unwrap().is_empty());
        let messages = tok.extract(b"cdef").unwrap();
        assert_eq!(messages, vec![Bytes::from_static(b"abcd")]);
    }

    #[test]
    fn overflow_clears_buffer_and_reports_error() {
        let cfg = LengthPrefixConfig {
            header_offset: 0,
            length_field_width: 2,
            endianness: Endianness::Big,
            content_includes_header: false,
        };
        let mut tok = Tokenizer::new(Framing::LengthPrefix(cfg)).with_max_message_len(4);

        let mut input = vec![0u8, 10];
        input.extend_from_slice(b"0123456789");

        let err = tok.extract(&input).unwrap_err();
        assert!(matches!(err, TokenizerError::Overflow { .. }));
        assert_eq!(tok.extract(b"").unwrap().len(), 0);
    }

    #[test]
    fn extract_is_independent_of_chunking() {
        let data = b"abc\ndef\nghi\n";

        let mut whole = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"\n")));
        let whole_msgs = whole.extract(data).unwrap();

        let mut chunked = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"\n")));
        let mut chunked_msgs = Vec::new();
        for byte in data {
            chunked_msgs.extend(chunked.extract(&[*byte]).unwrap());
        }

        assert_eq!(whole_msgs, chunked_msgs);
    }
}
