//! Permissive UTF-8 decoding of process output.
//!
//! Invalid byte sequences become U+FFFD and never interrupt the stream. A
//! character that straddles two reads is held back until its remaining bytes
//! arrive, so chunk boundaries alone never produce replacement characters.

/// Longest prefix of a UTF-8 sequence that can be incomplete (4-byte char).
const MAX_PENDING: usize = 3;

/// Stateful decoder for one output stream.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a chunk, carrying an incomplete trailing character forward.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let split = bytes.len() - incomplete_tail_len(&bytes);
        self.pending = bytes.split_off(split);

        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Flushes whatever is still pending at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Number of bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Length of a trailing, not yet complete, multi-byte sequence.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=MAX_PENDING.min(len) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            // continuation byte, keep looking for the lead
            continue;
        }
        let needed = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"hello\n"), "hello\n");
        assert_eq!(decoder.pending_len(), 0);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_trailing_invalid_byte_not_held() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"ok\xff"), "ok\u{FFFD}");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_two_byte_char_split_across_reads() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"h\xc3"), "h");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.decode(b"\xa9llo"), "\u{e9}llo");
    }

    #[test]
    fn test_four_byte_char_split_three_ways() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"\xf0"), "");
        assert_eq!(decoder.decode(b"\x9f\x98"), "");
        assert_eq!(decoder.decode(b"\x80!"), "\u{1F600}!");
    }

    #[test]
    fn test_dangling_sequence_flushed_lossily() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"end\xe2\x82"), "end");
        assert_eq!(decoder.finish().as_deref(), Some("\u{FFFD}"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_held_bytes_followed_by_garbage() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"\xc3"), "");
        // a lead byte cannot be completed by ASCII
        assert_eq!(decoder.decode(b"x"), "\u{FFFD}x");
    }
}
