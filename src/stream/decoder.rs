/// Incremental UTF-8 decoder.
///
/// A multi-byte sequence cut by a chunk boundary is held back until the bytes that complete it
/// arrive. Bytes that can never form valid UTF-8 are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut text = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            // Truncated sequence at the end of the chunk.
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    /// Number of bytes still waiting for a continuation.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discards any incomplete trailing sequence and returns how many bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defers_split_multibyte_sequence() {
        let bytes = "é✓".as_bytes();
        let mut decoder = ChunkDecoder::default();

        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.decode(&bytes[1..3]), "é");
        assert_eq!(decoder.decode(&bytes[3..]), "✓");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn replaces_invalid_bytes_and_keeps_going() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.decode(b"ab\xffcd"), "ab\u{FFFD}cd");
    }

    #[test]
    fn finish_discards_truncated_tail() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.decode(&"ok✓".as_bytes()[..4]), "ok");
        assert_eq!(decoder.finish(), 2);
        assert_eq!(decoder.pending_len(), 0);
        assert_eq!(decoder.decode(b"next"), "next");
    }
}
