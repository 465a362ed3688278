//! Incremental consumer for the `data:`-framed reply stream.
//!
//! Bytes flow through [`ChunkDecoder`] -> [`LineFramer`] -> [`parse_line`] in arrival order.
//! [`EventReader`] bundles the three stages so callers only hand it raw transport chunks.

mod decoder;
mod framer;
mod parser;

pub use parser::ParsedLine;

use decoder::ChunkDecoder;
use framer::LineFramer;
use parser::parse_line;

use tracing::debug;

#[derive(Debug, Default)]
pub struct EventReader {
    decoder: ChunkDecoder,
    framer: LineFramer,
}

impl EventReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one transport chunk and parses every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParsedLine> {
        let text = self.decoder.decode(chunk);
        self.framer
            .push(&text)
            .iter()
            .map(|line| parse_line(line))
            .collect()
    }

    /// Called once the transport reports no more bytes.
    ///
    /// An unterminated trailing line is dropped, matching the framing rule that an event
    /// only counts once its newline arrives.
    pub fn finish(&mut self) {
        let discarded = self.decoder.finish();
        if discarded > 0 {
            debug!(bytes = discarded, "dropping undecodable bytes at end of stream");
        }
        let leftover = self.framer.take_partial();
        if !leftover.is_empty() {
            debug!(fragment = %leftover, "dropping unterminated line at end of stream");
        }
    }
}
