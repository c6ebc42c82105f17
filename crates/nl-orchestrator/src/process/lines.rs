//! Chunk to line splitting

use bytes::{Bytes, BytesMut};

/// Longest partial line kept while waiting for a newline
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Splits a chunked byte stream into trimmed, non-empty lines.
///
/// A line may span several chunks and a chunk may hold several lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: BytesMut,
}

impl LineSplitter {
    /// Create an empty splitter
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line = self.pending.split_to(pos + 1);
            if let Some(line) = trim(&line[..pos]) {
                lines.push(line);
            }
        }

        if self.pending.len() > MAX_PENDING_LINE {
            let line = self.pending.split();
            if let Some(line) = trim(&line) {
                lines.push(line);
            }
        }

        lines
    }

    /// Flush the trailing partial line, if any
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = self.pending.split();
        trim(&rest)
    }
}

fn trim(raw: &[u8]) -> Option<Bytes> {
    let start = raw.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = raw.iter().rposition(|b| !b.is_ascii_whitespace())?;
    Some(Bytes::copy_from_slice(&raw[start..=end]))
}
