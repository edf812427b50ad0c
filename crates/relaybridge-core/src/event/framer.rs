//! Line framing for worker output streams.
//!
//! Output arrives in arbitrary chunks; a line may straddle any number of
//! reads. The framer keeps the trailing partial line in a carry-over buffer
//! and only hands out complete lines, so the framed sequence is the same no
//! matter where the chunk boundaries fell.

use tracing::warn;

/// Longest line kept in the carry-over buffer before it is flushed as is.
const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Pull-based line framer for a single byte stream.
///
/// Feed bytes with [`push`](Self::push) and pull lines with
/// [`next_line`](Self::next_line) or [`lines`](Self::lines). Each line is
/// split on `\n`, decoded as (lossy) UTF-8 and whitespace-trimmed; lines that
/// are empty after trimming are skipped. Use one framer per stream.
///
/// A line that grows past the maximum length without a terminator is flushed
/// in pieces of that length.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no `\n`.
    scanned: usize,
    max_line: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub const fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }

    pub const fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line: if max_line == 0 { 1 } else { max_line },
        }
    }

    /// Append a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete, non-empty line, or `None` if only a partial line remains.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let raw: Vec<u8> = match self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    let end = self.scanned + offset;
                    self.buf.drain(..=end).collect()
                }
                None if self.buf.len() >= self.max_line => {
                    warn!(
                        len = self.buf.len(),
                        max = self.max_line,
                        "Line exceeds maximum length, flushing"
                    );
                    self.buf.drain(..self.max_line).collect()
                }
                None => {
                    self.scanned = self.buf.len();
                    return None;
                }
            };
            self.scanned = 0;
            if let Some(line) = normalize(&raw) {
                return Some(line);
            }
        }
    }

    /// Lazily drain every complete line currently buffered.
    pub fn lines(&mut self) -> impl Iterator<Item = String> + '_ {
        std::iter::from_fn(move || self.next_line())
    }

    /// Flush the unterminated tail at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buf);
        normalize(&rest)
    }

    /// Bytes held back waiting for a line terminator.
    #[cfg(test)]
    const fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn normalize(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
