//! Async adapter feeding a byte stream through a [`LineFramer`].

use relaybridge_core::LineFramer;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Reads framed lines from any [`AsyncRead`] (a worker's stdout or stderr).
pub struct LineReader<R> {
    inner: R,
    framer: LineFramer,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            framer: LineFramer::new(),
            chunk: vec![0; READ_CHUNK_BYTES],
            eof: false,
        }
    }

    /// Next non-empty line, or `Ok(None)` once the stream is exhausted.
    ///
    /// An unterminated final line is returned at end of stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(line) = self.framer.next_line() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(self.framer.finish());
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.framer.push(&self.chunk[..n]);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect<R: AsyncRead + Unpin>(reader: &mut LineReader<R>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn reads_lines_across_writes() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            for chunk in [&b"JSON_DA"[..], b"TA:{\"a\":1}\nsec", b"ond\n\n", b"last"] {
                tx.write_all(chunk).await.unwrap();
                tx.flush().await.unwrap();
            }
        });

        let mut reader = LineReader::new(rx);
        let lines = collect(&mut reader).await;
        writer.await.unwrap();

        assert_eq!(lines, vec!["JSON_DATA:{\"a\":1}", "second", "last"]);
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let mut reader = LineReader::new(&b""[..]);
        assert!(collect(&mut reader).await.is_empty());
    }
}
