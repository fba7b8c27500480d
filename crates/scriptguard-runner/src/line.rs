//! Bounded line reading.
//!
//! Script output can contain arbitrarily long lines (a minified JSON dump, a
//! progress bar without newlines). Each line is capped at a byte budget; the
//! excess is discarded but still read, so the child never blocks on a full
//! pipe and the next line starts at the right place.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Appended to every line that was cut at the byte budget.
pub const TRUNCATION_MARKER: &str = " ...(truncated)";

/// Reads `\n`-delimited lines of at most `max_bytes` bytes each.
pub struct LineReader<R> {
    inner: R,
    max_bytes: usize,
    strip_ansi: bool,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_bytes: usize, strip_ansi: bool) -> Self {
        Self {
            inner,
            max_bytes: max_bytes.max(1),
            strip_ansi,
            buf: Vec::new(),
        }
    }

    /// Next line without its trailing `\r\n`, or `None` at end of stream.
    ///
    /// A final line without a newline is still returned. Invalid UTF-8 is
    /// replaced lossily.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let mut truncated = false;
        let mut read_any = false;

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            read_any = true;

            let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (&available[..=i], true),
                None => (available, false),
            };
            let used = chunk.len();

            let room = self.max_bytes.saturating_sub(self.buf.len());
            if chunk.len() > room {
                // A newline that falls past the budget is not content.
                let kept = &chunk[..room];
                let overflow = &chunk[room..];
                if !overflow.iter().all(|&b| b == b'\r' || b == b'\n') {
                    truncated = true;
                }
                self.buf.extend_from_slice(kept);
            } else {
                self.buf.extend_from_slice(chunk);
            }

            self.inner.consume(used);
            if done {
                break;
            }
        }

        if !read_any {
            return Ok(None);
        }
        Ok(Some(self.take_line(truncated)))
    }

    fn take_line(&mut self, truncated: bool) -> String {
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }

        if truncated {
            // Don't leave half a multi-byte character at the cut.
            if let Err(e) = std::str::from_utf8(&self.buf) {
                if e.error_len().is_none() {
                    self.buf.truncate(e.valid_up_to());
                }
            }
        }

        let mut line = if self.strip_ansi {
            let clean = strip_ansi_escapes::strip(&self.buf);
            String::from_utf8_lossy(&clean).into_owned()
        } else {
            String::from_utf8_lossy(&self.buf).into_owned()
        };

        if truncated {
            line.push_str(TRUNCATION_MARKER);
        }
        line
    }
}
