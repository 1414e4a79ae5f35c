use tokio::io::{AsyncRead, AsyncReadExt};

/// Terminator for upstream IRC lines.
pub const CRLF: &[u8] = b"\r\n";
/// Terminator for downstream command lines.
pub const LF: &[u8] = b"\n";

/// Read chunk size for socket reads.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Splits a byte stream delivered in arbitrary chunks into terminator-delimited lines.
///
/// An unterminated tail is carried over and prefixed onto the first line of the
/// next chunk. Lines are decoded lossily as UTF-8 with the terminator stripped.
#[derive(Debug)]
pub struct LineFramer {
    terminator: &'static [u8],
    remainder: Vec<u8>,
}

impl LineFramer {
    pub fn new(terminator: &'static [u8]) -> Self {
        assert!(!terminator.is_empty(), "line terminator cannot be empty");
        Self {
            terminator,
            remainder: Vec::new(),
        }
    }

    pub fn crlf() -> Self {
        Self::new(CRLF)
    }

    pub fn lf() -> Self {
        Self::new(LF)
    }

    /// Feed one chunk, returning every line it completes in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        // A terminator may straddle the previous chunk boundary, so the scan
        // starts far enough back into the remainder to catch it.
        let scan_from = self
            .remainder
            .len()
            .saturating_sub(self.terminator.len() - 1);
        self.remainder.extend_from_slice(chunk);

        let mut start = 0;
        let mut pos = scan_from;
        while let Some(offset) = find(&self.remainder[pos..], self.terminator) {
            let end = pos + offset;
            lines.push(String::from_utf8_lossy(&self.remainder[start..end]).into_owned());
            start = end + self.terminator.len();
            pos = start;
        }

        // Everything up to `start` has been emitted. When the chunk ended
        // exactly on a terminator this leaves the remainder empty.
        self.remainder.drain(..start);
        lines
    }

    /// Bytes received after the last complete line.
    pub fn remainder(&self) -> &[u8] {
        &self.remainder
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Pulls complete lines out of an async reader through a `LineFramer`.
pub struct LineReader<R> {
    reader: R,
    framer: LineFramer,
    buf: Box<[u8]>,
    pending: std::collections::VecDeque<String>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, framer: LineFramer) -> Self {
        Self {
            reader,
            framer,
            buf: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Next complete line. EOF is reported as `UnexpectedEof`.
    pub async fn next_line(&mut self) -> std::io::Result<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(line);
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed",
                ));
            }
            self.pending.extend(self.framer.push(&self.buf[..n]));
        }
    }
}
