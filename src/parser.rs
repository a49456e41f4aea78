use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

const READ_BUFFER_BYTES: usize = 256 * 1024;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Plain,
}

impl Compression {
    fn sniff(head: &[u8]) -> Self {
        if head.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if head.starts_with(BZIP2_MAGIC) {
            Compression::Bzip2
        } else {
            Compression::Plain
        }
    }
}

/// Decoded text lines from a (possibly compressed) byte stream.
///
/// Invalid UTF-8 is replaced, never rejected. The first I/O error ends the
/// stream and is kept for [`LineSource::take_error`].
pub struct LineSource<R> {
    reader: R,
    buf: Vec<u8>,
    pushed_back: Option<String>,
    line_number: u64,
    error: Option<io::Error>,
}

impl LineSource<Box<dyn BufRead + Send>> {
    /// Opens a dump, picking the decoder from the file's magic bytes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open input dump: {}", path.display()))?;
        let mut raw = BufReader::with_capacity(READ_BUFFER_BYTES, file);
        let compression = Compression::sniff(
            raw.fill_buf()
                .with_context(|| format!("Failed to read input dump: {}", path.display()))?,
        );
        debug!(path = %path.display(), ?compression, "Opened input dump");

        let reader: Box<dyn BufRead + Send> = match compression {
            Compression::Gzip => Box::new(BufReader::with_capacity(
                READ_BUFFER_BYTES,
                MultiGzDecoder::new(raw),
            )),
            Compression::Bzip2 => Box::new(BufReader::with_capacity(
                READ_BUFFER_BYTES,
                MultiBzDecoder::new(raw),
            )),
            Compression::Plain => Box::new(raw),
        };
        Ok(Self::new(reader))
    }
}

impl<R: BufRead> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            pushed_back: None,
            line_number: 0,
            error: None,
        }
    }

    /// Number of lines pulled from the underlying stream so far.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn next_line(&mut self) -> Option<String> {
        if let Some(line) = self.pushed_back.take() {
            return Some(line);
        }
        if self.error.is_some() {
            return None;
        }

        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                self.line_number += 1;
                while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
                    self.buf.pop();
                }
                // Postgres TEXT cannot hold NUL; a zero byte is never part of a UTF-8 sequence.
                if memchr::memchr(0, &self.buf).is_some() {
                    self.buf.retain(|&b| b != 0);
                }
                Some(String::from_utf8_lossy(&self.buf).into_owned())
            }
            Err(e) => {
                warn!(line = self.line_number, error = %e, "Input stream failed, ending early");
                self.error = Some(e);
                None
            }
        }
    }

    /// Returns a line so the next call to [`LineSource::next_line`] yields it again.
    /// Only one line of push-back is held.
    pub fn push_back(&mut self, line: String) {
        debug_assert!(self.pushed_back.is_none(), "push_back called twice");
        self.pushed_back = Some(line);
    }

    /// Pulls up to `n` lines; fewer come back when the stream ends first.
    pub fn take_next(&mut self, n: usize) -> Vec<String> {
        self.take_next_while(n, |_| true)
    }

    /// Pulls up to `n` lines, stopping at end of input or at the first line
    /// rejected by `accept`. The rejected line is pushed back unconsumed.
    pub fn take_next_while(&mut self, n: usize, accept: impl Fn(&str) -> bool) -> Vec<String> {
        let mut lines = Vec::with_capacity(n.min(64));
        while lines.len() < n {
            let Some(line) = self.next_line() else {
                break;
            };
            if !accept(&line) {
                self.push_back(line);
                break;
            }
            lines.push(line);
        }
        lines
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

impl<R: BufRead> Iterator for LineSource<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.next_line()
    }
}
