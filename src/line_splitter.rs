//! Splits a raw byte stream into logical lines, one `write_line` call at a
//! time, for callers that only have an unframed byte source (a pipe, or the
//! generator adapter in [`crate::generator_file`]).
//!
//! A line ends at `\n`, at `\r\n`, or at a bare `\r` (the progress-bar style
//! terminator the build log's quiet filter cares about) — whichever comes
//! first. The terminator itself is always included in the returned line, so
//! the build log sink can tell the three cases apart.

use std::io::Read;

pub struct LineSplitter<R> {
    inner: R,
    buf: [u8; 8192],
    carry: Vec<u8>,
}

impl<R: Read> LineSplitter<R> {
    pub fn new(inner: R) -> Self {
        LineSplitter {
            inner,
            buf: [0u8; 8192],
            carry: Vec::new(),
        }
    }

    /// Read and return the next logical line, or `None` at end of stream.
    /// Returns `Ok(None)` only once the underlying reader is exhausted and
    /// no partial line remains; a trailing unterminated chunk at EOF is
    /// still returned once, as its own "line".
    pub fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(idx) = find_terminator_end(&self.carry) {
                let line: Vec<u8> = self.carry.drain(..idx).collect();
                return Ok(Some(line));
            }

            let n = self.inner.read(&mut self.buf)?;
            if n == 0 {
                if self.carry.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.carry)));
            }
            self.carry.extend_from_slice(&self.buf[..n]);
        }
    }
}

/// If `data` contains a line terminator, return the index just past it
/// (i.e. the length of the line including the terminator bytes).
fn find_terminator_end(data: &[u8]) -> Option<usize> {
    for (i, &b) in data.iter().enumerate() {
        if b == b'\n' {
            return Some(i + 1);
        }
        if b == b'\r' {
            // \r\n is one terminator; a bare \r (no following byte yet, or
            // followed by something other than \n) terminates on its own.
            return match data.get(i + 1) {
                Some(b'\n') => Some(i + 2),
                Some(_) => Some(i + 1),
                None => None, // need more bytes to know if \n follows
            };
        }
    }
    None
}
