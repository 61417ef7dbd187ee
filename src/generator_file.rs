//! Adapts a lazy byte producer into a blocking [`std::io::Read`].
//!
//! This is the component that lets a scripted sequence of chunks (with
//! controlled timing) stand in for a real child-process pipe in tests, while
//! production code reads directly from the OS pipe. Keeping the two behind
//! the same `Read` interface means a test double and the real pipe are
//! interchangeable wherever a reader is expected.

use std::io::{self, Read};

/// Something that yields byte chunks one at a time, blocking as needed
/// between chunks, and signals end-of-stream with `None`.
pub trait ChunkProducer {
    fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

/// A [`ChunkProducer`] backed by a plain iterator of chunks, useful for tests
/// that want to inject a scripted sequence (optionally with sleeps between
/// chunks performed by the iterator itself).
impl<I> ChunkProducer for I
where
    I: Iterator<Item = Vec<u8>>,
{
    fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.next()
    }
}

/// Readable adapter over a [`ChunkProducer`].
///
/// `read` (and therefore `read_into` in the contract's terms) returns as
/// soon as *some* bytes are available rather than blocking to coalesce a
/// full buffer: a short read is always permitted. A chunk larger than the
/// caller's buffer is split across calls, with the remainder retained
/// internally.
pub struct GeneratorFile<P> {
    producer: P,
    pending: Vec<u8>,
    pending_pos: usize,
    exhausted: bool,
}

impl<P: ChunkProducer> GeneratorFile<P> {
    pub fn new(producer: P) -> Self {
        GeneratorFile {
            producer,
            pending: Vec::new(),
            pending_pos: 0,
            exhausted: false,
        }
    }

    fn pending_remaining(&self) -> usize {
        self.pending.len() - self.pending_pos
    }
}

impl<P: ChunkProducer> Read for GeneratorFile<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pending_remaining() == 0 {
            if self.exhausted {
                return Ok(0);
            }
            match self.producer.next_chunk() {
                Some(chunk) => {
                    self.pending = chunk;
                    self.pending_pos = 0;
                }
                None => {
                    self.exhausted = true;
                    return Ok(0);
                }
            }
        }

        let remaining = self.pending_remaining();
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        if self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_splitter::LineSplitter;

    fn chunks(v: Vec<&[u8]>) -> std::vec::IntoIter<Vec<u8>> {
        v.into_iter().map(|c| c.to_vec()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn short_reads_do_not_block_to_coalesce() {
        let mut gf = GeneratorFile::new(chunks(vec![b"Some ", b"output that is larger than the buffer\n", b"And more"]));
        let mut bufs = Vec::new();
        let mut small = [0u8; 8];
        loop {
            let n = gf.read(&mut small).unwrap();
            if n == 0 {
                break;
            }
            bufs.extend_from_slice(&small[..n]);
        }
        assert_eq!(
            bufs,
            b"Some output that is larger than the buffer\nAnd more".to_vec()
        );
    }

    #[test]
    fn large_chunk_is_split_across_calls_and_remainder_retained() {
        let mut gf = GeneratorFile::new(chunks(vec![b"0123456789"]));
        let mut buf = [0u8; 4];
        assert_eq!(gf.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(gf.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");
        assert_eq!(gf.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(gf.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn usable_underneath_a_line_splitting_reader() {
        let gf = GeneratorFile::new(chunks(vec![
            b"Content\n",
            b"Content\rall\rin\ra single\rrow\n",
            b"Content ",
            b"In a line\n",
            b"Windows output\r\n",
        ]));
        let mut splitter = LineSplitter::new(gf);
        let mut lines = Vec::new();
        while let Some(line) = splitter.next_line().unwrap() {
            lines.push(String::from_utf8(line).unwrap());
        }
        assert_eq!(
            lines,
            vec![
                "Content\n",
                "Content\r",
                "all\r",
                "in\r",
                "a single\r",
                "row\n",
                "Content In a line\n",
                "Windows output\r\n",
            ]
        );
    }
}
