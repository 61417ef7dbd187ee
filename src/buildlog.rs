//! Buffered, sectioned build log sink.
//!
//! Every line written to a build log goes through [`BuildLog::write_line`].
//! Three things happen there, in order:
//!
//! 1. Inline section metadata (see [`crate::metadata`]) is detected. If it
//!    decodes successfully, the buffer is flushed first, then the decoded
//!    mapping becomes the log's current section — the encoded line itself
//!    never reaches the local file or the server. If the prefix is present
//!    but decoding fails, the line is ordinary content and passes through
//!    unchanged.
//! 2. In quiet mode, progress-bar-style lines (ending in a bare `\r`, as
//!    opposed to `\r\n`) are dropped entirely rather than forwarded.
//! 3. Everything else is appended to an in-memory buffer, which is drained
//!    to the local file and to the configured [`LogTransport`] together once
//!    it reaches [`BUF_SIZE`] bytes, or on an explicit [`BuildLog::flush`].
//!
//! Lines are raw bytes throughout: a build log is not guaranteed to be valid
//! UTF-8 (a build can emit anything to stdout), and nothing here assumes
//! otherwise — only the server's own form-decoding may substitute U+FFFD.

use std::fs::File;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::error::Result;
use crate::metadata;

/// Bytes buffered in memory before an automatic flush to the transport.
pub const BUF_SIZE: usize = 72;

/// Consecutive transport failures after which the log gives up sending to
/// the server and reports itself [`BuildLog::terminated`].
pub const MAX_WRITE_FAILURES: usize = 5;

/// Where flushed log chunks go. Implemented by the coordinator client in
/// production; tests can supply an in-memory double. The `bool` returned on
/// success is the server's own request to stop the build.
pub trait LogTransport: Send {
    fn send_chunk(&mut self, chunk: &[u8], section: Option<&Map<String, Value>>) -> Result<bool>;
}

/// A transport that always succeeds, never asks to terminate, and just
/// records what it was given — useful for tests.
#[derive(Default)]
pub struct RecordingTransport {
    pub chunks: Vec<Vec<u8>>,
}

impl LogTransport for RecordingTransport {
    fn send_chunk(&mut self, chunk: &[u8], _section: Option<&Map<String, Value>>) -> Result<bool> {
        self.chunks.push(chunk.to_vec());
        Ok(false)
    }
}

pub struct BuildLog {
    local: File,
    transport: Box<dyn LogTransport>,
    quiet: bool,
    buffer: Vec<u8>,
    current_section: Option<Map<String, Value>>,
    write_failures: AtomicUsize,
    terminated: Arc<AtomicBool>,
}

impl BuildLog {
    pub fn new(local: File, transport: Box<dyn LogTransport>, quiet: bool) -> Self {
        BuildLog {
            local,
            transport,
            quiet,
            buffer: Vec::new(),
            current_section: None,
            write_failures: AtomicUsize::new(0),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A clone of the termination flag, shareable with a supervisor thread
    /// that wants to react to the log giving up without holding the lock
    /// this struct itself is normally kept behind.
    pub fn terminated_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminated)
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn current_section(&self) -> Option<&Map<String, Value>> {
        self.current_section.as_ref()
    }

    fn is_quiet_suppressed(line: &[u8]) -> bool {
        line.ends_with(b"\r") && !line.ends_with(b"\r\n")
    }

    /// Write one logical line (terminator included, as delivered by
    /// [`crate::line_splitter::LineSplitter`]). Returns the line's own byte
    /// length regardless of whether it ended up filtered out, so callers
    /// can account bytes consistently either way.
    pub fn write_line(&mut self, line: &[u8]) -> Result<usize> {
        if metadata::looks_like_metadata(line) {
            match metadata::decode(line) {
                Ok(section) => {
                    self.flush()?;
                    self.current_section = Some(section);
                    return Ok(line.len());
                }
                Err(_) => {
                    // Not real metadata after all; fall through and treat
                    // it as ordinary content.
                }
            }
        }

        if self.quiet && Self::is_quiet_suppressed(line) {
            return Ok(line.len());
        }

        self.buffer.extend_from_slice(line);

        if self.buffer.len() >= BUF_SIZE {
            self.flush()?;
        }
        Ok(line.len())
    }

    pub fn write_lines<'a, I: IntoIterator<Item = &'a [u8]>>(&mut self, lines: I) -> Result<usize> {
        let mut total = 0;
        for line in lines {
            total += self.write_line(line)?;
        }
        Ok(total)
    }

    /// Send whatever is buffered to the transport. A transport failure is
    /// not propagated as an error — the local file is the durable record —
    /// but repeated failures latch [`BuildLog::terminated`]; the server can
    /// also request termination directly via its response.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            self.local.flush()?;
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.buffer);

        self.local.write_all(&chunk)?;
        self.local.flush()?;

        if self.terminated() {
            return Ok(());
        }

        match self.transport.send_chunk(&chunk, self.current_section.as_ref()) {
            Ok(want_terminate) => {
                self.write_failures.store(0, Ordering::SeqCst);
                if want_terminate {
                    self.terminated.store(true, Ordering::SeqCst);
                }
            }
            Err(_) => {
                let failures = self.write_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures > MAX_WRITE_FAILURES {
                    self.terminated.store(true, Ordering::SeqCst);
                }
            }
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl Drop for BuildLog {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata as md;

    fn build_log(quiet: bool) -> (BuildLog, tempfile::TempPath) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.into_temp_path();
        let handle = File::create(&path).unwrap();
        (
            BuildLog::new(handle, Box::new(RecordingTransport::default()), quiet),
            path,
        )
    }

    fn read_back(path: &std::path::Path) -> Vec<u8> {
        std::fs::read(path).unwrap()
    }

    #[test]
    fn invalid_utf8_passes_through_unmodified() {
        let (mut log, path) = build_log(false);
        let line: &[u8] = b"\xff\xfe binary garbage\n";
        log.write_line(line).unwrap();
        log.flush().unwrap();
        assert_eq!(read_back(&path), line);
    }

    #[test]
    fn write_line_reports_byte_length_even_when_filtered() {
        let (mut log, _path) = build_log(true);
        let n = log.write_line(b"progress\r").unwrap();
        assert_eq!(n, b"progress\r".len());
    }

    #[test]
    fn well_formed_metadata_is_stripped_from_local_and_server() {
        let (mut log, path) = build_log(false);
        let mut section = Map::new();
        section.insert("name".into(), Value::String("install".into()));
        let meta_line = md::encode(&section);
        log.write_line(b"before\n").unwrap();
        log.write_line(&meta_line).unwrap();
        log.write_line(b"after\n").unwrap();
        log.flush().unwrap();

        assert_eq!(read_back(&path), b"before\nafter\n".to_vec());
        assert_eq!(
            log.current_section().unwrap().get("name").unwrap(),
            &Value::String("install".into())
        );
    }

    #[test]
    fn malformed_metadata_passes_through_as_content() {
        let (mut log, path) = build_log(false);
        let mut bad_line = metadata::PREFIX.to_vec();
        bad_line.extend_from_slice(b"!!!not-base64!!!\n");
        log.write_line(&bad_line).unwrap();
        log.flush().unwrap();
        assert_eq!(read_back(&path), bad_line);
        assert!(log.current_section().is_none());
    }

    #[test]
    fn loud_mode_keeps_bare_cr_lines() {
        let (mut log, path) = build_log(false);
        log.write_line(b"progress 50%\r").unwrap();
        log.write_line(b"progress 100%\n").unwrap();
        log.flush().unwrap();
        assert_eq!(read_back(&path), b"progress 50%\rprogress 100%\n".to_vec());
    }

    #[test]
    fn quiet_mode_drops_bare_cr_lines_but_keeps_crlf() {
        let (mut log, path) = build_log(true);
        log.write_line(b"progress 50%\r").unwrap();
        log.write_line(b"windows style\r\n").unwrap();
        log.write_line(b"done\n").unwrap();
        log.flush().unwrap();
        assert_eq!(read_back(&path), b"windows style\r\ndone\n".to_vec());
    }

    struct Spy(Arc<Mutex<Vec<Vec<u8>>>>);
    impl LogTransport for Spy {
        fn send_chunk(&mut self, chunk: &[u8], _s: Option<&Map<String, Value>>) -> Result<bool> {
            self.0.lock().unwrap().push(chunk.to_vec());
            Ok(false)
        }
    }

    #[test]
    fn a_single_line_at_buf_size_triggers_exactly_one_post() {
        let posts = Arc::new(Mutex::new(Vec::new()));
        let file = tempfile::NamedTempFile::new().unwrap();
        let handle = File::create(file.path()).unwrap();
        let mut log = BuildLog::new(handle, Box::new(Spy(Arc::clone(&posts))), false);

        log.write_line(&vec![b'x'; BUF_SIZE]).unwrap();

        let posted = posts.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].len(), BUF_SIZE);
    }

    #[test]
    fn two_lines_summing_past_buf_size_flush_together_in_one_post() {
        let posts = Arc::new(Mutex::new(Vec::new()));
        let file = tempfile::NamedTempFile::new().unwrap();
        let handle = File::create(file.path()).unwrap();
        let mut log = BuildLog::new(handle, Box::new(Spy(Arc::clone(&posts))), false);

        log.write_line(&vec![b'a'; 10]).unwrap();
        assert!(posts.lock().unwrap().is_empty());
        log.write_line(&vec![b'b'; 70]).unwrap();

        let posted = posts.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].len(), 80);
    }

    #[test]
    fn flush_on_empty_buffer_sends_nothing() {
        let posts = Arc::new(Mutex::new(Vec::new()));
        let file = tempfile::NamedTempFile::new().unwrap();
        let handle = File::create(file.path()).unwrap();
        let mut log = BuildLog::new(handle, Box::new(Spy(Arc::clone(&posts))), false);
        log.flush().unwrap();
        assert!(posts.lock().unwrap().is_empty());
    }

    #[test]
    fn repeated_transport_failures_latch_terminated() {
        struct FailingTransport;
        impl LogTransport for FailingTransport {
            fn send_chunk(&mut self, _chunk: &[u8], _s: Option<&Map<String, Value>>) -> Result<bool> {
                Err(crate::error::WorkerError::Config("boom".into()))
            }
        }
        let file = tempfile::NamedTempFile::new().unwrap();
        let handle = File::create(file.path()).unwrap();
        let mut log = BuildLog::new(handle, Box::new(FailingTransport), false);
        for i in 0..MAX_WRITE_FAILURES {
            log.write_line(b"line\n").unwrap();
            log.flush().unwrap();
            assert!(!log.terminated(), "should not latch until failures exceed the budget (failure {i})");
        }
        log.write_line(b"line\n").unwrap();
        log.flush().unwrap();
        assert!(log.terminated());
    }

    #[test]
    fn server_can_request_termination_directly() {
        struct TerminatingTransport;
        impl LogTransport for TerminatingTransport {
            fn send_chunk(&mut self, _chunk: &[u8], _s: Option<&Map<String, Value>>) -> Result<bool> {
                Ok(true)
            }
        }
        let file = tempfile::NamedTempFile::new().unwrap();
        let handle = File::create(file.path()).unwrap();
        let mut log = BuildLog::new(handle, Box::new(TerminatingTransport), false);
        log.write_line(b"line\n").unwrap();
        log.flush().unwrap();
        assert!(log.terminated());
    }
}
