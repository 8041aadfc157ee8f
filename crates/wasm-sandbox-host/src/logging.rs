//! Print sinks for guest output.
//!
//! - [`StdoutSink`]: Raw bytes to the process's stdout
//! - [`TracingSink`]: One `tracing` event per line
//! - [`CaptureSink`]: In-memory buffer, for tests and embedding
//! - [`HeaderSink`]: Prefixes every line with a header, then forwards

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use wasm_sandbox_core::PrintSink;

/// Writes guest output to stdout unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl PrintSink for StdoutSink {
    fn print(&self, bytes: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(bytes).and_then(|()| stdout.flush()) {
            warn!(error = %e, "Failed to write guest output");
        }
    }
}

/// Emits every guest line as an `info` event.
///
/// Partial lines are buffered until their newline arrives.
#[derive(Debug, Default)]
pub struct TracingSink {
    pending: Mutex<Vec<u8>>,
}

impl TracingSink {
    /// A sink with nothing buffered.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrintSink for TracingSink {
    fn print(&self, bytes: &[u8]) {
        let mut pending = self.pending.lock();
        pending.extend_from_slice(bytes);

        while let Some(end) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..end]);
            info!(guest_output = true, "{}", text);
        }
    }
}

impl Drop for TracingSink {
    fn drop(&mut self) {
        let pending = self.pending.get_mut();
        if !pending.is_empty() {
            info!(guest_output = true, "{}", String::from_utf8_lossy(pending));
        }
    }
}

/// Collects guest output in memory.
///
/// Clones share one buffer.
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSink {
    /// An empty capture buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything printed so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Everything printed so far.
    pub fn bytes(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Empty the buffer.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl PrintSink for CaptureSink {
    fn print(&self, bytes: &[u8]) {
        self.buffer.lock().extend_from_slice(bytes);
    }
}

/// Prefixes every non-empty line with a header before forwarding.
///
/// Line starts are tracked across calls, so a line printed in pieces gets
/// one header.
#[derive(Debug)]
pub struct HeaderSink {
    header: Vec<u8>,
    inner: Arc<dyn PrintSink>,
    at_line_start: Mutex<bool>,
}

impl HeaderSink {
    /// Forward to `inner`, prefixing lines with `header`.
    pub fn new(header: impl Into<Vec<u8>>, inner: Arc<dyn PrintSink>) -> Self {
        Self {
            header: header.into(),
            inner,
            at_line_start: Mutex::new(true),
        }
    }
}

impl PrintSink for HeaderSink {
    fn print(&self, bytes: &[u8]) {
        let mut at_line_start = self.at_line_start.lock();
        let mut out = Vec::with_capacity(bytes.len() + self.header.len());

        for &byte in bytes {
            if *at_line_start && byte != b'\n' {
                out.extend_from_slice(&self.header);
            }
            out.push(byte);
            *at_line_start = byte == b'\n';
        }

        self.inner.print(&out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink_shares_buffer() {
        let sink = CaptureSink::new();
        let clone = sink.clone();

        sink.print(b"Hello, ");
        clone.print_str("World");

        assert_eq!(sink.contents(), "Hello, World");
        assert_eq!(clone.bytes(), b"Hello, World");

        sink.clear();
        assert!(clone.contents().is_empty());
    }

    #[test]
    fn test_header_sink_prefixes_lines() {
        let capture = CaptureSink::new();
        let sink = HeaderSink::new("[Guest] ", Arc::new(capture.clone()));

        sink.print(b"first\n\nsec");
        sink.print(b"ond\nthird");

        assert_eq!(
            capture.contents(),
            "[Guest] first\n\n[Guest] second\n[Guest] third"
        );
    }

    #[test]
    fn test_tracing_sink_buffers_partial_lines() {
        let sink = TracingSink::new();

        sink.print(b"partial");
        assert_eq!(*sink.pending.lock(), b"partial");

        sink.print(b" line\nnext");
        assert_eq!(*sink.pending.lock(), b"next");
    }
}
