//! Bounded capture of child process output
//!
//! The buffer holds the combined stdout/stderr of one process generation: a
//! build step followed by the run step it produced. Starting a new generation
//! clears the buffer, and sinks bound to an older generation stop contributing,
//! so late output from a killed process never leaks into the next attempt.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Marker prepended when older output was dropped to honor the size bound
pub const TRUNCATION_MARKER: &str = "[... earlier output truncated ...]\n";

/// Which of our own standard streams a sink mirrors to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

struct Inner {
    data: VecDeque<u8>,
    max_bytes: usize,
    generation: u64,
    truncated: bool,
}

/// Shared, bounded, generation-tagged output buffer
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: VecDeque::new(),
                max_bytes: max_bytes.max(1),
                generation: 0,
                truncated: false,
            })),
        }
    }

    /// Discard everything and start a new generation. Returns the new generation.
    pub fn reset(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.truncated = false;
        inner.generation += 1;
        inner.generation
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Upper bound on buffered bytes
    pub fn capacity(&self) -> usize {
        self.inner.lock().max_bytes
    }

    /// A writer bound to the current generation
    pub fn sink(&self, stream: Stream) -> OutputSink {
        OutputSink {
            buffer: self.clone(),
            generation: self.generation(),
            stream,
        }
    }

    fn append(&self, generation: u64, chunk: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }

        inner.data.extend(chunk);
        let overflow = inner.data.len().saturating_sub(inner.max_bytes);
        if overflow > 0 {
            inner.data.drain(..overflow);
            inner.truncated = true;
        }
        true
    }

    /// Drain the buffer, returning its contents as text
    pub fn take(&self) -> String {
        let mut inner = self.inner.lock();
        let bytes: Vec<u8> = inner.data.drain(..).collect();
        let truncated = std::mem::replace(&mut inner.truncated, false);
        render(&bytes, truncated)
    }

    /// Copy the buffer contents without draining
    pub fn snapshot(&self) -> String {
        let inner = self.inner.lock();
        let (front, back) = inner.data.as_slices();
        let bytes = [front, back].concat();
        render(&bytes, inner.truncated)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn render(bytes: &[u8], truncated: bool) -> String {
    let text = String::from_utf8_lossy(bytes);
    if truncated {
        format!("{}{}", TRUNCATION_MARKER, text)
    } else {
        text.into_owned()
    }
}

/// Write handle for one stream of one process generation
#[derive(Clone)]
pub struct OutputSink {
    buffer: OutputBuffer,
    generation: u64,
    stream: Stream,
}

impl OutputSink {
    /// Append a chunk. Returns false once the sink's generation has been superseded.
    pub fn write(&self, chunk: &[u8]) -> bool {
        self.buffer.append(self.generation, chunk)
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sinks_share_one_buffer() {
        let buffer = OutputBuffer::new(1024);
        let out = buffer.sink(Stream::Stdout);
        let err = buffer.sink(Stream::Stderr);

        assert!(out.write(b"compiling\n"));
        assert!(err.write(b"warning: unused\n"));
        assert!(out.write(b"done\n"));

        assert_eq!(buffer.snapshot(), "compiling\nwarning: unused\ndone\n");
        assert_eq!(out.stream(), Stream::Stdout);
        assert_eq!(err.stream(), Stream::Stderr);
    }

    #[test]
    fn test_take_drains() {
        let buffer = OutputBuffer::new(1024);
        buffer.sink(Stream::Stdout).write(b"hello");

        assert_eq!(buffer.take(), "hello");
        assert!(buffer.is_empty());
        assert_eq!(buffer.take(), "");
    }

    #[test]
    fn test_reset_discards_stale_generation() {
        let buffer = OutputBuffer::new(1024);
        let old = buffer.sink(Stream::Stdout);
        old.write(b"first generation\n");

        let generation = buffer.reset();
        assert_eq!(generation, old.generation() + 1);
        assert!(buffer.is_empty());

        // A killed process may still flush output after the reset
        assert!(!old.write(b"late output\n"));

        let new = buffer.sink(Stream::Stdout);
        assert_eq!(new.generation(), generation);
        assert!(new.write(b"second generation\n"));
        assert_eq!(buffer.take(), "second generation\n");
    }

    #[test]
    fn test_bounded_keeps_newest_bytes() {
        let buffer = OutputBuffer::new(8);
        let sink = buffer.sink(Stream::Stderr);
        sink.write(b"0123456789");
        sink.write(b"ab");

        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.snapshot(), format!("{}456789ab", TRUNCATION_MARKER));
        assert_eq!(buffer.take(), format!("{}456789ab", TRUNCATION_MARKER));

        // Truncation flag is consumed by take
        sink.write(b"xy");
        assert_eq!(buffer.take(), "xy");
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let buffer = OutputBuffer::new(64);
        buffer.sink(Stream::Stdout).write(&[b'o', b'k', 0xff]);
        assert_eq!(buffer.take(), "ok\u{fffd}");
    }
}
