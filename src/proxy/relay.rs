//! Fixed buffer used to copy one chunk at a time between two sockets.

use std::io::{self, Read, Write};

/// Capacity of the relay buffer.
pub const RELAY_BUFFER_SIZE: usize = 1024;

/// One chunk in flight: filled by a single read, then drained by as many
/// writes as the destination needs.
#[derive(Debug)]
pub struct RelayBuffer {
    buffer: Box<[u8]>,
    read: usize,
    written: usize,
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayBuffer {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; RELAY_BUFFER_SIZE].into_boxed_slice(),
            read: 0,
            written: 0,
        }
    }

    /// Replace the buffered chunk with one read from `source`.
    ///
    /// The previous chunk must be fully drained.
    pub fn fill_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        debug_assert!(self.is_drained(), "relay chunk overwritten before drained");
        let n = source.read(&mut self.buffer)?;
        self.read = n;
        self.written = 0;
        Ok(n)
    }

    /// Write as much of the pending chunk as `sink` accepts.
    pub fn drain_into<W: Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        let n = sink.write(&self.buffer[self.written..self.read])?;
        if n == 0 && self.pending() > 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.written += n;
        Ok(n)
    }

    pub fn pending(&self) -> usize {
        self.read - self.written
    }

    pub fn is_drained(&self) -> bool {
        self.written >= self.read
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Accepts at most `limit` bytes per write.
    struct Trickle {
        out: Vec<u8>,
        limit: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_writes_resume_where_they_stopped() {
        let mut relay = RelayBuffer::new();
        let mut source = Cursor::new(b"hello gopher\n".to_vec());
        assert_eq!(relay.fill_from(&mut source).unwrap(), 13);

        let mut sink = Trickle {
            out: Vec::new(),
            limit: 5,
        };
        while !relay.is_drained() {
            relay.drain_into(&mut sink).unwrap();
        }

        assert_eq!(sink.out, b"hello gopher\n");
        assert_eq!(relay.pending(), 0);
    }

    #[test]
    fn one_read_never_exceeds_capacity() {
        let mut relay = RelayBuffer::new();
        let mut source = Cursor::new(vec![7u8; RELAY_BUFFER_SIZE * 3]);

        assert_eq!(relay.fill_from(&mut source).unwrap(), RELAY_BUFFER_SIZE);
        assert_eq!(relay.pending(), relay.capacity());
    }

    #[test]
    fn zero_length_write_is_an_error() {
        let mut relay = RelayBuffer::new();
        relay.fill_from(&mut Cursor::new(b"x".to_vec())).unwrap();

        let mut sink = Trickle {
            out: Vec::new(),
            limit: 0,
        };
        let err = relay.drain_into(&mut sink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
