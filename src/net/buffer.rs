use std::io;

// Reads off the socket go through a stack chunk of this size.
const CHUNK_SIZE: usize = 16384;

// Consumed prefixes are compacted away once they grow past this.
const COMPACT_THRESHOLD: usize = 65536;

/// A growable FIFO byte buffer used to reassemble frames from a stream
/// socket. Data is appended at the tail by `ingress` and consumed from the
/// head once a complete frame has been decoded.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    #[inline]
    pub fn new(reserve: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(reserve),
            head: 0,
        }
    }

    /// The number of unconsumed bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer holds no unconsumed bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.data.len()
    }

    /// Slice containing the unconsumed data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Advance the head past `count` consumed bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.head += count;

        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head >= COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Read from the supplied reader until it would block or reports end of
    /// stream. Returns the number of bytes ingested and whether end of stream
    /// was reached.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<(usize, bool)> {
        let mut total = 0;
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok((total, true)),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok((total, false)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
