//! Growing staging buffer for network framing.
//!
//! Reads and writes happen in two phases so the buffer can be handed to
//! asynchronous IO:
//!
//! - read: look at the unread bytes with [`IoBuffer::begin_read`], then mark
//!   `n` of them consumed with [`IoBuffer::complete_read`].
//! - write: reserve room with [`IoBuffer::begin_write`], fill it, then commit
//!   `n` bytes with [`IoBuffer::complete_write`].
//!
//! ```text
//! 0          read_pos         write_pos              capacity
//! +-------------+----------------+----------------------+
//! |  consumed   |    unread      |      available       |
//! +-------------+----------------+----------------------+
//! ```
//!
//! Once every written byte has been consumed both cursors go back to zero, so
//! a buffer that is drained regularly never grows past its largest message.

use log::trace;

use crate::error::BufferError;

/// Smallest growth step, and the default initial size (1 KiB).
pub const DEFAULT_MIN_BUFFER_SIZE: usize = 1024;

/// Default upper bound of a buffer (8 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub struct IoBuffer {
    data: Vec<u8>,
    max_size: usize,
    read_pos: usize,
    write_pos: usize,
}

impl Default for IoBuffer {
    fn default() -> Self {
        Self {
            data: vec![0; DEFAULT_MIN_BUFFER_SIZE],
            max_size: DEFAULT_MAX_BUFFER_SIZE,
            read_pos: 0,
            write_pos: 0,
        }
    }
}

impl IoBuffer {
    /// Creates a buffer with room for at least `initial_size` bytes that never
    /// grows beyond `max_size`.
    pub fn new(initial_size: usize, max_size: usize) -> Result<Self, BufferError> {
        let mut buffer = Self {
            data: Vec::new(),
            max_size,
            read_pos: 0,
            write_pos: 0,
        };
        buffer.ensure_capacity(initial_size)?;
        Ok(buffer)
    }

    /// Total buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Upper bound of [`Self::capacity`].
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of written bytes, consumed ones included.
    #[inline]
    pub fn size(&self) -> usize {
        self.write_pos
    }

    /// Number of written bytes not consumed yet.
    #[inline]
    pub fn non_read(&self) -> usize {
        debug_assert!(self.write_pos >= self.read_pos);
        self.write_pos - self.read_pos
    }

    /// Unread bytes.
    #[inline]
    pub fn begin_read(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Consumes `num_bytes` unread bytes and returns them. Panics when fewer
    /// bytes are unread.
    pub fn complete_read(&mut self, num_bytes: usize) -> &[u8] {
        assert!(
            self.read_pos + num_bytes <= self.write_pos,
            "reading {num_bytes} bytes with only {} unread",
            self.non_read()
        );
        let start = self.read_pos;
        self.read_pos += num_bytes;
        if self.read_pos == self.write_pos {
            self.discard_all();
        }
        &self.data[start..start + num_bytes]
    }

    /// Consumes and returns the unread bytes up to and including the first
    /// occurrence of `terminator`. Returns an empty slice, consuming nothing,
    /// when `terminator` is not there yet.
    pub fn try_read_until(&mut self, terminator: &[u8]) -> &[u8] {
        assert!(!terminator.is_empty(), "empty terminator");

        let start = self.read_pos;
        let Some(found) = self
            .begin_read()
            .windows(terminator.len())
            .position(|window| window == terminator)
        else {
            return &[];
        };

        let len = found + terminator.len();
        self.read_pos += len;
        if self.read_pos == self.write_pos {
            self.discard_all();
        }
        &self.data[start..start + len]
    }

    /// Room to write at least `at_least` bytes, growing the buffer if needed.
    pub fn begin_write(&mut self, at_least: usize) -> Result<&mut [u8], BufferError> {
        self.ensure_capacity(at_least)?;
        Ok(&mut self.data[self.write_pos..])
    }

    /// Commits `num_bytes` bytes written into the slice from [`Self::begin_write`].
    pub fn complete_write(&mut self, num_bytes: usize) {
        assert!(
            self.write_pos + num_bytes <= self.capacity(),
            "committing {num_bytes} bytes with only {} available",
            self.available()
        );
        self.write_pos += num_bytes;
    }

    /// Copies `bytes` in, growing the buffer if needed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.begin_write(bytes.len())?[..bytes.len()].copy_from_slice(bytes);
        self.complete_write(bytes.len());
        Ok(())
    }

    /// Number of unfilled bytes.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.write_pos
    }

    /// Forgets the written bytes that were not read yet.
    #[inline]
    pub fn discard_written(&mut self) {
        self.write_pos = self.read_pos;
    }

    /// Resets both cursors.
    #[inline]
    pub fn discard_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    fn capacity_advice(&self, at_least: usize) -> usize {
        let grow_by = at_least.max((self.capacity() * 2 - self.available()).max(DEFAULT_MIN_BUFFER_SIZE));
        (self.capacity() + grow_by).min(self.max_size)
    }

    fn ensure_capacity(&mut self, at_least: usize) -> Result<(), BufferError> {
        if at_least <= self.available() {
            return Ok(());
        }

        let new_capacity = self.capacity_advice(at_least);
        if new_capacity.saturating_sub(self.size()) < at_least {
            return Err(BufferError::CapacityExceeded {
                requested: at_least,
                max_size: self.max_size,
            });
        }

        trace!("io_buffer: growing {} -> {new_capacity}", self.capacity());
        self.data.resize(new_capacity, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_capacity_is_at_least_the_minimum() {
        let buffer = IoBuffer::new(10, 1024 * 1024).unwrap();
        assert_eq!(DEFAULT_MIN_BUFFER_SIZE, buffer.capacity());
        assert_eq!(0, buffer.size());
        assert_eq!(0, buffer.non_read());

        let buffer = IoBuffer::new(5000, 1024 * 1024).unwrap();
        assert_eq!(5000, buffer.capacity());
    }

    #[test]
    fn initial_size_over_max_fails() {
        assert_eq!(
            Some(BufferError::CapacityExceeded {
                requested: 2048,
                max_size: 1024
            }),
            IoBuffer::new(2048, 1024).err()
        );
    }

    #[test]
    fn write_then_read_in_two_phases() {
        let mut buffer = IoBuffer::new(16, 4096).unwrap();
        let room = buffer.begin_write(5).unwrap();
        room[..5].copy_from_slice(b"hello");
        buffer.complete_write(5);

        assert_eq!(b"hello", buffer.begin_read());
        assert_eq!(b"he", buffer.complete_read(2));
        assert_eq!(3, buffer.non_read());
        assert_eq!(5, buffer.size());

        assert_eq!(b"llo", buffer.complete_read(3));
        // Drained, both cursors are back at zero.
        assert_eq!(0, buffer.size());
        assert_eq!(buffer.capacity(), buffer.available());
    }

    #[test]
    fn read_until_terminator() {
        let mut buffer = IoBuffer::new(64, 4096).unwrap();
        buffer.write(b"get key\r\nset").unwrap();

        assert_eq!(b"get key\r\n", buffer.try_read_until(b"\r\n"));
        assert_eq!(b"set", buffer.begin_read());

        // No terminator yet, nothing is consumed.
        assert!(buffer.try_read_until(b"\r\n").is_empty());
        assert_eq!(3, buffer.non_read());

        buffer.write(b" k 0\r\n").unwrap();
        assert_eq!(b"set k 0\r\n", buffer.try_read_until(b"\r\n"));
        assert_eq!(0, buffer.size());
    }

    #[test]
    fn grows_and_keeps_unread_data() {
        let mut buffer = IoBuffer::new(DEFAULT_MIN_BUFFER_SIZE, 64 * 1024).unwrap();
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        buffer.write(&payload[..1000]).unwrap();
        buffer.write(&payload[1000..]).unwrap();

        assert!(buffer.capacity() >= 3000);
        assert_eq!(payload.as_slice(), buffer.begin_read());
    }

    #[test]
    fn growth_is_capped_by_max_size() {
        let mut buffer = IoBuffer::new(1024, 4096).unwrap();
        buffer.write(&[1; 3000]).unwrap();
        assert!(buffer.capacity() >= 3000 && buffer.capacity() <= 4096);

        assert_eq!(
            Err(BufferError::CapacityExceeded {
                requested: 2000,
                max_size: 4096
            }),
            buffer.begin_write(2000).map(|room| room.len())
        );
        assert_eq!(3000, buffer.size());
    }

    #[test]
    fn discard_written_and_all() {
        let mut buffer = IoBuffer::default();
        buffer.write(b"abcdef").unwrap();
        buffer.complete_read(2);
        buffer.discard_written();
        assert_eq!(0, buffer.non_read());
        assert_eq!(2, buffer.size());

        buffer.discard_all();
        assert_eq!(0, buffer.size());
    }

    #[test]
    #[should_panic(expected = "only 3 unread")]
    fn over_read_panics() {
        let mut buffer = IoBuffer::default();
        buffer.write(b"abc").unwrap();
        buffer.complete_read(4);
    }
}
