//! Growable byte buffer with separate read and write cursors.
//!
//! The layout follows the classic prependable / readable / writable split:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=       read_pos     <=     write_pos    <=    capacity
//! ```
//!
//! Readable bytes are always contiguous, so [`Buffer::peek`] can hand out a
//! single slice. When the writable tail is too small the buffer first tries to
//! reclaim the prependable space by moving the content to the front, and only
//! reallocates when that is not enough.

use std::io::{self, IoSliceMut, Read, Write};

use bytes::Buf;

/// Initial capacity of a new buffer
const INIT_BUFFER_SIZE: usize = 1024;

/// Size of the stack region used to spill reads that do not fit in the buffer
const EXTRA_READ_SIZE: usize = 64 * 1024;

/// Growable byte buffer used for socket reads, socket writes and response assembly.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INIT_BUFFER_SIZE)
    }
}

impl Buffer {
    /// Creates an empty buffer with 1 KiB of writable space.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], read_pos: 0, write_pos: 0 }
    }

    /// Total size of the backing storage.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written but not yet retrieved.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes that can be appended without moving or growing the storage.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Already retrieved bytes in front of the readable region, reclaimed by compaction.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// `true` when nothing is readable.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Returns the readable region.
    ///
    /// The slice is only valid until the next mutating call, which the borrow checker enforces.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Returns the writable tail, to be followed by [`Buffer::has_written`].
    #[inline]
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    /// Grows the buffer so that at least `len` bytes are writable. Never shrinks.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Marks `len` bytes of the writable tail as filled.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`Buffer::writable_bytes`].
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes(), "has_written {len} exceeds writable {}", self.writable_bytes());
        self.write_pos += len;
    }

    /// Consumes `len` readable bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`Buffer::readable_bytes`].
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes(), "retrieve {len} exceeds readable {}", self.readable_bytes());
        self.read_pos += len;
    }

    /// Consumes the readable bytes up to `end`, an offset into [`Buffer::peek`].
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Resets both cursors and zeroes the storage.
    pub fn retrieve_all(&mut self) {
        self.buf.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Takes the readable region out as an owned vector and resets the buffer.
    pub fn retrieve_all_to_vec(&mut self) -> Vec<u8> {
        let content = self.peek().to_vec();
        self.retrieve_all();
        content
    }

    /// Like [`Buffer::retrieve_all_to_vec`], decoding invalid UTF-8 lossily.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let content = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        content
    }

    /// Offset of the first `\r\n` inside the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|window| window == b"\r\n")
    }

    /// Copies `data` to the end of the readable region, making room first.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Appends the readable region of `other` without consuming it.
    pub fn append_buffer(&mut self, other: &Buffer) {
        self.append(other.peek());
    }

    /// Reads from `reader` with one vectored call into the writable tail and a
    /// 64 KiB stack region, appending whatever spilled into the stack region.
    ///
    /// A `WouldBlock` error is returned as is; the caller decides whether it is fatal.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ_SIZE];
        let writable = self.writable_bytes();

        let len = {
            let tail = &mut self.buf[self.write_pos..];
            let mut slices = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            reader.read_vectored(&mut slices)?
        };

        if len <= writable {
            self.write_pos += len;
        } else {
            self.write_pos = self.buf.len();
            self.append(&extra[..len - writable]);
        }
        Ok(len)
    }

    /// Writes the readable region with a single call and consumes exactly the accepted bytes.
    ///
    /// Partial writes are expected; the remaining bytes stay readable for the next attempt.
    pub fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let len = writer.write(self.peek())?;
        self.read_pos += len;
        Ok(len)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
            debug_assert_eq!(readable, self.readable_bytes());
        }
    }
}

/// Allows formatted appends: `write!(buffer, "HTTP/1.1 {} {}\r\n", code, reason)`.
impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Lets the readable region take part in `bytes` chains, such as the response
/// header followed by the mapped file in [`HttpConn::write`](crate::connection::HttpConn::write).
impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    fn chunk(&self) -> &[u8] {
        self.peek()
    }

    fn advance(&mut self, cnt: usize) {
        self.retrieve(cnt);
    }
}
