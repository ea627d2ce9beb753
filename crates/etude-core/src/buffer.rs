// src/buffer.rs
//! Growable byte buffer with independent read and write cursors.
//!
//! Layout of the backing storage:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=       read_pos     <=    write_pos    <=     capacity
//! ```
//!
//! Cursor violations are programming errors and panic.

use memchr::memmem;

pub const INITIAL_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new(initial_size: usize) -> Self {
        Self {
            buf: vec![0; initial_size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline(always)]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline(always)]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    #[inline(always)]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Readable region, starting at the read cursor.
    #[inline(always)]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Writable region, starting at the write cursor. Pair with [`Buffer::has_written`]
    /// after filling it through an external syscall such as `readv`.
    #[inline(always)]
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(
            len <= self.writable_bytes(),
            "has_written({len}) exceeds writable space {}",
            self.writable_bytes()
        );
        self.write_pos += len;
    }

    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve({len}) exceeds readable bytes {}",
            self.readable_bytes()
        );
        self.read_pos += len;
    }

    /// Advances the read cursor past the first occurrence of `delim`.
    /// Leaves the buffer untouched and returns `false` if `delim` is absent.
    pub fn retrieve_until(&mut self, delim: &[u8]) -> bool {
        match self.find(delim) {
            Some(idx) => {
                self.retrieve(idx + delim.len());
                true
            }
            None => false,
        }
    }

    pub fn retrieve_all(&mut self) {
        self.buf.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_to_vec(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.retrieve_all();
        out
    }

    /// Offset of `needle` relative to [`Buffer::peek`].
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        memmem::find(self.peek(), needle)
    }

    pub fn append(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.prependable_bytes() + self.writable_bytes() < len {
            self.buf.resize(self.write_pos + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(INITIAL_BUFFER_SIZE)
    }
}
