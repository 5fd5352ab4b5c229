//! Growable byte buffer used for connection input/output queues.

use std::io::{self, Read};
use std::os::unix::io::RawFd;

use crate::sockets;

/// Buffer reinitializes (shrinks back to a small allocation) once it has
/// drained below this many bytes while holding more than this much capacity.
const REINIT_THRESHOLD: usize = 1024 * 1024;
const EXTRA_PAGE: usize = 65536;

/// Linear byte buffer with separate read/write cursors.
///
/// `append` and `read_from_fd` grow the writable tail; `skip` advances the
/// read cursor. Unread bytes are always preserved across a grow.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self { data: Vec::new(), read_index: 0, write_index: 0 }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { data: vec![0u8; cap], read_index: 0, write_index: 0 }
    }

    /// Readable bytes.
    pub fn len(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unread bytes, as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Ensure at least `extra` bytes of writable space after `write_index`,
    /// compacting (moving unread bytes to the front) before growing if that
    /// alone makes enough room.
    pub fn reserve(&mut self, extra: usize) {
        let writable = self.data.len() - self.write_index;
        if writable >= extra {
            return;
        }
        let readable = self.len();
        if self.read_index + writable >= extra {
            // Compacting is enough: slide unread bytes to the front.
            self.data.copy_within(self.read_index..self.write_index, 0);
            self.write_index = readable;
            self.read_index = 0;
        } else {
            self.data.resize(self.write_index + extra, 0);
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data[self.write_index..self.write_index + bytes.len()].copy_from_slice(bytes);
        self.write_index += bytes.len();
    }

    /// Drop `n` bytes from the front of the readable region. `n` is clamped
    /// to the current length. Resets both cursors to 0 once fully drained,
    /// and reinitializes the backing storage if it has grown large and gone
    /// idle.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.len());
        self.read_index += n;
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
            if self.data.len() > REINIT_THRESHOLD {
                self.reinit();
            }
        }
    }

    /// Shrink the backing storage back to empty. Only sensible to call when
    /// the buffer is already drained.
    pub fn reinit(&mut self) {
        self.data = Vec::new();
        self.read_index = 0;
        self.write_index = 0;
    }

    /// Read as much as is available from `fd` into the buffer in a single
    /// syscall, using an on-stack extra page so a mostly-full buffer doesn't
    /// force a second read once it learns how much data is actually pending.
    /// Returns `Ok(0)` on EOF, `Ok(n)` for `n` bytes read, or propagates
    /// hard I/O errors (`WouldBlock`/`Interrupted` included, for the caller
    /// to filter via [`crate::error::is_transient_io`]).
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let writable = self.data.len() - self.write_index;
        let mut extra = [0u8; EXTRA_PAGE];

        // A zero-length IoSliceMut (when the buffer has no writable tail
        // left) is a valid, no-op vector entry, so both slices are always
        // passed in one syscall.
        let mut iovs = [
            io::IoSliceMut::new(&mut self.data[self.write_index..]),
            io::IoSliceMut::new(&mut extra),
        ];

        let n = sockets::readv(fd, &mut iovs)?;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            let spill = n - writable;
            self.append(&extra[..spill]);
        }
        Ok(n)
    }

    /// For callers that already have bytes in hand (e.g. the `rustls`
    /// plaintext reader) and just want to fill the input buffer directly.
    pub fn append_from_reader<R: Read>(&mut self, mut r: R, max: usize) -> io::Result<usize> {
        self.reserve(max);
        let start = self.write_index;
        let n = r.read(&mut self.data[start..start + max])?;
        self.write_index += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_skip_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.as_slice(), b"hello world");
        buf.skip(6);
        assert_eq!(buf.as_slice(), b"world");
        buf.skip(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn reserve_compacts_before_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789");
        buf.skip(8);
        assert_eq!(buf.as_slice(), b"89");
        buf.append(b"abcdefgh");
        assert_eq!(buf.as_slice(), b"89abcdefgh");
        assert!(buf.capacity() <= 32);
    }

    #[test]
    fn reinit_only_fires_once_drained_and_oversized() {
        let mut buf = Buffer::new();
        buf.reserve(REINIT_THRESHOLD + 1);
        buf.append(b"x");
        assert!(buf.capacity() > REINIT_THRESHOLD);
        buf.skip(1);
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn reserve_compacts_even_with_a_large_readable_region() {
        // read_index=10, write_index=20 (10 readable bytes), capacity=24
        // (4 writable bytes). Requesting 12 more bytes: compaction alone
        // frees capacity(24) - readable(10) = 14 >= 12, so this must not
        // trigger a reallocation.
        let mut buf = Buffer::with_capacity(24);
        buf.append(&[0u8; 20]);
        buf.skip(10);
        assert_eq!(buf.len(), 10);
        buf.reserve(12);
        assert_eq!(buf.capacity(), 24);
    }

    #[test]
    fn never_drops_unread_bytes_across_growth() {
        let mut buf = Buffer::with_capacity(4);
        for chunk in [b"ab".as_slice(), b"cd", b"ef", b"gh"] {
            buf.append(chunk);
        }
        assert_eq!(buf.as_slice(), b"abcdefgh");
    }
}
