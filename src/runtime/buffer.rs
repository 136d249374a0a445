//! Chained byte stream for queueing question text.
//!
//! A `ByteStream` is an ordered chain of buffers, each either borrowed or
//! copied:
//!
//! - **Borrowed** buffers hold a shared reference (`Bytes`) to text owned
//!   elsewhere, typically a question or a static trailer. Appending one is
//!   O(1) and never copies.
//! - **Copied** buffers own fixed-size storage and are filled by pulling
//!   from a producer. A write tops up the tail buffer before allocating a
//!   new one, so a run of small writes does not fragment the chain.
//!
//! Reads drain from the head and drop every buffer they empty. The stream
//! keeps a running count of unread bytes, so `len()` is O(1).
//!
//! ## Producers and consumers
//!
//! `write` and `read` take closures, which keeps the chain logic
//! independent of where bytes come from or go to. Convenience wrappers bind
//! them to memory, to any `Read`/`Write` (buffered files, sockets), and to
//! raw descriptors.
//!
//! None of the operations fail loudly: they return the number of bytes
//! moved, and 0 when nothing could be moved (empty stream, short producer,
//! accounting overflow, allocation failure).

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};

/// Capacity of each copied buffer.
pub const COPIED_BUFFER_SIZE: usize = 256;

/// Fixed-size owned storage with independent read and write cursors.
///
/// `offset + len + free == COPIED_BUFFER_SIZE` holds after every operation.
#[derive(Debug)]
struct CopiedBuffer {
    bytes: Box<[u8]>,
    /// Bytes already read.
    offset: usize,
    /// Bytes available to read.
    len: usize,
    /// Bytes available to write.
    free: usize,
}

impl CopiedBuffer {
    /// Allocate a buffer, or `None` if the allocator refuses.
    fn try_new() -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(COPIED_BUFFER_SIZE).ok()?;
        bytes.resize(COPIED_BUFFER_SIZE, 0);

        Some(Self {
            bytes: bytes.into_boxed_slice(),
            offset: 0,
            len: 0,
            free: COPIED_BUFFER_SIZE,
        })
    }

    fn write<F>(&mut self, pull: &mut F, len: usize) -> usize
    where
        F: FnMut(&mut [u8]) -> usize,
    {
        let want = len.min(self.free);
        if want == 0 {
            return 0;
        }

        let start = self.offset + self.len;
        let written = pull(&mut self.bytes[start..start + want]);
        assert!(
            written <= want,
            "producer reported {written} bytes for a {want} byte slot"
        );

        self.free -= written;
        self.len += written;
        debug_assert_eq!(self.offset + self.len + self.free, COPIED_BUFFER_SIZE);

        written
    }

    fn read<F>(&mut self, push: &mut F, len: usize) -> usize
    where
        F: FnMut(&[u8]) -> usize,
    {
        let want = len.min(self.len);
        if want == 0 {
            return 0;
        }

        let read = push(&self.bytes[self.offset..self.offset + want]);
        assert!(
            read <= want,
            "consumer reported {read} bytes for a {want} byte slice"
        );

        self.offset += read;
        self.len -= read;
        debug_assert_eq!(self.offset + self.len + self.free, COPIED_BUFFER_SIZE);

        read
    }
}

/// One link of the chain.
#[derive(Debug)]
enum Buffer {
    /// Shared read-only bytes; advanced in place as they are read.
    Borrowed(Bytes),
    /// Owned fixed-size storage.
    Copied(CopiedBuffer),
}

impl Buffer {
    fn write<F>(&mut self, pull: &mut F, len: usize) -> usize
    where
        F: FnMut(&mut [u8]) -> usize,
    {
        match self {
            Buffer::Borrowed(_) => 0,
            Buffer::Copied(buf) => buf.write(pull, len),
        }
    }

    fn read<F>(&mut self, push: &mut F, len: usize) -> usize
    where
        F: FnMut(&[u8]) -> usize,
    {
        match self {
            Buffer::Borrowed(bytes) => {
                let want = len.min(bytes.len());
                if want == 0 {
                    return 0;
                }

                let read = push(&bytes[..want]);
                assert!(
                    read <= want,
                    "consumer reported {read} bytes for a {want} byte slice"
                );
                bytes.advance(read);
                read
            }
            Buffer::Copied(buf) => buf.read(push, len),
        }
    }

    /// Unread bytes in this buffer.
    fn remaining(&self) -> usize {
        match self {
            Buffer::Borrowed(bytes) => bytes.len(),
            Buffer::Copied(buf) => buf.len,
        }
    }

    fn readable(&self) -> bool {
        self.remaining() > 0
    }

    fn writable(&self) -> bool {
        match self {
            Buffer::Borrowed(_) => false,
            Buffer::Copied(buf) => buf.free > 0,
        }
    }
}

/// An ordered chain of borrowed and copied buffers.
///
/// # Example
///
/// ```ignore
/// let mut stream = ByteStream::new();
/// stream.write_borrow(Bytes::from_static(b"AB"));
/// stream.write_borrow(Bytes::from_static(b"CD"));
///
/// let mut out = [0u8; 3];
/// assert_eq!(stream.read_into(&mut out), 3); // "ABC"
/// assert_eq!(stream.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ByteStream {
    chain: VecDeque<Buffer>,
    /// Sum of unread bytes across the chain.
    total_len: usize,
}

impl ByteStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total unread bytes.
    pub fn len(&self) -> usize {
        self.total_len
    }

    /// Check if there is nothing left to read.
    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Number of buffers currently linked in the chain.
    pub fn buffer_count(&self) -> usize {
        self.chain.len()
    }

    /// Append `bytes` without copying.
    ///
    /// Returns the number of bytes appended, or 0 (with no state change) if
    /// `bytes` is empty, the length counter would overflow, or the chain
    /// cannot grow.
    pub fn write_borrow(&mut self, bytes: Bytes) -> usize {
        let len = bytes.len();
        if len == 0 {
            return 0;
        }

        let Some(total_len) = self.total_len.checked_add(len) else {
            return 0;
        };
        if self.chain.try_reserve(1).is_err() {
            return 0;
        }

        self.chain.push_back(Buffer::Borrowed(bytes));
        self.total_len = total_len;
        self.debug_check_len();

        len
    }

    /// Pull up to `len` bytes from `pull` into copied buffers.
    ///
    /// `pull` is handed a destination slice and returns how many bytes it
    /// filled. Returning less than the slice length marks a short read
    /// (EOF, would-block, error) and ends the write.
    ///
    /// Returns the number of bytes actually stored, which is less than
    /// `len` after a short read or an allocation failure.
    pub fn write<F>(&mut self, mut pull: F, len: usize) -> usize
    where
        F: FnMut(&mut [u8]) -> usize,
    {
        if len == 0 || self.total_len.checked_add(len).is_none() {
            return 0;
        }

        let mut written = 0;

        // Top up the tail first. If it is still writable afterwards the
        // producer ran dry, either because the request is satisfied or
        // because it came up short.
        if let Some(tail) = self.chain.back_mut() {
            written += tail.write(&mut pull, len);
            if written == len || tail.writable() {
                self.total_len += written;
                self.debug_check_len();
                return written;
            }
        }

        while written < len {
            let Some(mut buffer) = CopiedBuffer::try_new() else {
                break;
            };
            if self.chain.try_reserve(1).is_err() {
                break;
            }

            let n = buffer.write(&mut pull, len - written);
            if n == 0 {
                break;
            }
            written += n;

            let short = buffer.free > 0;
            self.chain.push_back(Buffer::Copied(buffer));
            if short {
                break;
            }
        }

        self.total_len += written;
        self.debug_check_len();

        written
    }

    /// Push up to `len` bytes from the head of the chain into `push`.
    ///
    /// `push` is handed a source slice and returns how many bytes it
    /// consumed. A buffer left with unread bytes ends the read; fully
    /// drained buffers are unlinked and dropped.
    pub fn read<F>(&mut self, mut push: F, len: usize) -> usize
    where
        F: FnMut(&[u8]) -> usize,
    {
        let mut read = 0;

        while read < len {
            let Some(head) = self.chain.front_mut() else {
                break;
            };

            read += head.read(&mut push, len - read);
            if head.readable() {
                break;
            }

            self.chain.pop_front();
        }

        self.total_len -= read;
        self.debug_check_len();

        read
    }

    /// Drop every buffer, read or not, and reset to empty.
    pub fn flush(&mut self) {
        self.chain.clear();
        self.total_len = 0;
    }

    /// Copy `src` into the stream.
    pub fn write_slice(&mut self, src: &[u8]) -> usize {
        let mut rest = src;
        self.write(
            |dest| {
                let n = dest.len().min(rest.len());
                dest[..n].copy_from_slice(&rest[..n]);
                rest = &rest[n..];
                n
            },
            src.len(),
        )
    }

    /// Pull up to `len` bytes from a reader, such as a `BufReader<File>`.
    pub fn write_from<R>(&mut self, reader: &mut R, len: usize) -> usize
    where
        R: Read + ?Sized,
    {
        self.write(|dest| read_retrying(reader, dest), len)
    }

    /// Pull up to `len` bytes straight from a descriptor with `read(2)`.
    pub fn write_fd(&mut self, fd: BorrowedFd<'_>, len: usize) -> usize {
        let raw = fd.as_raw_fd();
        self.write(
            |dest| {
                // SAFETY: `dest` is a valid writable slice for its full length
                // and `raw` stays open for the duration of the borrow.
                let n = unsafe { libc::read(raw, dest.as_mut_ptr().cast(), dest.len()) };
                usize::try_from(n).unwrap_or(0)
            },
            len,
        )
    }

    /// Copy up to `dest.len()` bytes out of the stream.
    pub fn read_into(&mut self, dest: &mut [u8]) -> usize {
        let len = dest.len();
        let mut filled = 0;
        self.read(
            |src| {
                dest[filled..filled + src.len()].copy_from_slice(src);
                filled += src.len();
                src.len()
            },
            len,
        )
    }

    /// Push up to `len` bytes into a writer.
    pub fn read_to<W>(&mut self, writer: &mut W, len: usize) -> usize
    where
        W: Write + ?Sized,
    {
        self.read(|src| write_retrying(writer, src), len)
    }

    /// Push up to `len` bytes straight into a descriptor with `write(2)`.
    pub fn read_fd(&mut self, fd: BorrowedFd<'_>, len: usize) -> usize {
        let raw = fd.as_raw_fd();
        self.read(
            |src| {
                // SAFETY: `src` is a valid readable slice for its full length
                // and `raw` stays open for the duration of the borrow.
                let n = unsafe { libc::write(raw, src.as_ptr().cast(), src.len()) };
                usize::try_from(n).unwrap_or(0)
            },
            len,
        )
    }

    fn debug_check_len(&self) {
        debug_assert_eq!(
            self.total_len,
            self.chain.iter().map(Buffer::remaining).sum::<usize>(),
            "stream length out of sync with its chain"
        );
    }
}

/// One `read` call, retried on `Interrupted`; any other error reads as 0.
fn read_retrying<R: Read + ?Sized>(reader: &mut R, dest: &mut [u8]) -> usize {
    loop {
        match reader.read(dest) {
            Ok(n) => return n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return 0,
        }
    }
}

/// One `write` call, retried on `Interrupted`; any other error writes 0.
fn write_retrying<W: Write + ?Sized>(writer: &mut W, src: &[u8]) -> usize {
    loop {
        match writer.write(src) {
            Ok(n) => return n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return 0,
        }
    }
}
