use std::io;
use std::os::unix::io::RawFd;

/// A growable byte queue backed by one contiguous allocation.
///
/// The layout keeps three regions:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=   writer_index    <=    len
/// ```
///
/// Appends go in at the back, reads come out of the front, and the small
/// prepend area lets a protocol layer stamp a length field in front of a
/// payload without copying it. When the back runs out of room the readable
/// content is either shifted toward the prepend area or the allocation
/// grows.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

/// Reserved space in front of the readable region.
pub const PREPEND_SIZE: usize = 8;
/// Default capacity of the writable region for a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; PREPEND_SIZE + initial],
            reader_index: PREPEND_SIZE,
            writer_index: PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Offset of the first `\r\n` in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Offset of the first `\n` in the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Consumes `len` bytes from the front.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything up to (but not including) offset `end` of the
    /// readable region.
    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end <= self.readable_bytes());
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = PREPEND_SIZE;
        self.writer_index = PREPEND_SIZE;
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let result = self.peek().to_vec();
        self.retrieve_all();
        result
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` immediately in front of the readable region.
    ///
    /// Panics if `data` is longer than the prependable area.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Drops spare capacity down to the readable content plus `reserve`.
    pub fn shrink(&mut self, reserve: usize) {
        self.compact();
        let readable = self.readable_bytes();
        self.buf.truncate(PREPEND_SIZE + readable + reserve);
        self.buf.shrink_to_fit();
    }

    /// Scatter-reads from `fd` into the writable region plus a 64 KiB stack
    /// area, so one syscall can pull in more than the buffer currently has
    /// room for. Overflow into the stack area is appended afterwards.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_ptr(), iovcnt))? as usize;

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + PREPEND_SIZE {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            self.compact();
        }
    }

    /// Moves the readable content back against the prepend area.
    fn compact(&mut self) {
        let readable = self.readable_bytes();
        self.buf
            .copy_within(self.reader_index..self.writer_index, PREPEND_SIZE);
        self.reader_index = PREPEND_SIZE;
        self.writer_index = PREPEND_SIZE + readable;
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);

        let payload = vec![b'x'; 200];
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), 200);

        let s = buf.retrieve_as_string(50);
        assert_eq!(s.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE + 50);

        let rest = buf.retrieve_all_as_string();
        assert_eq!(rest.len(), 150);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
    }

    #[test]
    fn round_trip_preserves_content() {
        let mut buf = Buffer::new();
        buf.append(b"hello, reactor");
        assert_eq!(buf.retrieve_all_as_string(), "hello, reactor");
    }

    #[test]
    fn grow() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.append(&vec![b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1400);

        buf.retrieve(1400);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn compacts_inside_allocation() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(700);
        // 100 readable left; room exists once the front space is reclaimed
        let len_before = buf.buf.len();
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.buf.len(), len_before);
        assert_eq!(buf.readable_bytes(), 500);
    }

    #[test]
    fn prepend_in_front() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE - 4);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_eol(), Some(15));

        buf.retrieve_until(16);
        assert_eq!(buf.find_crlf(), None);
        assert_eq!(buf.find_eol(), Some(7));
    }

    #[test]
    fn shrink_releases_capacity() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'q'; 4000]);
        buf.retrieve(3900);
        buf.shrink(16);
        assert_eq!(buf.readable_bytes(), 100);
        assert_eq!(buf.retrieve_all_as_string(), "q".repeat(100));
    }

    #[test]
    fn read_fd_overflows_into_extra_space() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let payload = vec![b'p'; 2000];
        let n = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(n, 2000);

        let mut buf = Buffer::with_capacity(128);
        let got = buf.read_fd(fds[0]).unwrap();
        assert_eq!(got, 2000);
        assert_eq!(buf.readable_bytes(), 2000);
        assert!(buf.peek().iter().all(|&b| b == b'p'));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
