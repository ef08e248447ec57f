// Copyright 2025 CloudWeGo Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    os::fd::{BorrowedFd, RawFd},
    ptr,
};

use nix::unistd;

use crate::{buffer::value_bytes, error::Error};

/// A contiguous linear buffer with independent read and write cursors.
///
/// Designed as a single-threaded staging area for fd I/O: fill it with
/// `write_*` or [`input_from_fd`](Self::input_from_fd), drain it with
/// `read_*` or [`output_to_fd`](Self::output_to_fd). Capacity-changing
/// operations must never overlap any read or write.
///
/// Cursor violations are programming errors and panic; only fd operations
/// return [`Error`].
#[derive(Debug, Default)]
pub struct LinearBuffer {
    buf: Vec<u8>,
    wpos: usize,
    rpos: usize,
}

impl LinearBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            wpos: 0,
            rpos: 0,
        }
    }

    pub fn reserve(&mut self, capacity: usize) {
        self.buf.resize(capacity, 0);
    }

    pub fn enlarge(&mut self, additional: usize) {
        let capacity = self.buf.len() + additional;
        self.buf.resize(capacity, 0);
    }

    pub fn reset(&mut self, capacity: usize) {
        self.reserve(capacity);
        self.wpos = 0;
        self.rpos = 0;
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        assert!(
            self.wpos + data.len() <= self.buf.len(),
            "write past the reserved capacity"
        );
        self.buf[self.wpos..self.wpos + data.len()].copy_from_slice(data);
        self.wpos += data.len();
    }

    /// Copies the raw host representation of `value`. `T` must be plain data
    /// without padding; the bytes are readable back with
    /// [`read_value`](Self::read_value) on the same machine only.
    pub fn write_value<T: Copy>(&mut self, value: &T) {
        self.write_bytes(value_bytes(value));
    }

    /// Writes an 8-byte host-order length prefix followed by the bytes of `s`.
    pub fn write_str(&mut self, s: &str) {
        self.write_value(&s.len());
        self.write_bytes(s.as_bytes());
    }

    pub fn read_bytes(&mut self, len: usize) -> &[u8] {
        assert!(self.rpos + len <= self.wpos, "read past the write cursor");
        let res = &self.buf[self.rpos..self.rpos + len];
        self.rpos += len;
        res
    }

    pub fn read_value<T: Copy>(&mut self) -> T {
        let bytes = self.read_bytes(size_of::<T>());
        unsafe { ptr::read_unaligned(bytes.as_ptr().cast::<T>()) }
    }

    /// Reads a frame produced by [`write_str`](Self::write_str) and returns an
    /// owned copy.
    pub fn get_string(&mut self) -> String {
        let len = self.read_value::<usize>();
        let bytes = self.read_bytes(len);
        String::from_utf8(bytes.to_vec()).expect("length-prefixed payload is not valid utf-8")
    }

    /// One `read(2)` into the unwritten region. Partial progress is normal.
    pub fn input_from_fd(&mut self, fd: RawFd) -> Result<usize, Error> {
        let wpos = self.wpos;
        match unistd::read(fd, &mut self.buf[wpos..]) {
            Ok(len) => {
                self.wpos += len;
                Ok(len)
            }
            Err(err) => Err(Error::Io(std::io::Error::from_raw_os_error(err as i32))),
        }
    }

    /// One `write(2)` from the unread region. Partial progress is normal.
    pub fn output_to_fd(&mut self, fd: RawFd) -> Result<usize, Error> {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        match unistd::write(fd, &self.buf[self.rpos..self.wpos]) {
            Ok(len) => {
                self.rpos += len;
                Ok(len)
            }
            Err(err) => Err(Error::Io(std::io::Error::from_raw_os_error(err as i32))),
        }
    }

    /// The unwritten tail of the buffer, for callers that fill it directly
    /// and then [`advance_write`](Self::advance_write).
    pub fn writable(&mut self) -> &mut [u8] {
        let wpos = self.wpos;
        &mut self.buf[wpos..]
    }

    /// The unread region.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.rpos..self.wpos]
    }

    pub fn advance_write(&mut self, n: usize) {
        assert!(self.wpos + n <= self.buf.len());
        self.wpos += n;
    }

    pub fn advance_read(&mut self, n: usize) {
        assert!(self.rpos + n <= self.wpos);
        self.rpos += n;
    }

    #[inline]
    pub fn wpos(&self) -> usize {
        self.wpos
    }

    #[inline]
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Total bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.wpos
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written but not yet read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.wpos - self.rpos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.wpos == self.rpos
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use rand::Rng;

    use super::LinearBuffer;

    #[test]
    fn test_linear_buffer_read_write() {
        let mut buf = LinearBuffer::with_capacity(1024);
        assert!(buf.is_empty());

        buf.write_value(&7u32);
        buf.write_value(&-1i64);
        buf.write_bytes(b"abc");
        assert_eq!(4 + 8 + 3, buf.remaining());

        assert_eq!(7u32, buf.read_value::<u32>());
        assert_eq!(-1i64, buf.read_value::<i64>());
        assert_eq!(b"abc", buf.read_bytes(3));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_linear_buffer_string_frames() {
        let mut buf = LinearBuffer::with_capacity(256);
        buf.write_str("hi");
        buf.write_str("");
        buf.write_str("world!");

        assert_eq!("hi", buf.get_string());
        assert_eq!("", buf.get_string());
        assert_eq!("world!", buf.get_string());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_linear_buffer_reset_enlarge() {
        let mut buf = LinearBuffer::new();
        buf.reserve(16);
        assert_eq!(16, buf.capacity());
        buf.enlarge(16);
        assert_eq!(32, buf.capacity());

        buf.write_bytes(&[1u8; 32]);
        buf.reset(64);
        assert_eq!(64, buf.capacity());
        assert_eq!(0, buf.len());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_linear_buffer_direct_fill() {
        let mut buf = LinearBuffer::with_capacity(128);
        let mut data = [0u8; 100];
        rand::rng().fill(&mut data[..]);

        buf.writable()[..100].copy_from_slice(&data);
        buf.advance_write(100);
        assert_eq!(&data[..], buf.readable());
        buf.advance_read(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_linear_buffer_fd_round_trip() {
        let (pipe_rx, pipe_tx) = nix::unistd::pipe().unwrap();

        let mut out = LinearBuffer::with_capacity(512);
        let mut data = [0u8; 512];
        rand::rng().fill(&mut data[..]);
        out.write_bytes(&data);

        let mut sent = 0;
        while sent < 512 {
            sent += out.output_to_fd(pipe_tx.as_raw_fd()).unwrap();
        }
        drop(pipe_tx);

        let mut input = LinearBuffer::with_capacity(512);
        let mut received = 0;
        while received < 512 {
            received += input.input_from_fd(pipe_rx.as_raw_fd()).unwrap();
        }
        assert_eq!(&data[..], input.readable());
    }

    #[test]
    #[should_panic(expected = "write past the reserved capacity")]
    fn test_linear_buffer_overflow_panics() {
        let mut buf = LinearBuffer::with_capacity(8);
        buf.write_bytes(&[0u8; 9]);
    }
}
