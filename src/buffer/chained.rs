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
    collections::VecDeque,
    os::fd::{BorrowedFd, RawFd},
    ptr, slice,
};

use anyhow::anyhow;
use nix::unistd;

use super::{BufRead, BufWrite, block::Segment};
use crate::{
    consts::{LENGTH_PREFIX_SIZE, default_block_size},
    error::Error,
};

/// An unbounded single-threaded FIFO of fixed-size blocks.
///
/// Guarantees:
/// 1. The chain is never empty; its back is always the write tail
///    (`committed == None`).
/// 2. Block memory never moves.
/// 3. Bytes behind a returned borrow stay valid until a
///    [`clear_preserved`](BufRead::clear_preserved) call covers their block.
///
/// For the cross-thread variant see
/// [`SpscBlockBuffer`](super::spsc::SpscBlockBuffer).
#[derive(Debug)]
pub struct BlockBuffer {
    block_size: usize,
    chain: VecDeque<Segment>,
    free_list: VecDeque<Segment>,
    preserved: VecDeque<Segment>,
    rpos: usize,
    wpos: usize,
}

impl BlockBuffer {
    /// A buffer with page-sized blocks.
    pub fn new() -> Self {
        Self::with_block_size(default_block_size())
    }

    /// The block size is fixed for the buffer's lifetime and bounds every
    /// contiguous write and read.
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(
            block_size >= LENGTH_PREFIX_SIZE,
            "block_size must fit at least a length prefix"
        );
        let mut chain = VecDeque::new();
        chain.push_back(Segment::new(block_size));
        Self {
            block_size,
            chain,
            free_list: VecDeque::new(),
            preserved: VecDeque::new(),
            rpos: 0,
            wpos: 0,
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Reads from `fd` into the tail until the syscall fails or returns 0,
    /// rolling new blocks as needed. With `cont`, performs at most one
    /// syscall (a full tail is rolled first, so the read always has room).
    ///
    /// An error is returned only if no bytes were moved by this call;
    /// otherwise the partial count is returned and the error is left for the
    /// next call to observe.
    pub fn input_from_fd(&mut self, fd: RawFd, cont: bool) -> Result<usize, Error> {
        let mut total = 0;
        loop {
            self.add_block_if_full();

            let wpos = self.wpos;
            let room = self.block_size - wpos;
            let window = unsafe {
                slice::from_raw_parts_mut(self.chain.back_mut().unwrap().data.add(wpos), room)
            };
            match unistd::read(fd, window) {
                Err(err) => {
                    if total == 0 {
                        return Err(Error::Io(std::io::Error::from_raw_os_error(err as i32)));
                    }
                    break;
                }
                Ok(0) => break,
                Ok(len) => {
                    self.wpos += len;
                    total += len;
                    if cont {
                        break;
                    }
                }
            }
        }
        Ok(total)
    }

    /// Writes the readable bytes to `fd`, draining block by block, until the
    /// syscall fails or returns 0 or nothing is left. Fully drained non-tail
    /// blocks move to the preserved list.
    ///
    /// Error deferral matches [`input_from_fd`](Self::input_from_fd).
    pub fn output_to_fd(&mut self, fd: RawFd) -> Result<usize, Error> {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut total = 0;
        loop {
            let head = self.chain.front().unwrap();
            let end = head.committed.unwrap_or(self.wpos);
            let chunk = unsafe { slice::from_raw_parts(head.data.add(self.rpos), end - self.rpos) };
            match unistd::write(fd, chunk) {
                Err(err) => {
                    if total == 0 {
                        return Err(Error::Io(std::io::Error::from_raw_os_error(err as i32)));
                    }
                    tracing::warn!("output_to_fd deferring error after {} bytes: {}", total, err);
                    break;
                }
                Ok(0) => break,
                Ok(len) => {
                    self.rpos += len;
                    total += len;
                }
            }

            if self.chain.front().unwrap().committed == Some(self.rpos) {
                self.pop_block();
            }
        }
        Ok(total)
    }

    fn add_block(&mut self) {
        self.chain.back_mut().unwrap().committed = Some(self.wpos);
        self.wpos = 0;
        let tail = match self.free_list.pop_front() {
            Some(segment) => segment,
            None => Segment::new(self.block_size),
        };
        debug_assert!(tail.committed.is_none());
        self.chain.push_back(tail);
    }

    #[inline]
    fn add_block_if_full(&mut self) {
        if self.wpos == self.block_size {
            self.add_block();
        }
    }

    #[inline]
    fn add_block_for(&mut self, cont_write_len: usize) {
        if cont_write_len > self.block_size - self.wpos {
            self.add_block();
        }
    }

    fn pop_block(&mut self) {
        let head = self.chain.pop_front().unwrap();
        debug_assert!(head.committed.is_some());
        self.preserved.push_back(head);
        self.rpos = 0;
    }

    #[inline]
    fn pop_block_if_needed(&mut self, size: usize) {
        if let Some(committed) = self.chain.front().unwrap().committed {
            if committed - self.rpos < size {
                self.pop_block();
            }
        }
    }

    #[inline]
    fn head_available(&self) -> usize {
        let head = self.chain.front().unwrap();
        head.committed.unwrap_or(self.wpos) - self.rpos
    }
}

impl Default for BlockBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BufWrite for BlockBuffer {
    fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            self.add_block_if_full();

            let to_write = usize::min(data.len(), self.block_size - self.wpos);
            unsafe {
                ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    self.chain.back_mut().unwrap().data.add(self.wpos),
                    to_write,
                );
            }
            self.wpos += to_write;
            data = &data[to_write..];
        }
    }

    fn write_cont(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        assert!(
            data.len() <= self.block_size,
            "contiguous write larger than the block size"
        );
        self.add_block_for(data.len());

        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.chain.back_mut().unwrap().data.add(self.wpos),
                data.len(),
            );
        }
        self.wpos += data.len();
    }

    fn write_str(&mut self, s: &str) {
        self.write_value(&s.len());
        self.write_cont(s.as_bytes());
    }

    fn ensure_cont(&mut self, len: usize) -> &mut [u8] {
        assert!(
            len <= self.block_size,
            "contiguous window larger than the block size"
        );
        self.add_block_for(len);
        let wpos = self.wpos;
        unsafe { slice::from_raw_parts_mut(self.chain.back_mut().unwrap().data.add(wpos), len) }
    }
}

impl BufRead for BlockBuffer {
    fn read_cont(&mut self, len: usize) -> Result<&[u8], Error> {
        assert!(
            len <= self.block_size,
            "contiguous read larger than the block size"
        );
        self.pop_block_if_needed(len);
        if self.head_available() < len {
            return Err(Error::NotEnoughData);
        }

        let rpos = self.rpos;
        let res =
            unsafe { slice::from_raw_parts(self.chain.front().unwrap().data.add(rpos), len) };
        self.rpos += len;
        Ok(res)
    }

    fn get_string(&mut self) -> Result<String, Error> {
        let len = self.read_value::<usize>()?;
        let bytes = self.read_cont(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Others(anyhow!("length-prefixed payload is not valid utf-8")))
    }

    fn is_empty(&mut self) -> bool {
        self.chain.front().unwrap().committed.is_none() && self.rpos == self.wpos
    }

    fn clear_preserved(&mut self, len: usize) {
        let mut cleared = 0;
        while let Some(front) = self.preserved.front() {
            let committed = front.committed.unwrap();
            if cleared + committed > len {
                break;
            }
            cleared += committed;
            let mut segment = self.preserved.pop_front().unwrap();
            segment.committed = None;
            self.free_list.push_back(segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use rand::Rng;

    use super::BlockBuffer;
    use crate::buffer::{BufRead, BufWrite};

    #[test]
    fn test_framed_strings_single_block() {
        let mut buf = BlockBuffer::with_block_size(64);
        buf.write_str("hi");
        buf.write_str("world!");
        buf.write_str("");

        assert_eq!("hi", buf.get_string().unwrap());
        assert_eq!("world!", buf.get_string().unwrap());
        assert_eq!("", buf.get_string().unwrap());
        assert!(buf.is_empty());

        // 8 + 2 + 8 + 6 + 8 + 0 = 32 bytes: everything fit the initial block.
        assert_eq!(1, buf.chain.len());
        assert_eq!(0, buf.preserved.len());
        assert_eq!(0, buf.free_list.len());
    }

    #[test]
    fn test_block_rollover() {
        let mut buf = BlockBuffer::with_block_size(64);
        let mut blob = [0u8; 200];
        rand::rng().fill(&mut blob[..]);
        buf.write(&blob);
        assert_eq!(4, buf.chain.len());

        let value = [7u8; 10];
        buf.write_cont(&value);

        // The fragmenting write split the blob 64/64/64/8; reading it back
        // takes one contiguous borrow per block.
        let mut read_back = Vec::new();
        for chunk in [64, 64, 64, 8] {
            read_back.extend_from_slice(buf.read_cont(chunk).unwrap());
        }
        assert_eq!(&blob[..], &read_back[..]);

        // The contiguous value landed wholly within the tail block.
        let got = buf.read_cont(10).unwrap();
        assert_eq!(&value[..], got);
        let got_addr = got.as_ptr() as usize;
        let tail_data = buf.chain.back().unwrap().data as usize;
        assert!(got_addr >= tail_data && got_addr + 10 <= tail_data + 64);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_preserved_retention() {
        let mut buf = BlockBuffer::with_block_size(128);
        let mut data = [0u8; 300];
        rand::rng().fill(&mut data[..]);
        buf.write(&data);

        let mut pointers = Vec::new();
        for chunk in [128, 128, 44] {
            let read = buf.read_cont(chunk).unwrap();
            pointers.push((read.as_ptr(), chunk));
        }
        assert!(buf.is_empty());
        assert_eq!(2, buf.preserved.len());

        // Before clearing, every recorded pointer still sees the original
        // bytes.
        let mut offset = 0;
        for (ptr, chunk) in &pointers {
            let bytes = unsafe { std::slice::from_raw_parts(*ptr, *chunk) };
            assert_eq!(&data[offset..offset + chunk], bytes);
            offset += chunk;
        }

        buf.clear_preserved(300);
        assert_eq!(0, buf.preserved.len());
        assert_eq!(2, buf.free_list.len());

        // The tail block was never preserved, so the last borrow survives.
        let bytes = unsafe { std::slice::from_raw_parts(pointers[2].0, 44) };
        assert_eq!(&data[256..], bytes);
    }

    #[test]
    fn test_clear_preserved_is_whole_block() {
        let mut buf = BlockBuffer::with_block_size(64);
        buf.write(&[1u8; 200]);
        for chunk in [64, 64, 64] {
            buf.read_cont(chunk).unwrap();
        }
        assert_eq!(2, buf.preserved.len());

        // 64 + 64 > 100: only the first block is covered.
        buf.clear_preserved(100);
        assert_eq!(1, buf.preserved.len());
        assert_eq!(1, buf.free_list.len());

        buf.clear_preserved(64);
        assert_eq!(0, buf.preserved.len());
        assert_eq!(2, buf.free_list.len());
    }

    #[test]
    fn test_recycled_blocks_are_reused() {
        let mut buf = BlockBuffer::with_block_size(32);
        buf.write(&[0u8; 96]);
        for _ in 0..3 {
            buf.read_cont(32).unwrap();
        }
        buf.clear_preserved(64);
        assert_eq!(2, buf.free_list.len());

        buf.write(&[0u8; 64]);
        assert_eq!(0, buf.free_list.len());
        assert_eq!(3, buf.chain.len());
    }

    #[test]
    fn test_byte_stream_preservation_random_splits() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let mut buf = BlockBuffer::with_block_size(64);
            let size = rng.random_range(1..8192);
            let mut data = vec![0u8; size];
            rng.fill(&mut data[..]);

            let mut written = 0;
            while written < size {
                let n = usize::min(rng.random_range(1..200), size - written);
                buf.write(&data[written..written + n]);
                written += n;
            }

            // A correct consumer never asks past the head block's remaining
            // committed bytes; a drained head rolls over on the next read.
            let mut read = Vec::with_capacity(size);
            while read.len() < size {
                let avail = buf.head_available();
                let cap = if avail > 0 { avail } else { 64 };
                let want = usize::min(rng.random_range(1..=cap), size - read.len());
                match buf.read_cont(want) {
                    Ok(bytes) => read.extend_from_slice(bytes),
                    Err(_) => continue,
                }
            }
            assert_eq!(data, read);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_typed_values_never_straddle() {
        let mut buf = BlockBuffer::with_block_size(64);
        // 60 bytes leave 4 in the tail: the u64 must roll to a fresh block.
        buf.write(&[0u8; 60]);
        buf.write_value(&0xdead_beef_u64);
        assert_eq!(2, buf.chain.len());

        buf.read_cont(60).unwrap();
        assert_eq!(0xdead_beef_u64, buf.read_value::<u64>().unwrap());
    }

    #[test]
    fn test_ensure_cont_then_write_cont() {
        let mut buf = BlockBuffer::with_block_size(64);
        buf.write(&[0u8; 60]);

        // Asking for more room than the tail has left rolls a new block and
        // does not advance the cursor.
        let window = buf.ensure_cont(16);
        window[..16].copy_from_slice(&[9u8; 16]);
        assert_eq!(2, buf.chain.len());

        buf.write_cont(&[9u8; 16]);
        buf.read_cont(60).unwrap();
        assert_eq!(&[9u8; 16][..], buf.read_cont(16).unwrap());
    }

    #[test]
    fn test_fd_echo() {
        let (pipe_rx, pipe_tx) = nix::unistd::pipe().unwrap();
        let mut data = vec![0u8; 10_000];
        rand::rng().fill(&mut data[..]);

        let mut out = BlockBuffer::with_block_size(512);
        out.write(&data);
        let mut sent = 0;
        while sent < data.len() {
            sent += out.output_to_fd(pipe_tx.as_raw_fd()).unwrap();
        }
        drop(pipe_tx);

        let mut input = BlockBuffer::with_block_size(512);
        let received = input.input_from_fd(pipe_rx.as_raw_fd(), false).unwrap();
        assert_eq!(data.len(), received);

        let mut read = Vec::new();
        while read.len() < data.len() {
            let avail = input.head_available();
            let want = if avail > 0 { avail } else { 1 };
            read.extend_from_slice(input.read_cont(want).unwrap());
        }
        assert!(input.is_empty());
        assert_eq!(data, read);
    }

    #[test]
    fn test_input_from_fd_cont_single_read() {
        let (pipe_rx, pipe_tx) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&pipe_tx, &[1u8; 100]).unwrap();

        let mut buf = BlockBuffer::with_block_size(64);
        // One syscall only: at most one block's worth arrives.
        let n = buf.input_from_fd(pipe_rx.as_raw_fd(), true).unwrap();
        assert_eq!(64, n);
        let n = buf.input_from_fd(pipe_rx.as_raw_fd(), true).unwrap();
        assert_eq!(36, n);
    }
}
