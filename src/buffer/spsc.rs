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
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
    ptr::{self, NonNull},
    slice,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicPtr, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use bytes::Bytes;
use nix::{
    errno::Errno,
    sys::eventfd::{EfdFlags, EventFd},
    unistd,
};

use super::{BufRead, BufWrite, block::Block, value_bytes};
use crate::{
    config::Config,
    consts::{LENGTH_PREFIX_SIZE, default_block_size},
    error::Error,
    queue::{QueueConsumer, QueueProducer, SpscQueue, WaitMode},
};

/// How the producer signals write progress to the consumer.
///
/// Every discipline publishes progress with the same release store; they
/// differ only in how the consumer learns about it. A sequence of writes
/// followed by reads yields identical bytes in every mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NotifyMode {
    /// Neither side ever blocks; the consumer checks
    /// [`is_empty`](BufRead::is_empty) before reading.
    WaitFree,
    /// The consumer busy-loops on its wait predicate.
    Spin,
    /// The consumer parks on a condition variable; the producer publishes
    /// under the mutex so a wakeup is never lost.
    Condvar,
    /// [`Config::spin_count`] predicate checks, then [`NotifyMode::Condvar`].
    SpinCondvar,
    /// Like [`NotifyMode::Condvar`], but the producer only notifies every
    /// [`Config::notify_interval`] writes and the consumer re-tests the
    /// predicate every [`Config::wait_timeout`] on its own. The timeout is a
    /// liveness nudge, never an abort.
    CondvarTimeout,
    /// The producer writes `1u64` to a non-blocking eventfd; the consumer
    /// integrates the fd into an external poller and drains until empty on
    /// every wakeup. Reads take the wait-free path.
    EventFd,
}

struct Shared {
    /// Address of the tail block's commit field. Written only by the
    /// producer, read by both sides.
    wpos: AtomicPtr<AtomicUsize>,
    mode: NotifyMode,
    notify_interval: u32,
    wait_timeout: Duration,
    spin_count: u32,
    /// Guards only the condvar handshake, never any data copy.
    mux: Mutex<()>,
    cond: Condvar,
    event_fd: Option<EventFd>,
}

/// An unbounded block-chained byte buffer for exactly one producer thread and
/// one consumer thread.
///
/// The same operational surface as [`BlockBuffer`](super::chained::BlockBuffer),
/// split into a [`BlockWriter`] and a [`BlockReader`]. The block chain, the
/// free list and the preserved list are each an SPSC queue; the free list has
/// the roles reversed (the reader recycles blocks into it, the writer takes
/// them out). Handoff is pointer-visible: the bytes a read returns are the
/// bytes the writer produced, never a copy.
///
/// Guarantees:
/// 1. The chain is never empty; its last block is the write tail and its
///    commit field is live-read under acquire ordering.
/// 2. Block memory never moves.
/// 3. Bytes behind a returned borrow stay valid until a
///    [`clear_preserved`](BufRead::clear_preserved) call covers their block.
pub struct SpscBlockBuffer;

impl SpscBlockBuffer {
    /// A buffer with page-sized blocks and default tuning.
    pub fn new(mode: NotifyMode) -> Result<(BlockWriter, BlockReader), Error> {
        Self::with_config(Config::new(mode))
    }

    pub fn with_config(config: Config) -> Result<(BlockWriter, BlockReader), Error> {
        config.verify()?;
        let block_size = config.block_size.unwrap_or_else(default_block_size);

        let event_fd = match config.mode {
            NotifyMode::EventFd => {
                let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
                    .map_err(|err| Error::Io(std::io::Error::from_raw_os_error(err as i32)))?;
                Some(fd)
            }
            _ => None,
        };

        let (mut chain_tx, chain_rx) = SpscQueue::split(WaitMode::WaitFree);
        let (free_tx, free_rx) = SpscQueue::split(WaitMode::WaitFree);
        let (preserved_tx, preserved_rx) = SpscQueue::split(WaitMode::WaitFree);

        let block = Block::new_boxed(block_size);
        let tail = NonNull::from(block.as_ref());
        let shared = Arc::new(Shared {
            wpos: AtomicPtr::new(&block.commit as *const AtomicUsize as *mut AtomicUsize),
            mode: config.mode,
            notify_interval: config.notify_interval,
            wait_timeout: config.wait_timeout,
            spin_count: config.spin_count,
            mux: Mutex::new(()),
            cond: Condvar::new(),
            event_fd,
        });
        chain_tx.push(block);

        Ok((
            BlockWriter {
                block_size,
                wpos_private: 0,
                tail,
                chain: chain_tx,
                free_list: free_rx,
                notify_counter: 0,
                shared: shared.clone(),
            },
            BlockReader {
                block_size,
                rpos: 0,
                one_block_left: true,
                chain: chain_rx,
                free_list: free_tx,
                preserved_tx,
                preserved_rx,
                shared,
            },
        ))
    }
}

/// Producer half of a [`SpscBlockBuffer`]. Never blocks; in condvar modes it
/// only briefly takes the mutex around publish-and-notify.
pub struct BlockWriter {
    block_size: usize,
    /// Thread-local write cursor into the tail block. Published into the tail
    /// block's commit field by [`notify`](Self::notify) and on rollover.
    wpos_private: usize,
    tail: NonNull<Block>,
    chain: QueueProducer<Box<Block>>,
    free_list: QueueConsumer<Box<Block>>,
    notify_counter: u32,
    shared: Arc<Shared>,
}

unsafe impl Send for BlockWriter {}

impl BlockWriter {
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Appends `data` without telling the consumer. Pair with an explicit
    /// [`notify`](Self::notify) to batch several writes under one wakeup.
    pub fn write_no_notify(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            self.add_block_if_full();

            let to_write = usize::min(data.len(), self.block_size - self.wpos_private);
            unsafe {
                ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    self.tail.as_ref().data.add(self.wpos_private),
                    to_write,
                );
            }
            self.wpos_private += to_write;
            data = &data[to_write..];
        }
    }

    /// The contiguous counterpart of [`write_no_notify`](Self::write_no_notify).
    pub fn write_cont_no_notify(&mut self, data: &[u8]) {
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
                self.tail.as_ref().data.add(self.wpos_private),
                data.len(),
            );
        }
        self.wpos_private += data.len();
    }

    /// Publishes all writes so far and signals the consumer per the
    /// configured discipline.
    pub fn notify(&mut self) {
        match self.shared.mode {
            NotifyMode::Condvar | NotifyMode::SpinCondvar => self.publish_and_wake(),
            NotifyMode::CondvarTimeout => {
                self.notify_counter += 1;
                if self.notify_counter == self.shared.notify_interval {
                    self.notify_counter = 0;
                    self.publish_and_wake();
                } else {
                    self.publish();
                }
            }
            NotifyMode::EventFd => {
                self.publish();
                if let Some(event_fd) = &self.shared.event_fd {
                    if let Err(err) = unistd::write(event_fd, &1u64.to_ne_bytes()) {
                        // EAGAIN means the counter is saturated; the consumer
                        // is already signalled and wakeups coalesce.
                        if err != Errno::EAGAIN {
                            tracing::warn!("eventfd notify failed, error={}", err);
                        }
                    }
                }
            }
            NotifyMode::WaitFree | NotifyMode::Spin => self.publish(),
        }
    }

    /// Reads from `fd` into the tail until the syscall fails or returns 0,
    /// rolling new blocks as needed, then notifies once if any bytes arrived.
    /// With `cont`, performs at most one syscall; `max_len` caps the total.
    ///
    /// An error is returned only if no bytes were moved by this call;
    /// otherwise the partial count is returned and the error is left for the
    /// next call to observe.
    pub fn input_from_fd(
        &mut self,
        fd: RawFd,
        cont: bool,
        max_len: Option<usize>,
    ) -> Result<usize, Error> {
        let mut total = 0;
        loop {
            self.add_block_if_full();

            let room = self.block_size - self.wpos_private;
            let want = match max_len {
                Some(max) => usize::min(max - total, room),
                None => room,
            };
            if want == 0 {
                break;
            }
            let window = unsafe {
                slice::from_raw_parts_mut(self.tail.as_ref().data.add(self.wpos_private), want)
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
                    self.wpos_private += len;
                    total += len;
                    if cont {
                        break;
                    }
                }
            }
        }

        if total > 0 {
            self.notify();
        }
        Ok(total)
    }

    /// Release-store of the private cursor into the tail block's commit
    /// field. This is the publication edge the consumer's acquire loads pair
    /// with.
    fn publish(&self) {
        unsafe { self.tail.as_ref() }
            .commit
            .store(self.wpos_private, Ordering::Release);
    }

    fn publish_and_wake(&self) {
        // The store must still be atomic: is_empty() does not take the lock.
        let guard = self.shared.mux.lock().unwrap();
        self.publish();
        drop(guard);
        self.shared.cond.notify_one();
    }

    fn add_block(&mut self) {
        // Final length of the outgoing tail, then move the publication
        // pointer to the fresh block.
        self.publish();
        self.wpos_private = 0;

        let block = if self.free_list.is_empty() {
            Block::new_boxed(self.block_size)
        } else {
            let block = self.free_list.pop();
            block.commit.store(0, Ordering::Relaxed);
            block
        };
        let tail = NonNull::from(block.as_ref());
        self.chain.push(block);
        self.tail = tail;
        self.shared.wpos.store(
            &unsafe { tail.as_ref() }.commit as *const AtomicUsize as *mut AtomicUsize,
            Ordering::Release,
        );
    }

    #[inline]
    fn add_block_if_full(&mut self) {
        if self.wpos_private == self.block_size {
            self.add_block();
        }
    }

    #[inline]
    fn add_block_for(&mut self, cont_write_len: usize) {
        if cont_write_len > self.block_size - self.wpos_private {
            self.add_block();
        }
    }
}

impl BufWrite for BlockWriter {
    fn write(&mut self, data: &[u8]) {
        self.write_no_notify(data);
        self.notify();
    }

    fn write_cont(&mut self, data: &[u8]) {
        self.write_cont_no_notify(data);
        self.notify();
    }

    fn write_str(&mut self, s: &str) {
        self.write_cont_no_notify(value_bytes(&s.len()));
        self.write_cont_no_notify(s.as_bytes());
        self.notify();
    }

    fn ensure_cont(&mut self, len: usize) -> &mut [u8] {
        assert!(
            len <= self.block_size,
            "contiguous window larger than the block size"
        );
        self.add_block_for(len);
        unsafe {
            slice::from_raw_parts_mut(self.tail.as_ref().data.add(self.wpos_private), len)
        }
    }
}

/// Consumer half of a [`SpscBlockBuffer`]. May suspend inside `read_*` and
/// `get_*` per the configured discipline.
pub struct BlockReader {
    block_size: usize,
    /// Read cursor into the head block. Consumer-private.
    rpos: usize,
    /// When false, the chain is guaranteed to hold more than one block and
    /// the head's commit field is immutable. When true, re-verify against the
    /// shared publication pointer.
    one_block_left: bool,
    chain: QueueConsumer<Box<Block>>,
    free_list: QueueProducer<Box<Block>>,
    preserved_tx: QueueProducer<Box<Block>>,
    preserved_rx: QueueConsumer<Box<Block>>,
    shared: Arc<Shared>,
}

impl BlockReader {
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The eventfd carrying producer notifications in
    /// [`NotifyMode::EventFd`]; integrate it into a poller and drain until
    /// [`is_empty`](BufRead::is_empty) on every wakeup. Wakeups coalesce.
    pub fn event_fd(&self) -> Option<RawFd> {
        self.shared.event_fd.as_ref().map(|fd| fd.as_fd().as_raw_fd())
    }

    /// Reads a value and releases the preserved bytes it covered.
    pub fn get<T: Copy>(&mut self) -> Result<T, Error> {
        let value = self.read_value::<T>()?;
        self.clear_preserved(size_of::<T>());
        Ok(value)
    }

    /// Copies `dest.len()` contiguous bytes into `dest` and releases the
    /// preserved bytes the copy covered.
    pub fn get_cont(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        let len = dest.len();
        {
            let bytes = self.read_cont(len)?;
            dest.copy_from_slice(bytes);
        }
        self.clear_preserved(len);
        Ok(())
    }

    /// Like [`get_cont`](Self::get_cont), but returns an owned copy.
    pub fn get_bytes(&mut self, len: usize) -> Result<Bytes, Error> {
        let bytes = Bytes::copy_from_slice(self.read_cont(len)?);
        self.clear_preserved(len);
        Ok(bytes)
    }

    /// Writes the readable bytes to `fd`, draining block by block, until the
    /// syscall fails or returns 0 or no committed bytes are left. Never
    /// waits. Preserved blocks covered by the written bytes are released.
    ///
    /// An error is returned only if no bytes were moved by this call;
    /// otherwise the partial count is returned and the error is left for the
    /// next call to observe.
    pub fn output_to_fd(&mut self, fd: RawFd) -> Result<usize, Error> {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut total = 0;
        loop {
            self.pop_block_if_ready(1);

            let avail = self.head_available();
            let head = self.head_ptr();
            let chunk =
                unsafe { slice::from_raw_parts((*head.as_ptr()).data.add(self.rpos), avail) };
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
        }

        self.clear_preserved(total);
        Ok(total)
    }

    #[inline]
    fn head_ptr(&mut self) -> NonNull<Block> {
        NonNull::from(self.chain.front().as_ref())
    }

    /// True iff the head block is also the publication target, i.e. the tail.
    fn check_one_block_left(&mut self) -> bool {
        let head = self.head_ptr();
        let wpos = self.shared.wpos.load(Ordering::Acquire);
        ptr::eq(
            unsafe { &(*head.as_ptr()).commit as *const AtomicUsize },
            wpos,
        )
    }

    #[inline]
    fn head_committed(&mut self, ordering: Ordering) -> usize {
        let head = self.head_ptr();
        unsafe { (*head.as_ptr()).commit.load(ordering) }
    }

    fn head_available(&mut self) -> usize {
        // Once more than one block exists the head's commit field is
        // finalized, so no acquire is needed.
        let ordering = if self.one_block_left {
            Ordering::Acquire
        } else {
            Ordering::Relaxed
        };
        self.head_committed(ordering) - self.rpos
    }

    fn pop_block(&mut self) {
        let block = self.chain.pop();
        self.preserved_tx.push(block);
        self.rpos = 0;
        self.one_block_left = self.check_one_block_left();
    }

    /// Non-waiting rollover: pop the drained head when more blocks exist.
    fn pop_block_if_ready(&mut self, size: usize) {
        if self.one_block_left {
            if !self.check_one_block_left()
                && self.head_committed(Ordering::Relaxed) - self.rpos < size
            {
                self.pop_block();
            }
        } else if self.head_committed(Ordering::Relaxed) - self.rpos < size {
            self.pop_block();
        }
    }

    /// Rollover with the configured wait discipline: block until the head
    /// holds `size` readable bytes or a successor block exists.
    fn pop_block_if_needed(&mut self, size: usize) {
        match self.shared.mode {
            NotifyMode::WaitFree | NotifyMode::EventFd => self.pop_block_if_ready(size),
            _ => {
                if self.one_block_left {
                    self.wait_until(|r| {
                        !(r.check_one_block_left()
                            && r.head_committed(Ordering::Acquire) - r.rpos < size)
                    });
                    if self.head_committed(Ordering::Acquire) - self.rpos < size {
                        self.pop_block();
                        if self.one_block_left {
                            // rpos is 0 after the pop
                            self.wait_until(|r| r.head_committed(Ordering::Acquire) >= size);
                        }
                    }
                } else if self.head_committed(Ordering::Relaxed) - self.rpos < size {
                    self.pop_block();
                    if self.one_block_left {
                        self.wait_until(|r| r.head_committed(Ordering::Acquire) >= size);
                    }
                }
            }
        }
    }

    fn wait_until<F>(&mut self, mut pred: F)
    where
        F: FnMut(&mut Self) -> bool,
    {
        let shared = self.shared.clone();
        match shared.mode {
            NotifyMode::Spin => {
                while !pred(self) {
                    std::hint::spin_loop();
                }
            }
            NotifyMode::Condvar => {
                if pred(self) {
                    return;
                }
                let mut guard = shared.mux.lock().unwrap();
                while !pred(self) {
                    guard = shared.cond.wait(guard).unwrap();
                }
            }
            NotifyMode::SpinCondvar => {
                for _ in 0..shared.spin_count {
                    if pred(self) {
                        return;
                    }
                    std::hint::spin_loop();
                }
                let mut guard = shared.mux.lock().unwrap();
                while !pred(self) {
                    guard = shared.cond.wait(guard).unwrap();
                }
            }
            NotifyMode::CondvarTimeout => {
                // The timeout re-tests the predicate on batched
                // notifications; it never gives up.
                while !pred(self) {
                    let guard = shared.mux.lock().unwrap();
                    let _unused = shared.cond.wait_timeout(guard, shared.wait_timeout).unwrap();
                }
            }
            NotifyMode::WaitFree | NotifyMode::EventFd => {
                unreachable!("wait-free disciplines never wait")
            }
        }
    }
}

impl BufRead for BlockReader {
    fn read_cont(&mut self, len: usize) -> Result<&[u8], Error> {
        assert!(
            len <= self.block_size,
            "contiguous read larger than the block size"
        );
        self.pop_block_if_needed(len);
        if self.head_available() < len {
            return Err(Error::NotEnoughData);
        }

        let head = self.head_ptr();
        let res = unsafe { slice::from_raw_parts((*head.as_ptr()).data.add(self.rpos), len) };
        self.rpos += len;
        Ok(res)
    }

    fn get_string(&mut self) -> Result<String, Error> {
        let len = self.read_value::<usize>()?;
        let res = {
            let bytes = self.read_cont(len)?;
            String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Others(anyhow!("length-prefixed payload is not valid utf-8")))
        };
        self.clear_preserved(LENGTH_PREFIX_SIZE + len);
        res
    }

    fn is_empty(&mut self) -> bool {
        if !self.one_block_left {
            return false;
        }
        self.one_block_left = self.check_one_block_left();
        if !self.one_block_left {
            return false;
        }
        let wpos = self.shared.wpos.load(Ordering::Acquire);
        self.rpos == unsafe { (*wpos).load(Ordering::Acquire) }
    }

    fn clear_preserved(&mut self, len: usize) {
        let mut cleared = 0;
        while !self.preserved_rx.is_empty() {
            let committed = self.preserved_rx.front().commit.load(Ordering::Relaxed);
            if cleared + committed > len {
                break;
            }
            cleared += committed;
            let block = self.preserved_rx.pop();
            self.free_list.push(block);
        }
    }
}
