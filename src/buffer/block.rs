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

use std::sync::atomic::AtomicUsize;

/// Fixed-size heap byte region. The region is allocated once and never moves,
/// so borrows into it survive the owning handle moving between containers.
fn alloc_region(cap: usize) -> *mut u8 {
    let mut region = vec![0u8; cap];
    let data = region.as_mut_ptr();
    std::mem::forget(region);
    data
}

unsafe fn release_region(data: *mut u8, cap: usize) {
    unsafe {
        _ = Vec::from_raw_parts(data, cap, cap);
    }
}

/// A block of a single-threaded [`BlockBuffer`](super::chained::BlockBuffer)
/// chain. `committed` is `None` while the segment is the write tail; a
/// finalized segment keeps its committed length until it is recycled.
#[derive(Debug)]
pub(crate) struct Segment {
    pub(crate) data: *mut u8,
    pub(crate) cap: usize,
    pub(crate) committed: Option<usize>,
}

impl Segment {
    pub(crate) fn new(cap: usize) -> Self {
        debug_assert!(cap > 0);
        Self {
            data: alloc_region(cap),
            cap,
            committed: None,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { release_region(self.data, self.cap) };
    }
}

/// A block of a [`SpscBlockBuffer`](super::spsc::SpscBlockBuffer) chain.
///
/// `commit` is the published write end: the producer release-stores its
/// private cursor here, the consumer acquire-loads it while the block is the
/// tail. Blocks are handed out boxed so the field's address stays stable
/// while the handle moves through the chain, preserved and free queues.
#[derive(Debug)]
pub(crate) struct Block {
    pub(crate) data: *mut u8,
    pub(crate) cap: usize,
    pub(crate) commit: AtomicUsize,
}

unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn new_boxed(cap: usize) -> Box<Self> {
        debug_assert!(cap > 0);
        Box::new(Self {
            data: alloc_region(cap),
            cap,
            commit: AtomicUsize::new(0),
        })
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { release_region(self.data, self.cap) };
    }
}
