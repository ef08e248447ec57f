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

pub mod block;
pub mod chained;
pub mod spsc;

use std::{ptr, slice};

use crate::error::Error;

/// The raw host representation of `value`.
///
/// `T` must be plain data without padding bytes; the result is only
/// meaningful to a reader on the same machine.
pub(crate) fn value_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>()) }
}

/// Write side of a block-chained buffer.
pub trait BufWrite {
    /// Appends `data`, splitting it across blocks as needed. Always makes
    /// progress.
    fn write(&mut self, data: &[u8]);

    /// Appends `data` wholly within one block, rolling a new block first if
    /// the current tail lacks the room. Requires `data.len()` ≤ block size.
    ///
    /// This is the guarantee readers rely on to use
    /// [`read_cont`](BufRead::read_cont).
    fn write_cont(&mut self, data: &[u8]);

    /// Appends the raw host representation of `value` through the contiguous
    /// path, so it can be read back with [`read_value`](BufRead::read_value).
    fn write_value<T: Copy>(&mut self, value: &T) {
        self.write_cont(value_bytes(value));
    }

    /// Appends an 8-byte host-order length prefix followed by the bytes of
    /// `s`. Both parts go through the contiguous path.
    fn write_str(&mut self, s: &str);

    /// A writable window of `len` contiguous bytes in the tail block, rolling
    /// a new block first if needed. The write cursor does not advance; commit
    /// the bytes with a subsequent [`write_cont`](Self::write_cont).
    fn ensure_cont(&mut self, len: usize) -> &mut [u8];
}

/// Read side of a block-chained buffer.
///
/// Returned slices stay dereferenceable after further reads: a drained block
/// moves to the preserved list instead of being recycled, until a
/// [`clear_preserved`](Self::clear_preserved) call covers it.
pub trait BufRead {
    /// Borrows `len` contiguous bytes. Never splits a block: if the head
    /// block's remaining committed bytes fall short, the head is moved to the
    /// preserved list first and reading restarts at the next block. Requires
    /// `len` ≤ block size.
    fn read_cont(&mut self, len: usize) -> Result<&[u8], Error>;

    /// Reads a value written by [`write_value`](BufWrite::write_value),
    /// copying it out of the block.
    fn read_value<T: Copy>(&mut self) -> Result<T, Error> {
        let bytes = self.read_cont(size_of::<T>())?;
        Ok(unsafe { ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
    }

    /// Reads a frame written by [`write_str`](BufWrite::write_str) and
    /// returns an owned copy.
    fn get_string(&mut self) -> Result<String, Error>;

    fn is_empty(&mut self) -> bool;

    /// Recycles whole preserved blocks from the front while the running sum
    /// of their committed lengths stays within `len`. Partially covered
    /// blocks remain preserved, so borrows into them stay valid.
    fn clear_preserved(&mut self, len: usize);
}
