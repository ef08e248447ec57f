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

use std::time::Duration;

use nix::unistd::{SysconfVar, sysconf};

/// Framed strings carry a host-order `usize` length prefix.
pub const LENGTH_PREFIX_SIZE: usize = size_of::<usize>();

/// Notify on every write unless batching is configured.
pub const DEFAULT_NOTIFY_INTERVAL: u32 = 1;

/// Liveness nudge for the timed condvar discipline; re-tests the predicate,
/// never aborts the wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_micros(50);

/// Predicate checks performed before the spin-then-condvar discipline falls
/// back to blocking.
pub const DEFAULT_SPIN_COUNT: u32 = 64;

pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Block size used when none is configured: the OS page size.
pub fn default_block_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::default_block_size;

    #[test]
    fn test_default_block_size() {
        let size = default_block_size();
        assert!(size >= 512);
        assert_eq!(size & (size - 1), 0);
    }
}
