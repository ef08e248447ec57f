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

use anyhow::anyhow;

use crate::{
    buffer::spsc::NotifyMode,
    consts::{
        DEFAULT_NOTIFY_INTERVAL, DEFAULT_SPIN_COUNT, DEFAULT_WAIT_TIMEOUT, LENGTH_PREFIX_SIZE,
    },
};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
/// Config is used to tune a [`SpscBlockBuffer`](crate::SpscBlockBuffer).
///
/// All values are fixed at construction; none of them can change while the
/// buffer is live.
pub struct Config {
    /// How the producer signals write progress to the consumer.
    pub mode: NotifyMode,

    /// Size of every block in bytes. `None` means the OS page size.
    pub block_size: Option<usize>,

    /// In [`NotifyMode::CondvarTimeout`], notify the consumer only every
    /// `notify_interval` writes. Progress is still published on every write.
    pub notify_interval: u32,

    /// In [`NotifyMode::CondvarTimeout`], how long the consumer sleeps before
    /// re-testing the wait predicate on its own.
    pub wait_timeout: Duration,

    /// In [`NotifyMode::SpinCondvar`], how many predicate checks the consumer
    /// performs before falling back to the condition variable.
    pub spin_count: u32,
}

impl Config {
    pub fn new(mode: NotifyMode) -> Self {
        Self {
            mode,
            block_size: None,
            notify_interval: DEFAULT_NOTIFY_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            spin_count: DEFAULT_SPIN_COUNT,
        }
    }

    pub fn verify(&self) -> Result<(), anyhow::Error> {
        if let Some(size) = self.block_size {
            if size < LENGTH_PREFIX_SIZE {
                return Err(anyhow!(
                    "block_size:{} is too small, must be at least {}",
                    size,
                    LENGTH_PREFIX_SIZE
                ));
            }
        }
        if self.notify_interval == 0 {
            return Err(anyhow!("notify_interval could not be 0"));
        }
        if matches!(self.mode, NotifyMode::CondvarTimeout) && self.wait_timeout.is_zero() {
            return Err(anyhow!("wait_timeout could not be 0 in CondvarTimeout mode"));
        }
        if matches!(self.mode, NotifyMode::SpinCondvar) && self.spin_count == 0 {
            return Err(anyhow!("spin_count could not be 0 in SpinCondvar mode"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(NotifyMode::WaitFree)
    }
}
