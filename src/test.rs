// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::{BufferFlash, BufferOptions, MountOptions, Store};

/// Shared flash configurations for unit tests.
#[derive(Clone)]
pub struct Config {
    pub flash_size: usize,
    pub block_size: usize,
    pub double_write: bool,
    pub pages_per_block: usize,
    pub pages_kept_free: usize,
    pub erase_delay: usize,
}

/// Small geometry for fast exhaustive tests.
pub const MINIMAL: Config = Config {
    flash_size: 4096,
    block_size: 512,
    double_write: false,
    pages_per_block: 2,
    pages_kept_free: 4,
    erase_delay: 0,
};

/// The same geometry on double-word flash.
pub const DOUBLE: Config = Config {
    flash_size: 4096,
    block_size: 512,
    double_write: true,
    pages_per_block: 2,
    pages_kept_free: 4,
    erase_delay: 0,
};

impl Config {
    pub fn buffer_options(&self) -> BufferOptions {
        BufferOptions {
            block_size: self.block_size,
            double_write: self.double_write,
            max_word_writes: 8,
            max_block_erases: 10000,
            strict_mode: true,
            erase_delay: self.erase_delay,
        }
    }

    pub fn new_flash(&self) -> BufferFlash {
        BufferFlash::erased(self.flash_size, self.buffer_options())
    }

    pub fn reset_options(&self) -> MountOptions {
        let mut options = self.mount_options();
        options.reset = true;
        options
    }

    pub fn mount_options(&self) -> MountOptions {
        let mut options = MountOptions::default();
        options.pages_per_block = Some(self.pages_per_block);
        options.pages_kept_free = self.pages_kept_free;
        options
    }

    /// Mounts a freshly erased store.
    pub fn new_store(&self) -> Store<BufferFlash> {
        Store::mount(self.new_flash(), &self.reset_options()).unwrap()
    }

    pub fn num_blocks(&self) -> usize {
        self.flash_size / self.block_size
    }

    pub fn num_pages(&self) -> usize {
        self.num_blocks() * self.pages_per_block
    }

    pub fn pages_per_block(&self) -> usize {
        self.pages_per_block
    }

    pub fn pages_kept_free(&self) -> usize {
        self.pages_kept_free
    }
}
