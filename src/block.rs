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

//! Block (erasable unit) management.
//!
//! A block carries a two-word header: the magic value and a generation
//! counter incremented on each successful format. The first word encodes
//! the block state: magic means formatted, all-ones means free, zero means
//! scheduled for erase.

use crate::layout::{BLOCK_HEADER, ERASED_WORD, MAGIC};
use crate::{BlockRef, Flash, Store};

/// Per-page summary of a block, gathered by [`Store::check_pages`].
pub(crate) struct PageCheck {
    /// Pages available for allocation.
    pub free: usize,

    /// Tombstoned pages.
    pub erasable: usize,

    /// Total pages examined.
    pub total: usize,
}

impl PageCheck {
    /// Whether every page of the block is tombstoned.
    pub fn all_erasable(&self) -> bool {
        self.erasable == self.total
    }
}

impl<F: Flash> Store<F> {
    /// Returns the generation (erase count) of a formatted block, or zero.
    pub fn block_generation(&self, block: BlockRef) -> u32 {
        if self.read_word(block.0) == MAGIC {
            self.read_word(block.0 + 4)
        } else {
            0
        }
    }

    /// Whether the block is completely erased.
    pub fn block_is_empty(&self, block: BlockRef) -> bool {
        self.block_empty(block.0)
    }

    /// Whether a block is formatted and usable for pages.
    pub(crate) fn block_is_valid(&self, block: usize) -> bool {
        if self.read_word(block) != MAGIC {
            return false;
        }
        let generation = self.read_word(block + 4);
        generation != 0 && generation != ERASED_WORD
    }

    /// Whether a block is scheduled for erase.
    pub(crate) fn block_is_erasable(&self, block: usize) -> bool {
        self.read_word(block) == 0
    }

    /// Whether the whole block reads as all-ones.
    pub(crate) fn block_empty(&self, block: usize) -> bool {
        self.block_empty_from(block, block)
    }

    /// Whether the block reads as all-ones from `offset` to its end.
    pub(crate) fn block_empty_from(&self, block: usize, offset: usize) -> bool {
        self.all_ones(offset, block + self.layout.block_size - offset)
    }

    /// Summarizes the page states of a valid block.
    pub(crate) fn check_pages(&self, block: usize) -> PageCheck {
        let mut check = PageCheck {
            free: 0,
            erasable: 0,
            total: self.layout.pages_per_block,
        };
        for index in 0..self.layout.pages_per_block {
            let page = self.layout.page_addr(block, index);
            if self.read_word(page) == 0 {
                check.erasable += 1;
            } else if self.page_empty(page) {
                check.free += 1;
            }
        }
        check
    }

    /// Writes the block header with the given generation.
    ///
    /// On double-word flash the magic and generation are fused into one
    /// program. If the header does not verify, the partial state is
    /// shredded so the block reads as erasable, and `false` is returned.
    pub(crate) fn format_block(&mut self, block: usize, generation: u32) -> bool {
        let ok = if self.layout.double_write() {
            self.flash.write_double(block, MAGIC, generation)
        } else {
            self.flash.write_word(block, MAGIC) && self.flash.write_word(block + 4, generation)
        };
        if ok {
            return true;
        }
        self.shred_block_header(block);
        false
    }

    /// Shreds both header words so the block reads as erasable.
    ///
    /// Used on failure paths where the generation can no longer be
    /// trusted; the erase pass will renumber the block from 1.
    pub(crate) fn shred_block_header(&mut self, block: usize) {
        if self.layout.double_write() {
            self.flash.shred_double(block);
        } else {
            self.flash.shred_word(block + 4);
            self.flash.shred_word(block);
        }
    }

    /// Schedules a block for erase, preserving its generation.
    ///
    /// On single-word flash only the magic is shredded and the generation
    /// word stays readable. On double-word flash the header can only be
    /// shredded as a whole, so the current header is first copied into the
    /// trailing padding, from where the erase pass recovers it.
    pub(crate) fn mark_erasable(&mut self, block: usize) {
        if self.layout.double_write() {
            if self.layout.block_padding() >= 8 {
                let magic = self.read_word(block);
                let generation = self.read_word(block + 4);
                self.flash
                    .write_double(self.layout.padding_offset(block), magic, generation);
            }
            self.flash.shred_double(block);
        } else {
            self.flash.shred_word(block);
        }
        self.blocks_to_erase = true;
    }

    /// Reads the generation preserved for an erasable block.
    ///
    /// Zero means the numbering starts over after the erase.
    pub(crate) fn preserved_generation(&self, block: usize) -> u32 {
        if self.layout.double_write() {
            if self.layout.block_padding() >= 8 {
                let padding = self.layout.padding_offset(block);
                if self.read_word(padding) == MAGIC {
                    return self.read_word(padding + 4);
                }
            }
            0
        } else {
            self.read_word(block + 4)
        }
    }

    /// Formats a new block, or returns `None` if no free block is left.
    ///
    /// Only empty blocks are considered; erasing is too slow to perform
    /// synchronously in the allocation path.
    pub(crate) fn new_block(&mut self) -> Option<usize> {
        let mut block = self.layout.end;
        while block > self.layout.base {
            block -= self.layout.block_size;
            if self.block_empty(block) && self.format_block(block, 1) {
                if self.first > block {
                    self.first = block;
                }
                return Some(block);
            }
        }
        None
    }

    /// Iterates the blocks from `from` (inclusive) to the end of the
    /// region.
    pub(crate) fn blocks_from(&self, from: usize) -> impl Iterator<Item = usize> {
        (from..self.layout.end).step_by(self.layout.block_size)
    }

    /// The number of page slots of the block at `block`.
    pub(crate) fn page_slots(&self, block: usize) -> impl Iterator<Item = usize> {
        let first = block + BLOCK_HEADER;
        let page_size = self.layout.page_size;
        (0..self.layout.pages_per_block).map(move |i| first + i * page_size)
    }
}
