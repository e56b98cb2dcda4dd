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

use crate::collect::{CollectorEntry, CollectorState, NotifierEntry};
use crate::layout::{Layout, ERASED_WORD, MAGIC};
use crate::Flash;
use alloc::vec::Vec;

/// Identifies a logical page stream.
///
/// Ids are arbitrary 32-bit values, conventionally four ASCII bytes read
/// little-endian. The all-ones and zero values are reserved by the page
/// state encoding and must not be used.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Id(pub u32);

impl Id {
    /// Creates an id from a four-byte tag.
    pub const fn tag(tag: &[u8; 4]) -> Id {
        Id(u32::from_le_bytes(*tag))
    }
}

impl From<u32> for Id {
    fn from(id: u32) -> Id {
        Id(id)
    }
}

/// Refers to a page in the store region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageRef(pub(crate) usize);

/// Refers to a block in the store region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockRef(pub(crate) usize);

/// A record stored in flash.
///
/// The span covers the record content starting at its first word. Use
/// [`Store::get`] to read the bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Span {
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

impl Span {
    /// The length in bytes of the record.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the record is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Represents a possible store error.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The flash geometry cannot host the store.
    ///
    /// The block size must be a power of two dividing the flash evenly, the
    /// write alignment must be 4 or 8, and the region must hold at least
    /// one block.
    Unsupported,

    /// No page slot is available anywhere in the region.
    ///
    /// The store is left unchanged (lifetime may still have been consumed
    /// by failed program attempts). The operation will repeatedly fail
    /// until the collector reclaims pages.
    NoSpace,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Controls how a region is mounted.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Erase the whole region before scanning.
    pub reset: bool,

    /// Count corrupted blocks instead of reclaiming them.
    ///
    /// Useful for data migration: blocks with unexpected headers are left
    /// untouched and reported by [`Store::corrupted_blocks`].
    pub ignore_corrupted: bool,

    /// Bytes reserved at the start of the flash for other uses.
    pub reserved_start: usize,

    /// Bytes reserved at the end of the flash for other uses.
    pub reserved_end: usize,

    /// Pages carved out of each block; defaults to one per KiB of block.
    pub pages_per_block: Option<usize>,

    /// How many free pages the collector keeps in reserve.
    pub pages_kept_free: usize,
}

impl Default for MountOptions {
    fn default() -> MountOptions {
        MountOptions {
            reset: false,
            ignore_corrupted: false,
            reserved_start: 0,
            reserved_end: 0,
            pages_per_block: None,
            pages_kept_free: 4,
        }
    }
}

/// Log-structured record store over a flash region.
///
/// The store carves the region into erase blocks and fixed-size logical
/// pages, and keeps per-id append-only record logs in those pages. All
/// mutations preserve the write-once discipline: bits only go from 1 to 0
/// outside of block erase, and a record becomes visible only when its
/// first word (or length word) is programmed last.
pub struct Store<F: Flash> {
    pub(crate) flash: F,
    pub(crate) layout: Layout,

    /// Offset of the lowest block holding any formatted state.
    ///
    /// Equals `layout.end` while the region is entirely empty. Monotone
    /// non-increasing until the next mount.
    pub(crate) first: usize,

    /// Count of pages available for allocation.
    pub(crate) pages_available: usize,

    /// Whether the collector task is armed or running.
    pub(crate) collecting: bool,

    /// Whether blocks are waiting to be erased.
    pub(crate) blocks_to_erase: bool,

    /// Corrupted blocks counted (not reclaimed) during mount.
    pub(crate) corrupted: usize,

    pub(crate) collectors: Vec<CollectorEntry<F>>,
    pub(crate) notifiers: Vec<NotifierEntry>,
    pub(crate) collector_state: CollectorState,
}

impl<F: Flash> Store<F> {
    /// Mounts the store, scanning the region and repairing the damage an
    /// unexpected reset may have left.
    ///
    /// After the scan every block is in one of three states, indicated by
    /// its first word: valid (magic), free (all ones), or erasable (zero).
    /// Half-formatted blocks are either completed or scheduled for erase;
    /// blocks with any other header are scheduled for erase too, unless
    /// [`MountOptions::ignore_corrupted`] is set, in which case they are
    /// counted and left alone.
    ///
    /// If blocks need erasing, or fewer than
    /// [`MountOptions::pages_kept_free`] pages are free, the collector is
    /// armed; drive it with [`Store::step`].
    pub fn mount(flash: F, options: &MountOptions) -> StoreResult<Store<F>> {
        let layout = Layout::new(&flash, options)?;
        let mut store = Store {
            flash,
            first: layout.end,
            pages_available: 0,
            collecting: false,
            blocks_to_erase: false,
            corrupted: 0,
            collectors: Vec::new(),
            notifiers: Vec::new(),
            collector_state: CollectorState::Idle,
            layout,
        };
        if options.reset {
            let (base, end) = (store.layout.base, store.layout.end);
            store.flash.erase(base, end - base);
        }
        store.scan_blocks(options);
        if store.blocks_to_erase || store.pages_available < store.layout.pages_kept_free {
            store.run_collector();
        }
        Ok(store)
    }

    /// Scans blocks from high to low addresses and classifies each one.
    fn scan_blocks(&mut self, options: &MountOptions) {
        let mut block = self.layout.end;
        while block > self.layout.base {
            block -= self.layout.block_size;
            let magic = self.read_word(block);
            if magic == MAGIC {
                self.first = block;
                if self.read_word(block + 4) == ERASED_WORD {
                    // Half-initialized: crashed between the magic and the
                    // generation program. Complete the format if the rest
                    // of the block is untouched, reclaim it otherwise.
                    if self.block_empty_from(block, block + 8) && self.format_block(block, 1) {
                        continue;
                    }
                    self.shred_block_header(block);
                    self.blocks_to_erase = true;
                } else {
                    let check = self.check_pages(block);
                    if check.all_erasable() {
                        // Nothing live remains; reclaim the whole block.
                        self.mark_erasable(block);
                    } else {
                        self.pages_available += check.free;
                    }
                }
            } else if self.block_empty(block) {
                self.pages_available += self.layout.pages_per_block;
            } else if magic == 0 {
                // Already scheduled for erase before the reset.
                self.blocks_to_erase = true;
            } else if options.ignore_corrupted {
                self.corrupted += 1;
            } else {
                self.shred_block_header(block);
                self.blocks_to_erase = true;
            }
        }
    }

    /// Consumes the store and returns the underlying flash.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Reads the bytes of a record.
    pub fn get(&self, span: Span) -> &[u8] {
        self.flash.read(span.offset, span.len)
    }

    /// Returns the number of pages available for allocation.
    pub fn pages_available(&self) -> usize {
        self.pages_available
    }

    /// Returns how many corrupted blocks the mount left untouched.
    ///
    /// Always zero unless the store was mounted with
    /// [`MountOptions::ignore_corrupted`].
    pub fn corrupted_blocks(&self) -> usize {
        self.corrupted
    }

    /// Iterates over all blocks of the region.
    pub fn blocks(&self) -> impl Iterator<Item = BlockRef> {
        (self.layout.base..self.layout.end)
            .step_by(self.layout.block_size)
            .map(BlockRef)
    }

    /// Iterates over the blocks holding any formatted state.
    pub fn used_blocks(&self) -> impl Iterator<Item = BlockRef> {
        (self.first..self.layout.end)
            .step_by(self.layout.block_size)
            .map(BlockRef)
    }

    /// Reads a word of flash.
    pub(crate) fn read_word(&self, offset: usize) -> u32 {
        let mut word = [0; 4];
        word.copy_from_slice(self.flash.read(offset, 4));
        u32::from_le_bytes(word)
    }

    /// Whether the byte range reads as all-ones, word by word.
    pub(crate) fn all_ones(&self, offset: usize, length: usize) -> bool {
        self.flash.read(offset, length).iter().all(|&b| b == 0xff)
    }
}
