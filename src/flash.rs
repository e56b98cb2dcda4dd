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

/// Abstracts a NOR-like flash storage.
///
/// The storage is a contiguous byte range whose cells can only be programmed
/// from 1 to 0. Restoring bits to 1 requires erasing a whole block.
///
/// Programs are verified by read-back: a `true` result means the programmed
/// range now reads back as the requested value. A `false` result means some
/// bits did not stick (because they were already programmed to 0, or because
/// the program was cut short); the affected range may hold any value
/// reachable from its previous content by clearing bits. Shreds program
/// zeros, which cannot fail observably.
///
/// Addresses are byte offsets from the start of the usable range. The store
/// guarantees that offsets are in bounds and aligned as documented per
/// method; implementations may assert these preconditions.
pub trait Flash {
    /// The size in bytes of the usable range.
    fn len(&self) -> usize;

    /// The size in bytes of an erase block.
    ///
    /// An erase block is the smallest unit of erasable flash. Must be a
    /// power of two and divide [`len`](Flash::len) evenly.
    fn block_size(&self) -> usize;

    /// The program alignment in bytes, either 4 or 8.
    ///
    /// A value of 8 means the flash can only be programmed one double-word
    /// at a time and [`write_double`](Flash::write_double) is the atomic
    /// program operation.
    fn write_alignment(&self) -> usize;

    /// Reads a byte slice from the storage.
    fn read(&self, offset: usize, length: usize) -> &[u8];

    /// Programs a byte range with AND-semantics and verifies it.
    ///
    /// Both `offset` and `data.len()` must be aligned to
    /// [`write_alignment`](Flash::write_alignment).
    fn write(&mut self, offset: usize, data: &[u8]) -> bool;

    /// Programs a single word and verifies it.
    ///
    /// The `offset` must be word-aligned.
    fn write_word(&mut self, offset: usize, word: u32) -> bool;

    /// Programs a double-word as one atomic operation and verifies it.
    ///
    /// The `offset` must be double-word-aligned. Only meaningful when
    /// [`write_alignment`](Flash::write_alignment) is 8.
    fn write_double(&mut self, offset: usize, lo: u32, hi: u32) -> bool;

    /// Unconditionally programs a word to zero.
    fn shred_word(&mut self, offset: usize);

    /// Unconditionally programs a double-word to zero.
    fn shred_double(&mut self, offset: usize);

    /// Synchronously erases a byte range to all-ones.
    ///
    /// Both `offset` and `length` must be block-aligned.
    fn erase(&mut self, offset: usize, length: usize);

    /// Makes one attempt at erasing the block containing `offset`.
    ///
    /// Returns `false` if the erase was interrupted and should be retried.
    /// The block contents are unspecified until an attempt returns `true`.
    fn erase_block(&mut self, offset: usize) -> bool;
}

/// Forwarding implementation so a store can borrow its flash.
///
/// This permits simulating a reboot by dropping the store and mounting the
/// same flash again.
impl<F: Flash> Flash for &mut F {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn write_alignment(&self) -> usize {
        (**self).write_alignment()
    }

    fn read(&self, offset: usize, length: usize) -> &[u8] {
        (**self).read(offset, length)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> bool {
        (**self).write(offset, data)
    }

    fn write_word(&mut self, offset: usize, word: u32) -> bool {
        (**self).write_word(offset, word)
    }

    fn write_double(&mut self, offset: usize, lo: u32, hi: u32) -> bool {
        (**self).write_double(offset, lo, hi)
    }

    fn shred_word(&mut self, offset: usize) {
        (**self).shred_word(offset)
    }

    fn shred_double(&mut self, offset: usize) {
        (**self).shred_double(offset)
    }

    fn erase(&mut self, offset: usize, length: usize) {
        (**self).erase(offset, length)
    }

    fn erase_block(&mut self, offset: usize) -> bool {
        (**self).erase_block(offset)
    }
}
