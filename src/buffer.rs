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

//! Flash emulation for testing.
//!
//! [`BufferFlash`] implements the [`Flash`] interface over a buffer in
//! memory. It enforces AND-semantics by construction, tracks program and
//! erase counters, simulates erase latency, and can interrupt an
//! operation mid-way to reproduce a power loss: the interrupted operation
//! applies only a prefix of its effect and every later mutation panics,
//! so the buffer afterwards holds exactly the bits a real power cut would
//! have left.

use crate::Flash;
use alloc::boxed::Box;

/// Options of a buffer flash.
#[derive(Clone, Debug)]
pub struct BufferOptions {
    /// Size of an erase block in bytes.
    pub block_size: usize,

    /// Whether the flash programs one double-word at a time.
    pub double_write: bool,

    /// How many times a word may change between erase cycles.
    pub max_word_writes: usize,

    /// How many times a block may be erased.
    pub max_block_erases: usize,

    /// Whether exceeding the write and erase ceilings panics.
    pub strict_mode: bool,

    /// How many interrupted attempts each block erase reports before
    /// completing.
    pub erase_delay: usize,
}

/// Simulates a NOR flash using a buffer in memory.
#[derive(Clone)]
pub struct BufferFlash {
    /// Content of the flash.
    storage: Box<[u8]>,

    /// Options of the flash.
    options: BufferOptions,

    /// Number of times each word changed since its block was erased.
    word_writes: Box<[usize]>,

    /// Number of times each block was erased.
    block_erases: Box<[usize]>,

    /// Remaining interrupted attempts of the erase in progress.
    pending_erase: Option<(usize, usize)>,

    /// Interruption state.
    interruption: Interruption,
}

impl BufferFlash {
    /// Creates a buffer flash.
    ///
    /// # Panics
    ///
    /// The following preconditions must hold:
    /// - `options.block_size` must be a power of two and a multiple of 8.
    /// - `storage.len()` must be block-aligned.
    pub fn new(storage: Box<[u8]>, options: BufferOptions) -> BufferFlash {
        assert!(options.block_size.is_power_of_two());
        assert!(options.block_size % 8 == 0);
        assert!(storage.len() % options.block_size == 0);
        let num_words = storage.len() / 4;
        let num_blocks = storage.len() / options.block_size;
        BufferFlash {
            storage,
            options,
            word_writes: alloc::vec![0; num_words].into_boxed_slice(),
            block_erases: alloc::vec![0; num_blocks].into_boxed_slice(),
            pending_erase: None,
            interruption: Interruption::Ready,
        }
    }

    /// Creates an erased buffer flash of `size` bytes.
    pub fn erased(size: usize, options: BufferOptions) -> BufferFlash {
        BufferFlash::new(alloc::vec![0xff; size].into_boxed_slice(), options)
    }

    /// Arms an interruption after a given number of mutating operations.
    ///
    /// The `delay`-th subsequent mutating operation applies only its first
    /// `keep` bytes of effect and reports failure. All later mutating
    /// operations panic, simulating the device losing power. Reads keep
    /// working so the final flash image can be inspected and remounted
    /// after [`reset_interruption`](BufferFlash::reset_interruption).
    ///
    /// # Panics
    ///
    /// Panics if an interruption is already armed.
    pub fn arm_interruption(&mut self, delay: usize, keep: usize) {
        self.interruption.arm(delay, keep);
    }

    /// Disarms an interruption that did not trigger, returning the
    /// remaining delay.
    ///
    /// # Panics
    ///
    /// Panics if no interruption was armed or it has triggered.
    pub fn disarm_interruption(&mut self) -> usize {
        match self.interruption {
            Interruption::Armed { delay, .. } => {
                self.interruption = Interruption::Ready;
                delay
            }
            _ => panic!("interruption was not armed"),
        }
    }

    /// Resets the interruption state regardless of triggering.
    pub fn reset_interruption(&mut self) {
        self.interruption = Interruption::Ready;
        self.pending_erase = None;
    }

    /// Whether an armed interruption has triggered.
    pub fn tripped(&self) -> bool {
        matches!(self.interruption, Interruption::Tripped)
    }

    /// Returns the number of times a word changed since its block was
    /// erased.
    pub fn get_word_writes(&self, word: usize) -> usize {
        self.word_writes[word]
    }

    /// Returns the number of times a block was erased.
    pub fn get_block_erases(&self, block: usize) -> usize {
        self.block_erases[block]
    }

    fn is_word_aligned(&self, x: usize) -> bool {
        x % 4 == 0
    }

    fn is_block_aligned(&self, x: usize) -> bool {
        x % self.options.block_size == 0
    }

    /// Programs `data` into the range at `offset` with AND-semantics.
    ///
    /// Only the first `limit` bytes take effect. Returns whether the
    /// full range reads back as `data`.
    fn program(&mut self, offset: usize, data: &[u8], limit: usize) -> bool {
        let mut changed = alloc::vec![false; (data.len() + 7) / 4];
        for (i, &byte) in data.iter().take(limit).enumerate() {
            let cell = &mut self.storage[offset + i];
            if *cell & byte != *cell {
                changed[(offset + i) / 4 - offset / 4] = true;
            }
            *cell &= byte;
        }
        for (i, &word_changed) in changed.iter().enumerate() {
            if word_changed {
                let word = offset / 4 + i;
                self.word_writes[word] += 1;
                if self.options.strict_mode {
                    assert!(
                        self.word_writes[word] <= self.options.max_word_writes,
                        "word {} written too many times",
                        word
                    );
                }
            }
        }
        limit >= data.len() && &self.storage[offset..offset + data.len()] == data
    }

    /// Erases the first `limit` bytes of the range at `offset`.
    fn wipe(&mut self, offset: usize, length: usize, limit: usize) {
        for byte in &mut self.storage[offset..offset + length.min(limit)] {
            *byte = 0xff;
        }
        if limit >= length {
            for block in offset / self.options.block_size
                ..(offset + length + self.options.block_size - 1) / self.options.block_size
            {
                self.block_erases[block] += 1;
                if self.options.strict_mode {
                    assert!(
                        self.block_erases[block] <= self.options.max_block_erases,
                        "block {} erased too many times",
                        block
                    );
                }
                let words = self.options.block_size / 4;
                for word in block * words..(block + 1) * words {
                    self.word_writes[word] = 0;
                }
            }
        }
    }
}

impl Flash for BufferFlash {
    fn len(&self) -> usize {
        self.storage.len()
    }

    fn block_size(&self) -> usize {
        self.options.block_size
    }

    fn write_alignment(&self) -> usize {
        if self.options.double_write {
            8
        } else {
            4
        }
    }

    fn read(&self, offset: usize, length: usize) -> &[u8] {
        &self.storage[offset..offset + length]
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> bool {
        assert!(offset + data.len() <= self.storage.len());
        match self.interruption.tick() {
            None => self.program(offset, data, data.len()),
            Some(keep) => {
                self.program(offset, data, keep);
                false
            }
        }
    }

    fn write_word(&mut self, offset: usize, word: u32) -> bool {
        assert!(self.is_word_aligned(offset));
        let data = word.to_le_bytes();
        match self.interruption.tick() {
            None => self.program(offset, &data, 4),
            Some(keep) => {
                self.program(offset, &data, keep);
                false
            }
        }
    }

    fn write_double(&mut self, offset: usize, lo: u32, hi: u32) -> bool {
        assert!(self.options.double_write);
        assert!(offset % 8 == 0);
        let mut data = [0; 8];
        data[..4].copy_from_slice(&lo.to_le_bytes());
        data[4..].copy_from_slice(&hi.to_le_bytes());
        match self.interruption.tick() {
            None => self.program(offset, &data, 8),
            Some(keep) => {
                self.program(offset, &data, keep);
                false
            }
        }
    }

    fn shred_word(&mut self, offset: usize) {
        assert!(self.is_word_aligned(offset));
        let keep = self.interruption.tick().unwrap_or(4);
        self.program(offset, &[0; 4], keep);
    }

    fn shred_double(&mut self, offset: usize) {
        assert!(self.options.double_write);
        assert!(offset % 8 == 0);
        let keep = self.interruption.tick().unwrap_or(8);
        self.program(offset, &[0; 8], keep);
    }

    fn erase(&mut self, offset: usize, length: usize) {
        assert!(self.is_block_aligned(offset) && self.is_block_aligned(length));
        let keep = self.interruption.tick().unwrap_or(length);
        self.wipe(offset, length, keep);
    }

    fn erase_block(&mut self, offset: usize) -> bool {
        assert!(self.is_block_aligned(offset));
        let block_size = self.options.block_size;
        match self.interruption.tick() {
            None => (),
            Some(keep) => {
                // Power loss mid-erase: part of the block is erased, the
                // rest keeps its previous content.
                self.wipe(offset, block_size, keep);
                return false;
            }
        }
        match self.pending_erase {
            Some((pending, remaining)) if pending == offset => {
                if remaining > 1 {
                    self.pending_erase = Some((pending, remaining - 1));
                    return false;
                }
                self.pending_erase = None;
            }
            _ if self.options.erase_delay > 0 => {
                self.pending_erase = Some((offset, self.options.erase_delay));
                return false;
            }
            _ => (),
        }
        self.wipe(offset, block_size, block_size);
        true
    }
}

impl core::fmt::Display for BufferFlash {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        let words = self.options.block_size / 4;
        for block in 0..self.storage.len() / self.options.block_size {
            write!(f, "[{}]", self.block_erases[block])?;
            for word in 0..words {
                let index = (block * words + word) * 4;
                write!(f, " [{}]", self.word_writes[block * words + word])?;
                for byte in &self.storage[index..index + 4] {
                    write!(f, "{:02x}", byte)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Controls when an operation is interrupted.
#[derive(Clone)]
enum Interruption {
    /// Mutable operations have normal behavior.
    Ready,

    /// If the delay is positive, mutable operations decrement it. At
    /// zero, the operation applies `keep` bytes of its effect and fails.
    Armed { delay: usize, keep: usize },

    /// Power is lost; mutable operations panic.
    Tripped,
}

impl Interruption {
    fn arm(&mut self, delay: usize, keep: usize) {
        match self {
            Interruption::Ready => *self = Interruption::Armed { delay, keep },
            _ => panic!("interruption already armed"),
        }
    }

    /// Accounts one mutating operation.
    ///
    /// Returns `None` to proceed normally, or the number of effect bytes
    /// to keep for the operation that gets interrupted.
    ///
    /// # Panics
    ///
    /// Panics once an interruption has triggered.
    fn tick(&mut self) -> Option<usize> {
        match self {
            Interruption::Ready => None,
            Interruption::Armed { delay, keep } if *delay == 0 => {
                let keep = *keep;
                *self = Interruption::Tripped;
                Some(keep)
            }
            Interruption::Armed { delay, .. } => {
                *delay -= 1;
                None
            }
            Interruption::Tripped => panic!("power lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: BufferOptions = BufferOptions {
        block_size: 512,
        double_write: false,
        max_word_writes: 2,
        max_block_erases: 3,
        strict_mode: true,
        erase_delay: 0,
    };

    // Decreasing bit patterns: bits only change from 1 to 0.
    const BLANK_WORD: u32 = 0xffffffff;
    const FIRST_WORD: u32 = 0x77bbddee;
    const SECOND_WORD: u32 = 0x65a9c9ca;

    fn new_flash() -> BufferFlash {
        BufferFlash::erased(2 * OPTIONS.block_size, OPTIONS.clone())
    }

    fn read_word(flash: &BufferFlash, offset: usize) -> u32 {
        let mut word = [0; 4];
        word.copy_from_slice(flash.read(offset, 4));
        u32::from_le_bytes(word)
    }

    #[test]
    fn read_write_ok() {
        let mut flash = new_flash();
        assert_eq!(read_word(&flash, 0), BLANK_WORD);
        assert!(flash.write_word(0, FIRST_WORD));
        assert_eq!(read_word(&flash, 0), FIRST_WORD);
        assert_eq!(read_word(&flash, 4), BLANK_WORD);
    }

    #[test]
    fn write_is_and_semantics() {
        let mut flash = new_flash();
        assert!(flash.write_word(0, SECOND_WORD));
        // Raising bits back does not stick and the verify reports it.
        assert!(!flash.write_word(0, FIRST_WORD));
        assert_eq!(read_word(&flash, 0), SECOND_WORD & FIRST_WORD);
    }

    #[test]
    fn erase_restores_all_ones() {
        let mut flash = new_flash();
        assert!(flash.write_word(0, FIRST_WORD));
        assert!(flash.write_word(OPTIONS.block_size, FIRST_WORD));
        flash.erase(0, OPTIONS.block_size);
        assert_eq!(read_word(&flash, 0), BLANK_WORD);
        assert_eq!(read_word(&flash, OPTIONS.block_size), FIRST_WORD);
    }

    #[test]
    #[should_panic]
    fn write_three_times_panics() {
        let mut flash = new_flash();
        flash.write_word(0, FIRST_WORD);
        flash.write_word(0, SECOND_WORD);
        flash.write_word(0, 0);
    }

    #[test]
    fn erase_resets_write_counters() {
        let mut flash = new_flash();
        flash.write_word(0, FIRST_WORD);
        flash.write_word(0, SECOND_WORD);
        flash.erase(0, OPTIONS.block_size);
        assert_eq!(flash.get_word_writes(0), 0);
        assert!(flash.write_word(0, FIRST_WORD));
        assert_eq!(flash.get_block_erases(0), 1);
    }

    #[test]
    fn erase_block_reports_latency() {
        let mut options = OPTIONS.clone();
        options.erase_delay = 2;
        let mut flash = BufferFlash::erased(2 * options.block_size, options);
        flash.write_word(0, FIRST_WORD);
        assert!(!flash.erase_block(0));
        assert!(!flash.erase_block(0));
        assert!(flash.erase_block(0));
        assert_eq!(read_word(&flash, 0), BLANK_WORD);
    }

    #[test]
    fn interruption_keeps_a_prefix() {
        let mut flash = new_flash();
        flash.arm_interruption(1, 2);
        assert!(flash.write_word(0, FIRST_WORD));
        // The second operation is cut after two bytes.
        assert!(!flash.write_word(4, SECOND_WORD));
        assert!(flash.tripped());
        let bytes = SECOND_WORD.to_le_bytes();
        assert_eq!(flash.read(4, 4), &[bytes[0], bytes[1], 0xff, 0xff]);
    }

    #[test]
    #[should_panic]
    fn mutation_after_trip_panics() {
        let mut flash = new_flash();
        flash.arm_interruption(0, 0);
        let _ = flash.write_word(0, FIRST_WORD);
        let _ = flash.write_word(4, SECOND_WORD);
    }

    #[test]
    fn disarm_returns_remaining_delay() {
        let mut flash = new_flash();
        flash.arm_interruption(3, 0);
        assert!(flash.write_word(0, FIRST_WORD));
        assert_eq!(flash.disarm_interruption(), 2);
    }
}
