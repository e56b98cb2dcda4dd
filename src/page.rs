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

//! Page allocation and age ordering.
//!
//! Pages with the same id form a logical stream ordered by a 16-bit
//! sequence number compared under wrap-around. The first page discovered
//! for an id anchors the comparison: every other page is classified as
//! strictly before the anchor or at/after it, which turns the wrapping
//! sequence space into a total order (ties broken by address).

use crate::layout::{BLOCK_HEADER, ERASED_WORD, PAGE_HEADER};
use crate::{Flash, Id, PageRef, Store};

/// Whether `a` is before `b` in 16-bit wrap-around order.
pub(crate) fn seq_lt(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// Signed distance from `b` to `a` in 16-bit wrap-around order.
pub(crate) fn seq_diff(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

impl<F: Flash> Store<F> {
    /// Returns the raw id word of a page.
    pub(crate) fn page_id_raw(&self, page: usize) -> u32 {
        self.read_word(page)
    }

    /// Returns the id of a valid page.
    pub fn page_id(&self, page: PageRef) -> Id {
        Id(self.page_id_raw(page.0))
    }

    /// Returns the sequence number of a page.
    pub fn page_sequence(&self, page: PageRef) -> u16 {
        self.read_word(page.0 + 4) as u16
    }

    /// Returns the fixed record width of a page, or zero for variable
    /// records.
    pub(crate) fn page_record_size(&self, page: usize) -> u16 {
        (self.read_word(page + 4) >> 16) as u16
    }

    /// Offset of the first payload byte of a page.
    pub(crate) fn payload_start(&self, page: usize) -> usize {
        page + PAGE_HEADER
    }

    /// Offset one past the last payload byte of a page.
    pub(crate) fn payload_end(&self, page: usize) -> usize {
        page + self.layout.page_size
    }

    /// Whether the page reads as all-ones, header included.
    pub(crate) fn page_empty(&self, page: usize) -> bool {
        self.all_ones(page, self.layout.page_size)
    }

    /// Returns the first page with the given id, in no particular order.
    pub fn first_page(&self, id: Id) -> Option<PageRef> {
        if self.first == self.layout.end {
            return None;
        }
        self.fast_enum(self.first, self.first + BLOCK_HEADER, id)
    }

    /// Returns the next page with the same id, in no particular order.
    pub fn next_page(&self, page: PageRef) -> Option<PageRef> {
        let id = self.page_id(page);
        let block = self.layout.block_of(page.0);
        self.fast_enum(block, page.0 + self.layout.page_size, id)
    }

    /// Continues an unordered page enumeration.
    ///
    /// Scans the remaining slots of `block` starting at `page`, then the
    /// following valid blocks. Pages fill a block in order, so an erased
    /// id word ends the current block.
    pub(crate) fn fast_enum(&self, block: usize, page: usize, id: Id) -> Option<PageRef> {
        let mut block = block;
        let mut page = page;
        loop {
            let end = block + BLOCK_HEADER + self.layout.pages_per_block * self.layout.page_size;
            while page < end {
                let pid = self.page_id_raw(page);
                if pid == ERASED_WORD {
                    break;
                }
                if pid == id.0 {
                    return Some(PageRef(page));
                }
                page += self.layout.page_size;
            }
            loop {
                block += self.layout.block_size;
                if block >= self.layout.end {
                    return None;
                }
                if self.block_is_valid(block) {
                    break;
                }
            }
            page = block + BLOCK_HEADER;
        }
    }

    /// Returns the newest and oldest page with the given id.
    ///
    /// The first page discovered anchors the wrap-around comparison; see
    /// the module documentation.
    pub fn scan(&self, id: Id) -> Option<(PageRef, PageRef)> {
        let first = self.first_page(id)?;
        let anchor = self.page_sequence(first);
        let (mut newest, mut oldest) = (first, first);
        let (mut newest_rank, mut oldest_rank) = (0i16, 0i16);
        let mut page = first;
        while let Some(next) = self.next_page(page) {
            let rank = seq_diff(self.page_sequence(next), anchor);
            if rank < oldest_rank {
                oldest = next;
                oldest_rank = rank;
            }
            // Enumeration is in address order, so on equal rank the later
            // page wins the newest spot and the earlier keeps the oldest.
            if rank >= newest_rank {
                newest = next;
                newest_rank = rank;
            }
            page = next;
        }
        Some((newest, oldest))
    }

    /// Returns the pages logically just before and just after `page`.
    ///
    /// Uses the same anchored total order as [`Store::scan`], so chaining
    /// visits every page with the id exactly once.
    pub fn scan_from(&self, page: PageRef) -> (Option<PageRef>, Option<PageRef>) {
        let id = self.page_id(page);
        let first = match self.first_page(id) {
            Some(first) => first,
            None => return (None, None),
        };
        let anchor = self.page_sequence(first);
        let key = (seq_diff(self.page_sequence(page), anchor), page.0);
        let mut older: Option<(i16, usize)> = None;
        let mut newer: Option<(i16, usize)> = None;
        let mut current = Some(first);
        while let Some(p) = current {
            let k = (seq_diff(self.page_sequence(p), anchor), p.0);
            if k < key && older.map_or(true, |o| k > o) {
                older = Some(k);
            }
            if k > key && newer.map_or(true, |n| k < n) {
                newer = Some(k);
            }
            current = self.next_page(p);
        }
        (
            older.map(|(_, offset)| PageRef(offset)),
            newer.map(|(_, offset)| PageRef(offset)),
        )
    }

    /// Returns the newest page with the given id.
    pub fn newest_page(&self, id: Id) -> Option<PageRef> {
        self.scan(id).map(|(newest, _)| newest)
    }

    /// Returns the oldest page with the given id.
    pub fn oldest_page(&self, id: Id) -> Option<PageRef> {
        self.scan(id).map(|(_, oldest)| oldest)
    }

    /// Returns the next older page with the same id.
    pub fn newest_next(&self, page: PageRef) -> Option<PageRef> {
        self.scan_from(page).0
    }

    /// Returns the next newer page with the same id.
    pub fn oldest_next(&self, page: PageRef) -> Option<PageRef> {
        self.scan_from(page).1
    }

    /// Compares the age of two records by page sequence, or by address
    /// within the same page.
    pub(crate) fn compare_age(&self, a: usize, b: usize) -> i32 {
        let page_a = self.layout.page_of(a);
        let page_b = self.layout.page_of(b);
        if page_a != page_b {
            seq_diff(
                self.page_sequence(PageRef(page_a)),
                self.page_sequence(PageRef(page_b)),
            ) as i32
        } else if a < b {
            -1
        } else if a > b {
            1
        } else {
            0
        }
    }

    /// Returns the first free slot of a page, or `None` when full.
    ///
    /// For variable pages the returned offset is the payload position; its
    /// length word lives four bytes below.
    pub(crate) fn find_free(&self, page: usize) -> Option<usize> {
        let end = self.payload_end(page);
        let record_size = self.page_record_size(page) as usize;
        if record_size != 0 {
            let mut rec = self.payload_start(page);
            while rec + record_size <= end {
                if self.read_word(rec) == ERASED_WORD {
                    return Some(rec);
                }
                rec += record_size;
            }
        } else {
            let mut rec = self.payload_start(page) + 4;
            while rec < end {
                let len = self.read_word(rec - 4);
                if len == ERASED_WORD {
                    return Some(rec);
                }
                rec += self.layout.var_skip(len as usize);
            }
        }
        None
    }

    /// Allocates a new page for an id.
    ///
    /// A single pass over the valid blocks finds both the highest sequence
    /// in use for the id and the first free page slot. The new page gets
    /// the next sequence number, or 1 when the id has no pages yet. If no
    /// slot is free a new block is formatted. Returns `None` when the
    /// region is exhausted.
    pub fn new_page(&mut self, id: Id, record_size: u16) -> Option<PageRef> {
        debug_assert!(id.0 != 0 && id.0 != ERASED_WORD);
        let mut seq: Option<u16> = None;
        let mut free: Option<usize> = None;
        for block in self.blocks_from(self.first) {
            if !self.block_is_valid(block) {
                continue;
            }
            for page in self.page_slots(block) {
                let pid = self.page_id_raw(page);
                if pid == id.0 {
                    let s = self.page_sequence(PageRef(page));
                    if seq.map_or(true, |cur| seq_lt(cur, s)) {
                        seq = Some(s);
                    }
                } else if free.is_none() && pid == ERASED_WORD {
                    if self.page_empty(page) {
                        free = Some(page);
                        break;
                    }
                    // Leftover of an interrupted allocation; retire it so
                    // pages keep filling the block in order.
                    self.shred_page_header(page);
                }
            }
        }
        let seq = seq.map_or(1, |s| s.wrapping_add(1));
        let header = seq as u32 | ((record_size as u32) << 16);
        loop {
            let page = match free.take() {
                Some(page) => page,
                None => match self.new_block() {
                    Some(block) => self.layout.page_addr(block, 0),
                    None => return None,
                },
            };
            let ok = if self.layout.double_write() {
                self.flash.write_double(page, id.0, header)
            } else {
                self.flash.write_word(page + 4, header) && self.flash.write_word(page, id.0)
            };
            if ok {
                self.pages_available -= 1;
                // Keep the reserve topped up in the background.
                self.run_collector();
                return Some(PageRef(page));
            }
            // The slot did not verify; shred it and walk over any adjacent
            // damage within the block before retrying.
            self.shred_page_header(page);
            free = self.skip_damaged_slots(page);
            if free.is_none() {
                free = self.find_free_slot_after(self.layout.block_of(page));
            }
        }
    }

    /// Shreds a page header so the slot reads as erasable.
    pub(crate) fn shred_page_header(&mut self, page: usize) {
        if self.layout.double_write() {
            self.flash.shred_double(page);
        } else {
            self.flash.shred_word(page);
        }
    }

    /// Advances over damaged slots following `page` in the same block.
    ///
    /// Slots that look free but are not fully erased get shredded on the
    /// way. Returns the next empty slot, or `None` when the block is
    /// exhausted.
    fn skip_damaged_slots(&mut self, page: usize) -> Option<usize> {
        let block = self.layout.block_of(page);
        let end = block + BLOCK_HEADER + self.layout.pages_per_block * self.layout.page_size;
        let mut slot = page + self.layout.page_size;
        while slot < end {
            if self.page_empty(slot) {
                return Some(slot);
            }
            if self.page_id_raw(slot) == ERASED_WORD {
                self.shred_page_header(slot);
            }
            slot += self.layout.page_size;
        }
        None
    }

    /// Finds an empty page slot in the valid blocks after `block`.
    fn find_free_slot_after(&mut self, block: usize) -> Option<usize> {
        let start = block + self.layout.block_size;
        for block in self.blocks_from(start) {
            if !self.block_is_valid(block) {
                continue;
            }
            for page in self.page_slots(block) {
                if self.page_id_raw(page) == ERASED_WORD {
                    if self.page_empty(page) {
                        return Some(page);
                    }
                    self.shred_page_header(page);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MINIMAL;
    use crate::Store;

    const TEST: Id = Id::tag(b"TEST");

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_lt(1, 2));
        assert!(!seq_lt(2, 1));
        assert!(seq_lt(0xffff, 0));
        assert!(seq_lt(0xfffe, 1));
        assert!(!seq_lt(1, 0x8002));
        assert_eq!(seq_diff(0, 0xffff), 1);
        assert_eq!(seq_diff(0xffff, 0), -1);
    }

    #[test]
    fn new_page_is_found() {
        let mut store = MINIMAL.new_store();
        let page = store.new_page(TEST, 0).unwrap();
        assert_eq!(store.first_page(TEST), Some(page));
        assert_eq!(store.page_sequence(page), 1);
        assert_eq!(store.page_record_size(page.0), 0);
        assert!(store.next_page(page).is_none());
    }

    #[test]
    fn sequences_count_up() {
        let mut store = MINIMAL.new_store();
        for i in 0..MINIMAL.num_pages() {
            let page = store.new_page(TEST, 8).unwrap();
            assert_eq!(store.page_sequence(page) as usize, i + 1);
        }
        assert!(store.new_page(TEST, 8).is_none());
    }

    /// Formats one block and forges page headers with chosen sequences.
    fn forge(store: &mut Store<crate::BufferFlash>, sequences: &[u16]) {
        let block = store.new_block().unwrap();
        for (i, &seq) in sequences.iter().enumerate() {
            let page = store.layout.page_addr(block, i);
            let header = seq as u32 | (8 << 16);
            assert!(store.flash.write_word(page + 4, header));
            assert!(store.flash.write_word(page, TEST.0));
        }
    }

    #[test]
    fn scan_handles_wraparound() {
        let mut store = MINIMAL.new_store();
        // Two blocks of forged pages spanning the 16-bit wrap.
        forge(&mut store, &[0xfffe, 0xffff]);
        forge(&mut store, &[0x0000, 0x0001]);
        let (newest, oldest) = store.scan(TEST).unwrap();
        assert_eq!(store.page_sequence(oldest), 0xfffe);
        assert_eq!(store.page_sequence(newest), 0x0001);
        // The oldest chain passes the wrap in logical order.
        let mut seqs = alloc::vec::Vec::new();
        let mut page = Some(oldest);
        while let Some(p) = page {
            seqs.push(store.page_sequence(p));
            page = store.oldest_next(p);
        }
        assert_eq!(seqs, [0xfffe, 0xffff, 0x0000, 0x0001]);
    }

    #[test]
    fn scan_chains_cover_every_page_once() {
        let mut store = MINIMAL.new_store();
        forge(&mut store, &[5, 3]);
        forge(&mut store, &[4, 6]);
        let (newest, oldest) = store.scan(TEST).unwrap();
        let mut down = 0;
        let mut page = Some(newest);
        while let Some(p) = page {
            down += 1;
            page = store.newest_next(p);
        }
        let mut up = 0;
        let mut page = Some(oldest);
        while let Some(p) = page {
            up += 1;
            page = store.oldest_next(p);
        }
        assert_eq!(down, 4);
        assert_eq!(up, 4);
    }

    #[test]
    fn allocation_after_wrap_continues_the_stream() {
        let mut store = MINIMAL.new_store();
        forge(&mut store, &[0xffff]);
        let page = store.new_page(TEST, 8).unwrap();
        assert_eq!(store.page_sequence(page), 0);
        let (newest, oldest) = store.scan(TEST).unwrap();
        assert_eq!(store.page_sequence(oldest), 0xffff);
        assert_eq!(store.page_sequence(newest), 0);
    }

    #[test]
    fn find_free_strides_fixed_records() {
        let mut store = MINIMAL.new_store();
        let page = store.new_page(TEST, 8).unwrap();
        let start = store.payload_start(page.0);
        assert_eq!(store.find_free(page.0), Some(start));
        store.add_fixed(TEST, &[1, 2, 3, 4]).unwrap();
        assert_eq!(store.find_free(page.0), Some(start + 8));
    }

    #[test]
    fn find_free_chains_variable_records() {
        let mut store = MINIMAL.new_store();
        let page = store.new_page(TEST, 0).unwrap();
        let start = store.payload_start(page.0) + 4;
        assert_eq!(store.find_free(page.0), Some(start));
        store.add_var(TEST, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(
            store.find_free(page.0),
            Some(start + store.layout.var_skip(5))
        );
    }
}
