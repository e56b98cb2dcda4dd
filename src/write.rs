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

//! Record mutation.
//!
//! Records become visible atomically: the payload is programmed first and
//! the first word (for fixed records) or the fused length and first word
//! (on double-word flash) last, so an interruption at any point leaves
//! either a free slot or a slot the next writer shreds and skips. Program
//! failures are repaired locally by shredding the damaged words and
//! retrying at the next candidate offset; they are never surfaced.

use crate::layout::ERASED_WORD;
use crate::{Flash, Id, PageRef, Span, Store, StoreError, StoreResult};
use alloc::vec::Vec;

/// Reads up to four bytes as a little-endian word, missing bytes erased.
fn word_from(bytes: &[u8]) -> u32 {
    let mut word = [0xff; 4];
    let n = bytes.len().min(4);
    word[..n].copy_from_slice(&bytes[..n]);
    u32::from_le_bytes(word)
}

impl<F: Flash> Store<F> {
    /// Adds a fixed-width record; its first four bytes are the key.
    ///
    /// If a new page is required, it is allocated with a fixed record size
    /// large enough to hold the record. The returned span covers the whole
    /// record.
    ///
    /// # Panics
    ///
    /// Panics if `record` is empty or longer than 16 bits.
    pub fn add_fixed(&mut self, id: Id, record: &[u8]) -> StoreResult<Span> {
        let first_word = word_from(record);
        let rest = record.get(4..).unwrap_or(&[]);
        self.add_impl(id, first_word, rest, record.len(), false, false)
    }

    /// Adds a fixed-width record under an explicit 32-bit key.
    ///
    /// The stored record is the key word followed by `value`. The returned
    /// span covers `value` only.
    pub fn add_fixed_keyed(&mut self, id: Id, key: u32, value: &[u8]) -> StoreResult<Span> {
        self.add_impl(id, key, value, value.len() + 4, false, false)
            .map(skip_key)
    }

    /// Adds a variable-length record; its first four bytes are the key.
    ///
    /// If a new page is required, it is allocated with variable record
    /// format.
    ///
    /// # Panics
    ///
    /// Panics if `record` is empty or longer than 16 bits.
    pub fn add_var(&mut self, id: Id, record: &[u8]) -> StoreResult<Span> {
        let first_word = word_from(record);
        let rest = record.get(4..).unwrap_or(&[]);
        self.add_impl(id, first_word, rest, record.len(), true, false)
    }

    /// Adds a variable-length record under an explicit 32-bit key.
    pub fn add_var_keyed(&mut self, id: Id, key: u32, value: &[u8]) -> StoreResult<Span> {
        self.add_impl(id, key, value, value.len() + 4, true, false)
            .map(skip_key)
    }

    /// Replaces all fixed records with the given key by a new one.
    ///
    /// If the newest stored instance already equals `value`, nothing is
    /// written. The returned span covers `value` only.
    pub fn replace_fixed(&mut self, id: Id, key: u32, value: &[u8]) -> StoreResult<Span> {
        self.replace_impl(id, key, value, value.len() + 4, false)
            .map(skip_key)
    }

    /// Replaces all variable records with the given key by a new one.
    pub fn replace_var(&mut self, id: Id, key: u32, value: &[u8]) -> StoreResult<Span> {
        self.replace_impl(id, key, value, value.len() + 4, true)
            .map(skip_key)
    }

    /// Deletes all records with the given key.
    ///
    /// Returns whether any record was deleted. Notifies listeners once
    /// after the last deletion.
    pub fn delete(&mut self, id: Id, key: u32) -> bool {
        let mut rec = match self.find_unordered_first(id, key) {
            Some(rec) => rec,
            None => return false,
        };
        loop {
            self.shred_record_at(rec.offset);
            match self.find_unordered_next(rec, key) {
                Some(next) => rec = next,
                None => break,
            }
        }
        self.notify(id);
        true
    }

    /// Stores a record in the newest page with the given id.
    ///
    /// `rest` holds the record bytes after the first word and `total_len`
    /// the record length including it. When the newest page is unsuitable
    /// (wrong format, narrow slots, or no room) a new page is allocated
    /// and more attempts are made until the record sticks or the region is
    /// exhausted.
    pub(crate) fn add_impl(
        &mut self,
        id: Id,
        first_word: u32,
        rest: &[u8],
        total_len: usize,
        var: bool,
        no_notify: bool,
    ) -> StoreResult<Span> {
        assert!(total_len > 0 && total_len <= u16::MAX as usize);
        let required = self.layout.align_up(total_len);
        let max = self.layout.page_payload() - if var { 4 } else { 0 };
        if required > max {
            return Err(StoreError::NoSpace);
        }
        let mut target = self
            .newest_page(id)
            .map(|page| (page, self.find_free(page.0)));
        loop {
            let suitable = match target {
                Some((page, Some(free))) => {
                    let record_size = self.page_record_size(page.0) as usize;
                    let fits = free + required <= self.payload_end(page.0);
                    let format_ok = var == (record_size == 0);
                    let width_ok = var || required <= record_size;
                    if fits && format_ok && width_ok {
                        Some((page, free))
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let (page, free) = match suitable {
                Some(target) => target,
                None => {
                    let record_size = if var { 0 } else { required as u16 };
                    let page = self.new_page(id, record_size).ok_or(StoreError::NoSpace)?;
                    (page, self.payload_start(page.0) + if var { 4 } else { 0 })
                }
            };
            if let Some(span) = self.write_impl(page.0, free, first_word, rest, total_len) {
                if !no_notify {
                    self.notify(id);
                }
                return Ok(span);
            }
            target = None;
        }
    }

    /// Ensures a single record is stored with the given key.
    ///
    /// Older duplicates are shredded as they are found. If the surviving
    /// record already matches the new content it is returned unchanged;
    /// otherwise the new record is added first and the survivor shredded
    /// after, so a reader sees at least one of the two. Listeners are
    /// notified once.
    pub(crate) fn replace_impl(
        &mut self,
        id: Id,
        first_word: u32,
        rest: &[u8],
        total_len: usize,
        var: bool,
    ) -> StoreResult<Span> {
        let mut rec = match self.find_unordered_first(id, first_word) {
            Some(rec) => rec,
            None => return self.add_impl(id, first_word, rest, total_len, var, false),
        };
        while let Some(next) = self.find_unordered_next(rec, first_word) {
            // Keep whichever of the two is newer.
            if self.compare_age(rec.offset, next.offset) < 0 {
                self.shred_record_at(rec.offset);
                rec = next;
            } else {
                self.shred_record_at(next.offset);
            }
        }
        let same_len = rec.len == total_len || (!var && rec.len > total_len);
        if same_len
            && (total_len <= 4
                || self.flash.read(rec.offset + 4, total_len - 4) == &rest[..total_len - 4])
        {
            // Identical content, nothing to rewrite.
            return Ok(rec);
        }
        let result = self.add_impl(id, first_word, rest, total_len, var, true);
        if result.is_ok() {
            self.shred_record_at(rec.offset);
        }
        self.notify(id);
        result
    }

    /// Tries to write a record at `free`, retrying within the page.
    ///
    /// Returns `None` once the page is exhausted; the caller then finds or
    /// allocates another page.
    pub(crate) fn write_impl(
        &mut self,
        page: usize,
        free: usize,
        first_word: u32,
        rest: &[u8],
        total_len: usize,
    ) -> Option<Span> {
        if self.layout.double_write() {
            self.write_double_impl(page, free, first_word, rest, total_len)
        } else {
            self.write_single_impl(page, free, first_word, rest, total_len)
        }
    }

    /// Write path for single-word flash.
    ///
    /// Variable records first reserve their slot by programming the length
    /// word; a failed reservation is shredded into a skip token and the
    /// write moves one word ahead. The first word is programmed last.
    fn write_single_impl(
        &mut self,
        page: usize,
        mut free: usize,
        first_word: u32,
        rest: &[u8],
        total_len: usize,
    ) -> Option<Span> {
        let record_size = self.page_record_size(page) as usize;
        let end = self.payload_end(page);
        let required = self.layout.align_up(total_len);
        loop {
            if record_size != 0 {
                if free + record_size > end {
                    return None;
                }
            } else {
                loop {
                    if free + required > end {
                        return None;
                    }
                    if self.flash.write_word(free - 4, total_len as u32) {
                        break;
                    }
                    // The zero length becomes a skip token for readers.
                    self.flash.shred_word(free - 4);
                    free += 4;
                }
            }
            let payload_ok = total_len <= 4 || self.flash.write(free + 4, &rest[..total_len - 4]);
            if payload_ok && self.flash.write_word(free, first_word) {
                return Some(Span {
                    offset: free,
                    len: total_len,
                });
            }
            self.shred_record_at(free);
            free += if record_size != 0 {
                record_size
            } else {
                self.layout.var_skip(total_len)
            };
        }
    }

    /// Write path for double-word flash.
    ///
    /// A length word cannot be programmed alone, so variable records write
    /// their payload first and fuse the length and first word last. The
    /// target window must be clean before writing: unfinished double-words
    /// left by an interrupted writer are shredded and skipped.
    fn write_double_impl(
        &mut self,
        page: usize,
        mut free: usize,
        first_word: u32,
        rest: &[u8],
        total_len: usize,
    ) -> Option<Span> {
        let record_size = self.page_record_size(page) as usize;
        let end = self.payload_end(page);
        if record_size != 0 {
            loop {
                if free + record_size > end {
                    return None;
                }
                if self.all_ones(free, self.layout.align_up(total_len)) {
                    let payload_ok =
                        total_len <= 8 || self.flash.write(free + 8, &rest[4..total_len - 4]);
                    if payload_ok && self.flash.write_double(free, first_word, word_from(rest)) {
                        return Some(Span {
                            offset: free,
                            len: total_len,
                        });
                    }
                }
                self.flash.shred_double(free);
                free += record_size;
            }
        } else {
            loop {
                let window = free - 4 + self.layout.var_skip(total_len);
                if window > end {
                    return None;
                }
                // Also check the word past the record, so a valid-looking
                // unfinished record cannot expose garbage behind it.
                let window = if window < end { window + 8 } else { window };
                let mut top = window;
                while top > free && self.all_ones(top - 8, 8) {
                    top -= 8;
                }
                if top > free {
                    // Unfinished writes in the window: shred and skip them.
                    let new_free = top + 4;
                    let mut shred = top;
                    while shred > free {
                        shred -= 8;
                        self.flash.shred_double(shred);
                    }
                    free = new_free;
                    continue;
                }
                let payload_ok =
                    total_len <= 4 || self.flash.write(free + 4, &rest[..total_len - 4]);
                if payload_ok && self.flash.write_double(free - 4, total_len as u32, first_word) {
                    return Some(Span {
                        offset: free,
                        len: total_len,
                    });
                }
                // Retry in place: whatever the failed program left behind
                // is detected as garbage on the next pass.
            }
        }
    }

    /// Shreds a record so readers skip it.
    ///
    /// On double-word flash a variable record is shredded back to front,
    /// one double-word at a time: shredding the length first would make
    /// the payload look like the header of the next record. An implausible
    /// length shreds to the end of the page instead.
    pub(crate) fn shred_record_at(&mut self, rec: usize) {
        if !self.layout.double_write() {
            self.flash.shred_word(rec);
            return;
        }
        let page = self.layout.page_of(rec);
        if self.page_record_size(page) != 0 {
            self.flash.shred_double(rec);
            return;
        }
        let total_len = self.read_word(rec - 4);
        debug_assert!(total_len != 0 && total_len != ERASED_WORD);
        let start = rec - 4;
        let mut end = start + self.layout.var_skip(total_len as usize);
        if end > self.payload_end(page) {
            end = self.payload_end(page);
        }
        let mut shred = end;
        while shred > start {
            shred -= 8;
            self.flash.shred_double(shred);
        }
    }

    /// Moves all live records of `from` into `to`.
    ///
    /// The move is simulated first and aborted before any write if a
    /// record would not fit. A non-zero `limit` caps how many destination
    /// bytes may be consumed. Each moved record is shredded at the source
    /// once its copy verifies. Returns whether the source was fully
    /// drained.
    ///
    /// # Panics
    ///
    /// Panics if the pages do not share the same id.
    pub fn move_records(&mut self, from: PageRef, to: PageRef, limit: usize) -> bool {
        assert!(self.page_id_raw(from.0) == self.page_id_raw(to.0));
        let record_size = self.page_record_size(to.0) as usize;
        let mut free = match self.find_free(to.0) {
            Some(free) => free,
            None => return false,
        };
        let end = self.payload_end(to.0);
        let free_max = if limit != 0 && free + limit < end {
            free + limit
        } else {
            end
        };
        // Simulate the move and start only if everything fits.
        let mut test_free = free;
        let mut rec = self.first_record(from);
        while let Some(r) = rec {
            if record_size != 0 {
                if test_free + record_size > free_max || r.len > record_size {
                    return false;
                }
                test_free += record_size;
            } else {
                let required = self.layout.var_skip(r.len);
                if test_free - 4 + required > free_max {
                    return false;
                }
                test_free += required;
            }
            rec = self.next_record(r);
        }
        let mut moved = 0;
        let mut success = true;
        let mut rec = self.first_record(from);
        while let Some(r) = rec {
            if free >= end {
                success = false;
                break;
            }
            let first_word = self.read_word(r.offset);
            let rest: Vec<u8> = self.flash.read(r.offset + 4, r.len.saturating_sub(4)).into();
            match self.write_impl(to.0, free, first_word, &rest, r.len) {
                Some(span) => {
                    self.shred_record_at(r.offset);
                    free = span.offset
                        + if record_size != 0 {
                            record_size
                        } else {
                            self.layout.var_skip(r.len)
                        };
                    moved += 1;
                    rec = self.next_record(r);
                }
                None => {
                    success = false;
                    break;
                }
            }
        }
        if moved > 0 {
            let id = self.page_id(from);
            self.notify(id);
        }
        success
    }
}

/// Drops the leading key word from a record span.
fn skip_key(span: Span) -> Span {
    Span {
        offset: span.offset + 4,
        len: span.len - 4,
    }
}
