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

//! Record traversal and search.
//!
//! Within a page, fixed records stride by the page record size and
//! variable records chain through their length words. A zero first word
//! (or zero length) marks a shredded record to skip; an all-ones word
//! marks the end of the log. A search key of zero matches any live record.

use crate::layout::ERASED_WORD;
use crate::{Flash, Id, PageRef, Span, Store};

/// Selects the page order a search follows.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chain {
    /// Stay on the current page.
    None,

    /// Enumeration order, no age guarantee.
    Unordered,

    /// Oldest to newest.
    Oldest,

    /// Newest to oldest.
    Newest,
}

impl<F: Flash> Store<F> {
    fn chain_next(&self, page: PageRef, chain: Chain) -> Option<PageRef> {
        match chain {
            Chain::None => None,
            Chain::Unordered => self.next_page(page),
            Chain::Oldest => self.oldest_next(page),
            Chain::Newest => self.newest_next(page),
        }
    }

    /// Scans pages forward for the first match after `after`.
    ///
    /// Starts at the beginning of `page` when `after` is `None`.
    pub(crate) fn find_forward(
        &self,
        page: PageRef,
        after: Option<usize>,
        first_word: u32,
        chain: Chain,
    ) -> Option<Span> {
        let mut page = page;
        let mut after = after;
        loop {
            let end = self.payload_end(page.0);
            let record_size = self.page_record_size(page.0) as usize;
            if record_size != 0 {
                let mut rec = match after {
                    Some(rec) => rec + record_size,
                    None => self.payload_start(page.0),
                };
                while rec + record_size <= end {
                    let first = self.read_word(rec);
                    if first == ERASED_WORD {
                        break;
                    }
                    if first != 0 && (first_word == 0 || first == first_word) {
                        return Some(Span {
                            offset: rec,
                            len: record_size,
                        });
                    }
                    rec += record_size;
                }
            } else {
                let mut rec = match after {
                    Some(rec) => rec + self.layout.var_skip(self.read_word(rec - 4) as usize),
                    None => self.payload_start(page.0) + 4,
                };
                while rec < end {
                    let len = self.read_word(rec - 4);
                    if len == ERASED_WORD {
                        break;
                    }
                    if len != 0 {
                        // An erased first word is a reservation that was
                        // never finalized; it must not surface as a record.
                        let first = self.read_word(rec);
                        if first != 0
                            && first != ERASED_WORD
                            && (first_word == 0 || first == first_word)
                        {
                            return Some(Span {
                                offset: rec,
                                len: len as usize,
                            });
                        }
                    }
                    rec += self.layout.var_skip(len as usize);
                }
            }
            page = self.chain_next(page, chain)?;
            after = None;
        }
    }

    /// Scans pages for the last match before `stop`.
    ///
    /// Walks each page forward remembering the last match, which makes it
    /// the newest record of the page since addresses grow with age within
    /// a page.
    pub(crate) fn find_backward(
        &self,
        page: PageRef,
        stop: Option<usize>,
        first_word: u32,
        chain: Chain,
    ) -> Option<Span> {
        let mut page = page;
        let mut stop = stop;
        loop {
            let end = self.payload_end(page.0);
            let record_size = self.page_record_size(page.0) as usize;
            let mut found = None;
            if record_size != 0 {
                let mut rec = self.payload_start(page.0);
                while rec + record_size <= end && Some(rec) != stop {
                    let first = self.read_word(rec);
                    if first == ERASED_WORD {
                        break;
                    }
                    if first != 0 && (first_word == 0 || first == first_word) {
                        found = Some(rec);
                    }
                    rec += record_size;
                }
                if let Some(rec) = found {
                    return Some(Span {
                        offset: rec,
                        len: record_size,
                    });
                }
            } else {
                let mut rec = self.payload_start(page.0) + 4;
                while rec < end && Some(rec) != stop {
                    let len = self.read_word(rec - 4);
                    if len == ERASED_WORD {
                        break;
                    }
                    if len != 0 {
                        let first = self.read_word(rec);
                        if first != 0
                            && first != ERASED_WORD
                            && (first_word == 0 || first == first_word)
                        {
                            found = Some(rec);
                        }
                    }
                    rec += self.layout.var_skip(len as usize);
                }
                if let Some(rec) = found {
                    return Some(Span {
                        offset: rec,
                        len: self.read_word(rec - 4) as usize,
                    });
                }
            }
            page = self.chain_next(page, chain)?;
            stop = None;
        }
    }

    /// Returns the first matching record, in no particular order.
    ///
    /// A `first_word` of zero matches any live record.
    pub fn find_unordered_first(&self, id: Id, first_word: u32) -> Option<Span> {
        let page = self.first_page(id)?;
        self.find_forward(page, None, first_word, Chain::Unordered)
    }

    /// Returns the next matching record after `rec`, in no particular
    /// order.
    pub fn find_unordered_next(&self, rec: Span, first_word: u32) -> Option<Span> {
        let page = PageRef(self.layout.page_of(rec.offset));
        self.find_forward(page, Some(rec.offset), first_word, Chain::Unordered)
    }

    /// Returns the newest matching record.
    pub fn find_newest_first(&self, id: Id, first_word: u32) -> Option<Span> {
        let page = self.newest_page(id)?;
        self.find_backward(page, None, first_word, Chain::Newest)
    }

    /// Returns the next older matching record before `rec`.
    pub fn find_newest_next(&self, rec: Span, first_word: u32) -> Option<Span> {
        let page = PageRef(self.layout.page_of(rec.offset));
        self.find_backward(page, Some(rec.offset), first_word, Chain::Newest)
    }

    /// Returns the oldest matching record.
    pub fn find_oldest_first(&self, id: Id, first_word: u32) -> Option<Span> {
        let page = self.oldest_page(id)?;
        self.find_forward(page, None, first_word, Chain::Oldest)
    }

    /// Returns the next newer matching record after `rec`.
    pub fn find_oldest_next(&self, rec: Span, first_word: u32) -> Option<Span> {
        let page = PageRef(self.layout.page_of(rec.offset));
        self.find_forward(page, Some(rec.offset), first_word, Chain::Oldest)
    }

    /// Returns the first live record of a single page.
    pub fn first_record(&self, page: PageRef) -> Option<Span> {
        self.find_forward(page, None, 0, Chain::None)
    }

    /// Returns the last live record of a single page.
    pub fn last_record(&self, page: PageRef) -> Option<Span> {
        self.find_backward(page, None, 0, Chain::None)
    }

    /// Returns the next live record of the same page after `rec`.
    pub fn next_record(&self, rec: Span) -> Option<Span> {
        let page = PageRef(self.layout.page_of(rec.offset));
        self.find_forward(page, Some(rec.offset), 0, Chain::None)
    }
}

#[cfg(test)]
mod tests {
    use crate::test::{DOUBLE, MINIMAL};
    use crate::Id;

    const TEST: Id = Id::tag(b"TEST");

    #[test]
    fn fixed_orderings_agree_on_one_page() {
        let mut store = MINIMAL.new_store();
        store.add_fixed(TEST, &[1, 2]).unwrap();
        store.add_fixed(TEST, &[3, 4]).unwrap();
        let u1 = store.find_unordered_first(TEST, 0).unwrap();
        let u2 = store.find_unordered_next(u1, 0).unwrap();
        assert!(store.find_unordered_next(u2, 0).is_none());
        let n1 = store.find_newest_first(TEST, 0).unwrap();
        let n2 = store.find_newest_next(n1, 0).unwrap();
        assert!(store.find_newest_next(n2, 0).is_none());
        let o1 = store.find_oldest_first(TEST, 0).unwrap();
        let o2 = store.find_oldest_next(o1, 0).unwrap();
        assert!(store.find_oldest_next(o2, 0).is_none());
        assert_eq!(o1, n2);
        assert_eq!(o2, n1);
        assert_eq!(&store.get(o1)[..2], &[1, 2]);
        assert_eq!(&store.get(n1)[..2], &[3, 4]);
    }

    #[test]
    fn shredded_records_are_skipped() {
        let mut store = MINIMAL.new_store();
        store.add_fixed_keyed(TEST, 1, &[1, 1, 1, 1]).unwrap();
        store.add_fixed_keyed(TEST, 2, &[2, 2, 2, 2]).unwrap();
        store.add_fixed_keyed(TEST, 3, &[3, 3, 3, 3]).unwrap();
        assert!(store.delete(TEST, 2));
        let first = store.find_unordered_first(TEST, 0).unwrap();
        let second = store.find_unordered_next(first, 0).unwrap();
        assert!(store.find_unordered_next(second, 0).is_none());
        assert_eq!(store.read_word(first.offset), 1);
        assert_eq!(store.read_word(second.offset), 3);
    }

    #[test]
    fn key_match_filters_records() {
        let mut store = MINIMAL.new_store();
        store.add_fixed_keyed(TEST, 1, &[1, 0, 0, 0]).unwrap();
        store.add_fixed_keyed(TEST, 2, &[2, 0, 0, 0]).unwrap();
        store.add_fixed_keyed(TEST, 1, &[3, 0, 0, 0]).unwrap();
        let newest = store.find_newest_first(TEST, 1).unwrap();
        assert_eq!(store.get(newest)[4], 3);
        let oldest = store.find_oldest_first(TEST, 1).unwrap();
        assert_eq!(store.get(oldest)[4], 1);
        assert!(store.find_unordered_first(TEST, 4).is_none());
    }

    #[test]
    fn variable_records_chain_by_length() {
        let mut store = MINIMAL.new_store();
        store.add_var(TEST, &[1]).unwrap();
        store.add_var(TEST, &[2, 3, 4]).unwrap();
        store.add_var(TEST, &[5, 6, 7, 8, 9, 10]).unwrap();
        let o1 = store.find_oldest_first(TEST, 0).unwrap();
        let o2 = store.find_oldest_next(o1, 0).unwrap();
        let o3 = store.find_oldest_next(o2, 0).unwrap();
        assert_eq!(store.get(o1), &[1]);
        assert_eq!(store.get(o2), &[2, 3, 4]);
        assert_eq!(store.get(o3), &[5, 6, 7, 8, 9, 10]);
        assert!(store.find_oldest_next(o3, 0).is_none());
    }

    #[test]
    fn search_spans_pages_newest_to_oldest() {
        let mut store = MINIMAL.new_store();
        // Spill the same key across at least two pages.
        let fill = [0u8; 76];
        let mut last = 0u32;
        while store.scan(TEST).map_or(true, |(n, o)| n == o) {
            last += 1;
            store.add_fixed_keyed(TEST, 7, &fill).unwrap();
            store
                .add_fixed_keyed(TEST, 100 + last, &fill)
                .unwrap();
        }
        let newest = store.find_newest_first(TEST, 100 + last).unwrap();
        assert_eq!(store.get(newest)[..4], (100 + last).to_le_bytes());
        // The newest chain for key 7 crosses the page boundary.
        let n1 = store.find_newest_first(TEST, 7).unwrap();
        let n2 = store.find_newest_next(n1, 7).unwrap();
        assert!(store.compare_age(n2.offset, n1.offset) < 0);
    }

    #[test]
    fn single_page_record_iteration() {
        let mut store = DOUBLE.new_store();
        store.add_var(TEST, &[1, 2]).unwrap();
        store.add_var(TEST, &[3]).unwrap();
        let page = store.first_page(TEST).unwrap();
        let first = store.first_record(page).unwrap();
        let last = store.last_record(page).unwrap();
        assert_eq!(store.get(first), &[1, 2]);
        assert_eq!(store.get(last), &[3]);
        let next = store.next_record(first).unwrap();
        assert_eq!(next, last);
        assert!(store.next_record(next).is_none());
    }
}
