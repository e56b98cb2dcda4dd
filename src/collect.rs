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

//! Background reclamation.
//!
//! The collector is a cooperative task that keeps a reserve of free pages
//! by running registered reclamation strategies and erasing blocks whose
//! pages are all tombstoned. It is driven by [`Store::step`], one bounded
//! unit of work per call, so hosts can run it from their idle loop. An
//! interrupted block erase holds its position and is retried on the next
//! step.

use crate::{Flash, Id, PageRef, Store};
use alloc::boxed::Box;

/// A page reclamation strategy registered with
/// [`Store::register_collector`].
///
/// Each invocation returns a page to tombstone, or `None` when the
/// strategy has nothing left to reclaim for its id.
pub enum Strategy<F: Flash> {
    /// Reclaims the oldest page of the id, live records included.
    DiscardOldest,

    /// Moves the live records of an old page into the newest page, then
    /// reclaims the drained page. Never moves more than half a page
    /// payload, so reclaiming a mostly-live page is not attempted.
    Relocate,

    /// Reclaims old pages that hold no live records.
    Cleanup,

    /// A custom strategy.
    Custom(fn(&mut Store<F>, Id) -> Option<PageRef>),
}

impl<F: Flash> Clone for Strategy<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: Flash> Copy for Strategy<F> {}

pub(crate) struct CollectorEntry<F: Flash> {
    pub id: Id,
    pub level: u8,
    pub strategy: Strategy<F>,
}

impl<F: Flash> Clone for CollectorEntry<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: Flash> Copy for CollectorEntry<F> {}

pub(crate) struct NotifierEntry {
    pub id: Id,
    pub notify: Box<dyn FnMut(Id)>,
}

/// Where the collector task resumes on the next step.
#[derive(Clone, Copy)]
pub(crate) enum CollectorState {
    Idle,

    /// Run the non-destructive strategies once.
    Start,

    /// Decide between erasing, stopping, or destructive collection.
    Check,

    /// Erase pass in progress; the offset is the next block to consider.
    Erase(usize),

    /// Run one destructive collection pass.
    Destructive,
}

/// Reports whether a [`Store::step`] call left work pending.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Progress {
    /// More collector work is pending; keep stepping.
    Busy,

    /// The collector is idle.
    Idle,
}

impl<F: Flash> Store<F> {
    /// Registers a collector for an id at the given level.
    ///
    /// Collectors run in ascending level order. Level 0 strategies are
    /// non-destructive and run on every collection; higher levels only run
    /// when the free-page reserve is low, one reclaimed page at a time.
    /// Registering the same id and level again replaces the strategy in
    /// place.
    pub fn register_collector(&mut self, id: Id, level: u8, strategy: Strategy<F>) {
        let mut index = self.collectors.len();
        for (i, entry) in self.collectors.iter_mut().enumerate() {
            if entry.id == id && entry.level == level {
                entry.strategy = strategy;
                return;
            }
            if entry.level > level {
                index = i;
                break;
            }
        }
        self.collectors
            .insert(index, CollectorEntry { id, level, strategy });
    }

    /// Registers a notifier called whenever records of `id` change.
    pub fn register_notifier(&mut self, id: Id, notifier: impl FnMut(Id) + 'static) {
        self.notifiers.push(NotifierEntry {
            id,
            notify: Box::new(notifier),
        });
    }

    /// Notifies the listeners registered for `id`.
    pub(crate) fn notify(&mut self, id: Id) {
        for entry in &mut self.notifiers {
            if entry.id == id {
                (entry.notify)(id);
            }
        }
    }

    /// Arms the collector task if it is not already running.
    pub fn run_collector(&mut self) {
        if !self.collecting {
            self.collecting = true;
            self.collector_state = CollectorState::Start;
        }
    }

    /// Performs one bounded unit of collector work.
    ///
    /// Hosts call this from their idle loop; each call runs at most one
    /// collection pass or one block erase attempt.
    pub fn step(&mut self) -> Progress {
        match self.collector_state {
            CollectorState::Idle => Progress::Idle,
            CollectorState::Start => {
                self.collect(false);
                self.collector_state = CollectorState::Check;
                Progress::Busy
            }
            CollectorState::Check => {
                if self.blocks_to_erase {
                    self.collector_state = CollectorState::Erase(self.layout.base);
                } else if self.pages_available >= self.layout.pages_kept_free {
                    self.finish_collecting();
                } else {
                    self.collector_state = CollectorState::Destructive;
                }
                Progress::Busy
            }
            CollectorState::Erase(block) => {
                self.collector_state = self.erase_step(block);
                Progress::Busy
            }
            CollectorState::Destructive => {
                if self.collect(true) == 0 && !self.blocks_to_erase {
                    // Nothing more can be reclaimed; stop with the free
                    // pages we have.
                    self.finish_collecting();
                } else {
                    self.collector_state = CollectorState::Check;
                }
                Progress::Busy
            }
        }
    }

    /// Runs the collector until it goes idle, returning the step count.
    pub fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while self.step() == Progress::Busy {
            steps += 1;
        }
        steps
    }

    /// Triggers a collection and drives it to completion.
    pub fn collect_now(&mut self) -> usize {
        self.run_collector();
        self.run_until_idle()
    }

    fn finish_collecting(&mut self) {
        self.collecting = false;
        self.collector_state = CollectorState::Idle;
    }

    /// Executes the registered collectors in level order.
    ///
    /// A non-destructive pass stops before the first level above 0. A
    /// destructive pass lets each higher-level collector reclaim exactly
    /// one page, so the cheapest strategies are preferred incrementally.
    pub(crate) fn collect(&mut self, destructive: bool) -> usize {
        let mut collected = 0;
        let mut index = 0;
        while index < self.collectors.len() {
            let entry = self.collectors[index];
            index += 1;
            if !destructive && entry.level > 0 {
                break;
            }
            while let Some(page) = self.run_strategy(entry.strategy, entry.id) {
                self.erase_page(page);
                collected += 1;
                if entry.level > 0 {
                    break;
                }
            }
        }
        collected
    }

    fn run_strategy(&mut self, strategy: Strategy<F>, id: Id) -> Option<PageRef> {
        match strategy {
            Strategy::DiscardOldest => self.oldest_page(id),
            Strategy::Relocate => self.relocate(id),
            Strategy::Cleanup => self.cleanup(id),
            Strategy::Custom(f) => f(self, id),
        }
    }

    /// Finds an old page whose records all fit into the newest page,
    /// moving them there.
    fn relocate(&mut self, id: Id) -> Option<PageRef> {
        let (newest, oldest) = self.scan(id)?;
        if oldest == newest {
            // Fewer than two pages, nothing to relocate.
            return None;
        }
        let mut page = oldest;
        while page != newest {
            if self.move_records(page, newest, self.layout.page_payload() / 2) {
                return Some(page);
            }
            page = self.oldest_next(page)?;
        }
        None
    }

    /// Finds an old page with no live records.
    fn cleanup(&mut self, id: Id) -> Option<PageRef> {
        let (newest, oldest) = self.scan(id)?;
        let mut page = oldest;
        while page != newest {
            if self.first_record(page).is_none() {
                return Some(page);
            }
            page = self.oldest_next(page)?;
        }
        None
    }

    /// Tombstones a page; the block follows when its last page goes.
    pub(crate) fn erase_page(&mut self, page: PageRef) {
        self.shred_page_header(page.0);
        let block = self.layout.block_of(page.0);
        if self.check_pages(block).all_erasable() {
            self.mark_erasable(block);
        }
    }

    /// Tombstones every page with the given id.
    ///
    /// Returns how many pages were reclaimed; the collector is armed to
    /// erase the freed blocks in the background.
    pub fn erase_all(&mut self, id: Id) -> usize {
        let mut count = 0;
        let mut page = self.first_page(id);
        while let Some(p) = page {
            let block = self.layout.block_of(p.0);
            let next_slot = p.0 + self.layout.page_size;
            self.erase_page(p);
            count += 1;
            page = self.fast_enum(block, next_slot, id);
        }
        if count > 0 {
            self.run_collector();
        }
        count
    }

    /// Erases the next erasable block at or after `block`.
    ///
    /// Returns the state to resume from: the same block when the erase
    /// was interrupted, the following block after an attempt, or the
    /// check state once the pass walked the whole region. Blocks that
    /// fail verification are left erasable for a later pass rather than
    /// retried, so the pass always terminates.
    fn erase_step(&mut self, from: usize) -> CollectorState {
        let mut block = from;
        while block < self.layout.end {
            if self.block_is_erasable(block) {
                let generation = self.preserved_generation(block);
                if !self.flash.erase_block(block) {
                    // Interrupted; retry this block on the next step.
                    return CollectorState::Erase(block);
                }
                if !self.block_empty(block) {
                    self.shred_block_header(block);
                } else if generation == 0 || self.format_block(block, generation.wrapping_add(1)) {
                    self.pages_available += self.layout.pages_per_block;
                }
                return CollectorState::Erase(block + self.layout.block_size);
            }
            block += self.layout.block_size;
        }
        self.blocks_to_erase = false;
        CollectorState::Check
    }
}
