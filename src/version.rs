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

use crate::{Flash, Id, Store};
use alloc::rc::Rc;
use core::cell::Cell;

/// Tracks a monotone version number for a page id.
///
/// The counter starts at 1 and increments whenever records of the id
/// change, letting higher layers invalidate caches cheaply.
pub struct VersionTracker {
    version: Rc<Cell<u32>>,
}

impl VersionTracker {
    /// Returns the current version.
    pub fn version(&self) -> u32 {
        self.version.get()
    }

    /// Whether `cached` is still the current version.
    ///
    /// Updates `cached` and returns `false` when it was stale.
    pub fn is_current(&self, cached: &mut u32) -> bool {
        let version = self.version.get();
        if *cached == version {
            return true;
        }
        *cached = version;
        false
    }
}

impl<F: Flash> Store<F> {
    /// Registers a version tracker for a page id.
    pub fn register_version_tracker(&mut self, id: Id) -> VersionTracker {
        let version: Rc<Cell<u32>> = Rc::new(Cell::new(1));
        let counter = version.clone();
        self.register_notifier(id, move |_| counter.set(counter.get().wrapping_add(1)));
        VersionTracker { version }
    }
}
