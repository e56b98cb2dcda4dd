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

//! Log-structured record store for NOR-like flash
//!
//! # Specification
//!
//! The [store](Store) keeps per-id append-only logs of records on top of a
//! [flash](Flash) interface whose cells can only be programmed from 1 to 0;
//! restoring bits requires erasing a whole block. The store survives power
//! loss at any instruction boundary: committed records are never lost and
//! partially written records are never exposed as valid.
//!
//! ## Layout
//!
//! The region is carved into erase *blocks*, each holding an 8-byte header
//! and a number of fixed-size logical *pages*:
//!
//! - Block header: `magic(4)` then `generation(4)`. The magic is the ASCII
//!   bytes `NVRM` read little-endian; the generation counts erase cycles.
//! - Page header: `id(4)`, `sequence(2)`, `record_size(2)`, followed by the
//!   page payload. A `record_size` of zero means variable-length records,
//!   anything else is the fixed record width in bytes.
//! - Fixed record: `record_size` bytes whose first word is the key. A zero
//!   first word is a shredded record, all-ones is free space.
//! - Variable record: a length word followed by that many payload bytes,
//!   padded to the write alignment. A zero length is a skip token, an
//!   all-ones length ends the log. The first payload word is the key.
//!
//! The first word of each unit encodes its state so that a single shred
//! (programming zeros) retires it:
//!
//! | Block state | magic      | generation |
//! | ----------- | ---------- | ---------- |
//! | empty       | all-ones   | all-ones   |
//! | valid       | `NVRM`     | finite     |
//! | half-init   | `NVRM`     | all-ones   |
//! | erasable    | zero       | any        |
//! | corrupted   | anything else          ||
//!
//! ## Power-fail safety
//!
//! Mutations order their programs so that the word making a record visible
//! is always written last: the first word for fixed records, the length
//! word for variable records on single-word flash, and the fused length
//! and first word pair on double-word flash. An interrupted write leaves
//! either untouched free space or a partial slot that the next writer
//! shreds into a skip token. [Mounting](Store::mount) repairs
//! half-formatted blocks the same way.
//!
//! ## Wear and reclamation
//!
//! Pages with the same id form a stream ordered by a 16-bit wrapping
//! sequence number. The [collector](Store::step) keeps a reserve of free
//! pages by running registered [strategies](Strategy) (discarding the
//! oldest page, relocating live records, cleaning up drained pages) and by
//! erasing blocks whose pages are all tombstoned. Block generations are
//! preserved across erases so wear can be observed.
//!
//! ## Concurrency model
//!
//! The store is single-threaded and cooperative. Mutating methods take
//! `&mut self` and complete synchronously; the collector does one bounded
//! unit of work per [`Store::step`] call, which hosts invoke from their
//! idle loop.

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
extern crate alloc;

mod block;
mod buffer;
mod collect;
mod facade;
#[cfg(feature = "std")]
mod file;
mod flash;
mod layout;
mod page;
mod search;
mod store;
#[cfg(test)]
mod test;
mod version;
mod write;

pub use self::buffer::{BufferFlash, BufferOptions};
pub use self::collect::{Progress, Strategy};
pub use self::facade::{
    Entry, FixedKeyStorage, FixedStorage, FixedUniqueKeyStorage, VariableKeyStorage,
    VariableStorage, VariableUniqueKeyStorage,
};
#[cfg(feature = "std")]
pub use self::file::FileFlash;
pub use self::flash::Flash;
pub use self::store::{
    BlockRef, Id, MountOptions, PageRef, Span, Store, StoreError, StoreResult,
};
pub use self::version::VersionTracker;
