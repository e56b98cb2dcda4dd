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

//! Typed storage helpers.
//!
//! These bind a page id to a record shape and add nothing beyond
//! definitional sugar over the page-level operations. Fixed-size records
//! are viewed in place through zerocopy, so reads borrow straight from
//! flash.

use crate::{Flash, Id, Span, Store, StoreResult};
use core::marker::PhantomData;
use core::ops::Deref;
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// A typed view of a record in flash.
///
/// Dereferences to the record value. For keyed storage the leading key
/// word is split off and exposed by [`Entry::key`].
pub struct Entry<'a, T: ?Sized> {
    key: u32,
    raw: Span,
    value: &'a T,
}

impl<'a, T: ?Sized> Clone for Entry<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: ?Sized> Copy for Entry<'a, T> {}

impl<'a, T: ?Sized> Entry<'a, T> {
    /// The 32-bit key of the record, for keyed storage.
    pub fn key(&self) -> u32 {
        self.key
    }

    /// The span of the whole record, key included.
    pub fn span(&self) -> Span {
        self.raw
    }
}

impl<'a, T: ?Sized> Deref for Entry<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

/// Views record bytes as a reference to `T`.
///
/// # Panics
///
/// Panics if the record is shorter than `T`, which means the page was
/// written with a different record shape.
fn typed<T: FromBytes + Unaligned>(bytes: &[u8]) -> &T {
    match T::ref_from_prefix(bytes) {
        Some(value) => value,
        None => panic!("record does not fit the storage type"),
    }
}

fn fixed_entry<F: Flash, T: FromBytes + Unaligned>(store: &Store<F>, raw: Span) -> Entry<'_, T> {
    Entry {
        key: 0,
        raw,
        value: typed(store.get(raw)),
    }
}

fn fixed_key_entry<F: Flash, T: FromBytes + Unaligned>(
    store: &Store<F>,
    raw: Span,
) -> Entry<'_, T> {
    let bytes = store.get(raw);
    let mut key = [0; 4];
    key.copy_from_slice(&bytes[..4]);
    Entry {
        key: u32::from_le_bytes(key),
        raw,
        value: typed(&bytes[4..]),
    }
}

fn var_entry<F: Flash>(store: &Store<F>, raw: Span) -> Entry<'_, [u8]> {
    Entry {
        key: 0,
        raw,
        value: store.get(raw),
    }
}

fn var_key_entry<F: Flash>(store: &Store<F>, raw: Span) -> Entry<'_, [u8]> {
    let bytes = store.get(raw);
    let mut key = [0; 4];
    key.copy_from_slice(&bytes[..4]);
    Entry {
        key: u32::from_le_bytes(key),
        raw,
        value: &bytes[4..],
    }
}

/// Restores the full record span from a value span returned by the keyed
/// mutation methods.
fn with_key(span: Span) -> Span {
    Span {
        offset: span.offset - 4,
        len: span.len + 4,
    }
}

/// Storage of fixed-size records of type `T`.
pub struct FixedStorage<T> {
    id: Id,
    _marker: PhantomData<T>,
}

impl<T: AsBytes + FromBytes + Unaligned> FixedStorage<T> {
    pub const fn new(id: Id) -> Self {
        FixedStorage {
            id,
            _marker: PhantomData,
        }
    }

    /// Returns the first record, in no particular order.
    pub fn unordered_first<'a, F: Flash>(&self, store: &'a Store<F>) -> Option<Entry<'a, T>> {
        Some(fixed_entry(store, store.find_unordered_first(self.id, 0)?))
    }

    /// Returns the next record, in no particular order.
    pub fn unordered_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, T>,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_entry(store, store.find_unordered_next(after.raw, 0)?))
    }

    /// Returns the newest record.
    pub fn newest_first<'a, F: Flash>(&self, store: &'a Store<F>) -> Option<Entry<'a, T>> {
        Some(fixed_entry(store, store.find_newest_first(self.id, 0)?))
    }

    /// Returns the next older record.
    pub fn newest_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, T>,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_entry(store, store.find_newest_next(after.raw, 0)?))
    }

    /// Returns the oldest record.
    pub fn oldest_first<'a, F: Flash>(&self, store: &'a Store<F>) -> Option<Entry<'a, T>> {
        Some(fixed_entry(store, store.find_oldest_first(self.id, 0)?))
    }

    /// Returns the next newer record.
    pub fn oldest_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, T>,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_entry(store, store.find_oldest_next(after.raw, 0)?))
    }

    /// Adds a new record.
    pub fn add<'a, F: Flash>(
        &self,
        store: &'a mut Store<F>,
        record: &T,
    ) -> StoreResult<Entry<'a, T>> {
        let span = store.add_fixed(self.id, record.as_bytes())?;
        Ok(fixed_entry(store, span))
    }
}

/// Storage of variable-length records.
pub struct VariableStorage {
    id: Id,
}

impl VariableStorage {
    pub const fn new(id: Id) -> Self {
        VariableStorage { id }
    }

    /// Returns the first record, in no particular order.
    pub fn unordered_first<'a, F: Flash>(&self, store: &'a Store<F>) -> Option<Entry<'a, [u8]>> {
        Some(var_entry(store, store.find_unordered_first(self.id, 0)?))
    }

    /// Returns the next record, in no particular order.
    pub fn unordered_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, [u8]>,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_entry(store, store.find_unordered_next(after.raw, 0)?))
    }

    /// Returns the newest record.
    pub fn newest_first<'a, F: Flash>(&self, store: &'a Store<F>) -> Option<Entry<'a, [u8]>> {
        Some(var_entry(store, store.find_newest_first(self.id, 0)?))
    }

    /// Returns the next older record.
    pub fn newest_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, [u8]>,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_entry(store, store.find_newest_next(after.raw, 0)?))
    }

    /// Returns the oldest record.
    pub fn oldest_first<'a, F: Flash>(&self, store: &'a Store<F>) -> Option<Entry<'a, [u8]>> {
        Some(var_entry(store, store.find_oldest_first(self.id, 0)?))
    }

    /// Returns the next newer record.
    pub fn oldest_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, [u8]>,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_entry(store, store.find_oldest_next(after.raw, 0)?))
    }

    /// Adds a new record.
    pub fn add<'a, F: Flash>(
        &self,
        store: &'a mut Store<F>,
        record: &[u8],
    ) -> StoreResult<Entry<'a, [u8]>> {
        let span = store.add_var(self.id, record)?;
        Ok(var_entry(store, span))
    }
}

/// Storage of fixed-size records identified by 32-bit keys.
pub struct FixedKeyStorage<T> {
    id: Id,
    _marker: PhantomData<T>,
}

impl<T: AsBytes + FromBytes + Unaligned> FixedKeyStorage<T> {
    pub const fn new(id: Id) -> Self {
        FixedKeyStorage {
            id,
            _marker: PhantomData,
        }
    }

    /// Returns the first record with the key, in no particular order.
    pub fn unordered_first<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        key: u32,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_key_entry(
            store,
            store.find_unordered_first(self.id, key)?,
        ))
    }

    /// Returns the next record with the same key, in no particular order.
    pub fn unordered_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, T>,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_key_entry(
            store,
            store.find_unordered_next(after.raw, after.key)?,
        ))
    }

    /// Returns the newest record with the key.
    pub fn newest_first<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        key: u32,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_key_entry(
            store,
            store.find_newest_first(self.id, key)?,
        ))
    }

    /// Returns the next older record with the same key.
    pub fn newest_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, T>,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_key_entry(
            store,
            store.find_newest_next(after.raw, after.key)?,
        ))
    }

    /// Returns the oldest record with the key.
    pub fn oldest_first<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        key: u32,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_key_entry(
            store,
            store.find_oldest_first(self.id, key)?,
        ))
    }

    /// Returns the next newer record with the same key.
    pub fn oldest_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, T>,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_key_entry(
            store,
            store.find_oldest_next(after.raw, after.key)?,
        ))
    }

    /// Returns the first record of any key, with its key.
    pub fn enumerate_unordered_first<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_key_entry(store, store.find_unordered_first(self.id, 0)?))
    }

    /// Returns the next record of any key, with its key.
    pub fn enumerate_unordered_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, T>,
    ) -> Option<Entry<'a, T>> {
        Some(fixed_key_entry(store, store.find_unordered_next(after.raw, 0)?))
    }

    /// Adds a new record under the key.
    pub fn add<'a, F: Flash>(
        &self,
        store: &'a mut Store<F>,
        key: u32,
        record: &T,
    ) -> StoreResult<Entry<'a, T>> {
        let span = store.add_fixed_keyed(self.id, key, record.as_bytes())?;
        Ok(fixed_key_entry(store, with_key(span)))
    }

    /// Replaces all records with the key by a new one.
    pub fn replace<'a, F: Flash>(
        &self,
        store: &'a mut Store<F>,
        key: u32,
        record: &T,
    ) -> StoreResult<Entry<'a, T>> {
        let span = store.replace_fixed(self.id, key, record.as_bytes())?;
        Ok(fixed_key_entry(store, with_key(span)))
    }
}

/// Storage of variable-length records identified by 32-bit keys.
pub struct VariableKeyStorage {
    id: Id,
}

impl VariableKeyStorage {
    pub const fn new(id: Id) -> Self {
        VariableKeyStorage { id }
    }

    /// Returns the first record with the key, in no particular order.
    pub fn unordered_first<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        key: u32,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_key_entry(
            store,
            store.find_unordered_first(self.id, key)?,
        ))
    }

    /// Returns the next record with the same key, in no particular order.
    pub fn unordered_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, [u8]>,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_key_entry(
            store,
            store.find_unordered_next(after.raw, after.key)?,
        ))
    }

    /// Returns the newest record with the key.
    pub fn newest_first<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        key: u32,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_key_entry(store, store.find_newest_first(self.id, key)?))
    }

    /// Returns the next older record with the same key.
    pub fn newest_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, [u8]>,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_key_entry(
            store,
            store.find_newest_next(after.raw, after.key)?,
        ))
    }

    /// Returns the oldest record with the key.
    pub fn oldest_first<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        key: u32,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_key_entry(store, store.find_oldest_first(self.id, key)?))
    }

    /// Returns the next newer record with the same key.
    pub fn oldest_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, [u8]>,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_key_entry(
            store,
            store.find_oldest_next(after.raw, after.key)?,
        ))
    }

    /// Returns the first record of any key, with its key.
    pub fn enumerate_unordered_first<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_key_entry(store, store.find_unordered_first(self.id, 0)?))
    }

    /// Returns the next record of any key, with its key.
    pub fn enumerate_unordered_next<'a, F: Flash>(
        &self,
        store: &'a Store<F>,
        after: Entry<'a, [u8]>,
    ) -> Option<Entry<'a, [u8]>> {
        Some(var_key_entry(store, store.find_unordered_next(after.raw, 0)?))
    }

    /// Adds a new record under the key.
    pub fn add<'a, F: Flash>(
        &self,
        store: &'a mut Store<F>,
        key: u32,
        value: &[u8],
    ) -> StoreResult<Entry<'a, [u8]>> {
        let span = store.add_var_keyed(self.id, key, value)?;
        Ok(var_key_entry(store, with_key(span)))
    }

    /// Replaces all records with the key by a new one.
    pub fn replace<'a, F: Flash>(
        &self,
        store: &'a mut Store<F>,
        key: u32,
        value: &[u8],
    ) -> StoreResult<Entry<'a, [u8]>> {
        let span = store.replace_var(self.id, key, value)?;
        Ok(var_key_entry(store, with_key(span)))
    }
}

/// Get/set storage of fixed-size records under unique 32-bit keys.
pub struct FixedUniqueKeyStorage<T> {
    inner: FixedKeyStorage<T>,
}

impl<T: AsBytes + FromBytes + Unaligned> FixedUniqueKeyStorage<T> {
    pub const fn new(id: Id) -> Self {
        FixedUniqueKeyStorage {
            inner: FixedKeyStorage::new(id),
        }
    }

    /// Returns the record with the key, if any.
    pub fn get<'a, F: Flash>(&self, store: &'a Store<F>, key: u32) -> Option<Entry<'a, T>> {
        self.inner.unordered_first(store, key)
    }

    /// Stores the record with the key, replacing any previous value.
    pub fn set<'a, F: Flash>(
        &self,
        store: &'a mut Store<F>,
        key: u32,
        record: &T,
    ) -> StoreResult<Entry<'a, T>> {
        self.inner.replace(store, key, record)
    }
}

/// Get/set storage of variable-length records under unique 32-bit keys.
pub struct VariableUniqueKeyStorage {
    inner: VariableKeyStorage,
}

impl VariableUniqueKeyStorage {
    pub const fn new(id: Id) -> Self {
        VariableUniqueKeyStorage {
            inner: VariableKeyStorage::new(id),
        }
    }

    /// Returns the record with the key, if any.
    pub fn get<'a, F: Flash>(&self, store: &'a Store<F>, key: u32) -> Option<Entry<'a, [u8]>> {
        self.inner.unordered_first(store, key)
    }

    /// Stores the record with the key, replacing any previous value.
    pub fn set<'a, F: Flash>(
        &self,
        store: &'a mut Store<F>,
        key: u32,
        value: &[u8],
    ) -> StoreResult<Entry<'a, [u8]>> {
        self.inner.replace(store, key, value)
    }
}
