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

//! File-backed emulated flash.
//!
//! [`FileFlash`] behaves like [`BufferFlash`](crate::BufferFlash) but
//! persists the flash image to a host file, so store contents survive
//! process restarts. Program and erase counters are not persisted.

use crate::{BufferFlash, BufferOptions, Flash};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Simulates a NOR flash persisted to a host file.
///
/// # Panics
///
/// Flash operations panic if the backing file cannot be written; the
/// flash contract has no error channel and this emulation targets tests.
pub struct FileFlash {
    /// In-memory image of the flash.
    flash: BufferFlash,

    /// File mirroring the image.
    backing_file: File,
}

impl FileFlash {
    /// Opens or creates a file-backed flash of `size` bytes.
    ///
    /// A fresh file is initialized to all-ones. An existing file must
    /// have exactly `size` bytes.
    pub fn new(path: &Path, size: usize, options: BufferOptions) -> std::io::Result<FileFlash> {
        let mut flash = BufferFlash::erased(size, options);
        let mut backing_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_len = backing_file.metadata()?.len();
        if file_len == 0 {
            backing_file.set_len(size as u64)?;
            backing_file.seek(SeekFrom::Start(0))?;
            backing_file.write_all(flash.read(0, size))?;
        } else if file_len == size as u64 {
            backing_file.seek(SeekFrom::Start(0))?;
            let mut image = vec![0; size];
            backing_file.read_exact(&mut image)?;
            if !flash.write(0, &image) {
                // The image holds the persisted bits verbatim; an AND
                // write onto the erased buffer cannot fail to verify.
                unreachable!();
            }
        } else {
            panic!("invalid file size {}, should be {}", file_len, size);
        }
        Ok(FileFlash {
            flash,
            backing_file,
        })
    }

    fn sync(&mut self, offset: usize, length: usize) -> std::io::Result<()> {
        self.backing_file.seek(SeekFrom::Start(offset as u64))?;
        self.backing_file.write_all(self.flash.read(offset, length))
    }
}

impl Flash for FileFlash {
    fn len(&self) -> usize {
        self.flash.len()
    }

    fn block_size(&self) -> usize {
        self.flash.block_size()
    }

    fn write_alignment(&self) -> usize {
        self.flash.write_alignment()
    }

    fn read(&self, offset: usize, length: usize) -> &[u8] {
        self.flash.read(offset, length)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> bool {
        let ok = self.flash.write(offset, data);
        self.sync(offset, data.len()).unwrap();
        ok
    }

    fn write_word(&mut self, offset: usize, word: u32) -> bool {
        let ok = self.flash.write_word(offset, word);
        self.sync(offset, 4).unwrap();
        ok
    }

    fn write_double(&mut self, offset: usize, lo: u32, hi: u32) -> bool {
        let ok = self.flash.write_double(offset, lo, hi);
        self.sync(offset, 8).unwrap();
        ok
    }

    fn shred_word(&mut self, offset: usize) {
        self.flash.shred_word(offset);
        self.sync(offset, 4).unwrap();
    }

    fn shred_double(&mut self, offset: usize) {
        self.flash.shred_double(offset);
        self.sync(offset, 8).unwrap();
    }

    fn erase(&mut self, offset: usize, length: usize) {
        self.flash.erase(offset, length);
        self.sync(offset, length).unwrap();
    }

    fn erase_block(&mut self, offset: usize) -> bool {
        let done = self.flash.erase_block(offset);
        if done {
            self.sync(offset, self.flash.block_size()).unwrap();
        }
        done
    }
}

impl core::fmt::Display for FileFlash {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        self.flash.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Id, MountOptions, Store};
    use tempfile::TempDir;

    const SIZE: usize = 0x2000;

    fn options() -> BufferOptions {
        BufferOptions {
            block_size: 0x1000,
            double_write: false,
            max_word_writes: 8,
            max_block_erases: 10000,
            strict_mode: true,
            erase_delay: 0,
        }
    }

    #[test]
    fn records_persist_across_reopen() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("nvram.bin");
        let id = Id::tag(b"TEST");
        {
            let flash = FileFlash::new(&path, SIZE, options()).unwrap();
            let mut options = MountOptions::default();
            options.reset = true;
            let mut store = Store::mount(flash, &options).unwrap();
            store.add_fixed(id, &[1, 2, 3, 4]).unwrap();
        }
        {
            let flash = FileFlash::new(&path, SIZE, options()).unwrap();
            let store = Store::mount(flash, &MountOptions::default()).unwrap();
            let rec = store.find_newest_first(id, 0).unwrap();
            assert_eq!(store.get(rec), &[1, 2, 3, 4]);
        }
    }
}
