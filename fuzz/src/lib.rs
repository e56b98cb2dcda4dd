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

//! Fuzzing logic shared by the fuzz target and the replay example.
//!
//! The input bytes drive a sequence of store operations, interleaved with
//! collector steps and an optional power cut, against a small emulated
//! flash. After the sequence the flash is remounted and basic liveness
//! invariants are checked: committed keys resolve to their last written
//! value and enumeration terminates.

use nvram_store::{BufferFlash, BufferOptions, Id, MountOptions, Store, Strategy};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

const TEST: Id = Id::tag(b"TEST");

/// A byte-driven cursor over the fuzz input.
struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn byte(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }
}

fn options(double_write: bool) -> BufferOptions {
    BufferOptions {
        block_size: 512,
        double_write,
        max_word_writes: 64,
        max_block_erases: 10000,
        strict_mode: false,
        erase_delay: 0,
    }
}

/// Runs one fuzz input to completion.
pub fn run(data: &[u8]) {
    let mut input = Input { data, pos: 0 };
    let config = match input.byte() {
        Some(byte) => byte,
        None => return,
    };
    let double_write = config & 1 != 0;
    let mut flash = BufferFlash::erased(4096, options(double_write));
    if config & 2 != 0 {
        // Arm a power cut somewhere in the sequence.
        flash.arm_interruption((config >> 2) as usize, (config & 7) as usize);
    }
    let mut model: HashMap<u32, Vec<u8>> = HashMap::new();
    let mut mount_options = MountOptions::default();
    mount_options.reset = true;
    mount_options.pages_per_block = Some(2);
    let cut = catch_unwind(AssertUnwindSafe(|| {
        let mut store = Store::mount(&mut flash, &mount_options).unwrap();
        store.register_collector(TEST, 0, Strategy::Cleanup);
        store.register_collector(TEST, 1, Strategy::Relocate);
        store.register_collector(TEST, 2, Strategy::DiscardOldest);
        while let Some(op) = input.byte() {
            let key = (op >> 4) as u32 + 1;
            match op & 0xf {
                0..=7 => {
                    let len = (op & 0x7) as usize + 1;
                    let value = vec![op; len];
                    if store.replace_var(TEST, key, &value).is_ok() {
                        model.insert(key, value);
                    }
                }
                8..=11 => {
                    if store.delete(TEST, key) {
                        model.remove(&key);
                    }
                }
                12 | 13 => {
                    store.step();
                }
                _ => {
                    store.run_until_idle();
                }
            }
        }
    }))
    .is_err();
    flash.reset_interruption();
    check(&mut flash, &mount_options, &model, cut);
}

/// Remounts the flash and checks the surviving state.
fn check(
    flash: &mut BufferFlash,
    mount_options: &MountOptions,
    model: &HashMap<u32, Vec<u8>>,
    cut: bool,
) {
    let mut remount = mount_options.clone();
    remount.reset = false;
    let store = Store::mount(&mut *flash, &remount).unwrap();
    if !cut {
        // Without a power cut the newest record of every committed key is
        // exactly the last written value. After a cut a later interrupted
        // replace or delete may have partially retired a key, so only
        // crash-freedom and enumeration are checked.
        for (&key, value) in model {
            let rec = store
                .find_newest_first(TEST, key)
                .unwrap_or_else(|| panic!("lost key {}", key));
            assert_eq!(&store.get(rec)[4..], &value[..]);
        }
    }
    // Enumeration terminates and yields only records with plausible keys.
    let mut rec = store.find_unordered_first(TEST, 0);
    let mut count = 0;
    while let Some(r) = rec {
        count += 1;
        assert!(count < 10_000);
        rec = store.find_unordered_next(r, 0);
    }
}
