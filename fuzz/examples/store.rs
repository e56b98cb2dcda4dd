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

//! Replays fuzz corpus files without the fuzzing runtime.
//!
//! Usage: `cargo run --example store_replay -- <corpus files>`

fn main() {
    for path in std::env::args().skip(1) {
        println!("replay {}", path);
        let data = std::fs::read(&path).unwrap();
        nvram_store_fuzz::run(&data);
    }
}
