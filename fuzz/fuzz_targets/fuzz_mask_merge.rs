// Copyright (c) 2026 Rumora
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use rumora::core::crypto::mask::Mask;

fuzz_target!(|input: (u16, Vec<u8>)| {
    let (width, bytes) = input;
    let mut mask = Mask::new(width as usize % 4096);
    if mask.merge(&bytes).is_ok() {
        let count = mask.count_enabled();
        if count > 0 {
            let _ = mask.index_of_nth_enabled(count - 1);
        }
    }
});
