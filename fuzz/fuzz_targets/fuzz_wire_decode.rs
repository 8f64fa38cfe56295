// Copyright (c) 2026 Rumora
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use rumora::core::types::{
    decode_canonical_limited, Response, Rumor, Shutdown, MAX_WIRE_MSG_BYTES,
};

fuzz_target!(|data: &[u8]| {
    // Wire decoding must never panic, whatever the bytes.
    let _ = decode_canonical_limited::<Rumor>(data, MAX_WIRE_MSG_BYTES);
    let _ = decode_canonical_limited::<Shutdown>(data, MAX_WIRE_MSG_BYTES);
    let _ = decode_canonical_limited::<Response>(data, MAX_WIRE_MSG_BYTES);
});
