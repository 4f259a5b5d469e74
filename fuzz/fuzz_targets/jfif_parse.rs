// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;
use netvu::codec::jfif::Jfif;

fuzz_target!(|data: &[u8]| {
    let jfif = Jfif::new();
    let mut data = data.to_vec();
    if let Ok(parsed) = jfif.parse(&mut data) {
        assert!(parsed.header_len <= data.len());
    }
});
