// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;
use netvu::demux::{DemuxOptions, Demuxer, Format};
use netvu::io::RetryPolicy;

fuzz_target!(|data: &[u8]| {
    let options = DemuxOptions::default()
        .retry(RetryPolicy::never())
        .max_frame_size(1 << 16);
    let mut demuxer = Demuxer::new(Format::Mime, data, options);
    while let Ok(Some(_)) = demuxer.read_packet() {}
});
