// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use netvu::codec::pic::{PicFormat, PictureHeader, PIC_VERSION};
use netvu::demux::{binary, DataType, DemuxOptions, Demuxer, Format};

const FRAMES: u32 = 256;

/// Builds a binary-framed stream of JPEG pictures from four cameras.
fn stream() -> Vec<u8> {
    let text = b"Comments: bench\r\n";
    let payload = vec![0x55u8; 16 << 10];
    let mut out = Vec::new();
    for i in 0..FRAMES {
        let header = PictureHeader {
            version: PIC_VERSION,
            cam: i32::try_from(i % 4).unwrap() + 1,
            start_offset: u32::try_from(text.len()).unwrap(),
            size: i32::try_from(payload.len()).unwrap(),
            factor: 50,
            session_time: 1_584_268_200 + i / 25,
            milliseconds: (i % 25) * 40,
            title: format!("Camera {}", i % 4 + 1),
            format: PicFormat {
                src_pixels: 704,
                src_lines: 576,
                target_pixels: 704,
                target_lines: 576,
                pixel_offset: 0,
                line_offset: 0,
            },
            ..Default::default()
        };
        let mut body = header.to_bytes().to_vec();
        body.extend_from_slice(text);
        body.extend_from_slice(&payload);
        out.extend_from_slice(&binary::frame(DataType::Jpeg, 0, &body).unwrap());
    }
    out
}

fn demux_all(data: &[u8]) {
    let d = Demuxer::new(Format::Binary, data, DemuxOptions::default());
    let mut n = 0;
    for p in d {
        p.unwrap();
        n += 1;
    }
    assert_eq!(n, FRAMES);
}

fn criterion_benchmark(c: &mut Criterion) {
    let data = stream();
    let mut g = c.benchmark_group("demux");
    g.throughput(criterion::Throughput::Bytes(u64::try_from(data.len()).unwrap()))
        .bench_function("binary_jpeg", |b| b.iter(|| demux_all(&data)));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
