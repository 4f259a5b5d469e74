// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::codec::pic::{PicFormat, PictureHeader, PIC_VERSION};
use crate::demux::binary::Separator;

/// Installs a log subscriber filtered by `NETVU_LOG` (default `info`).
///
/// Safe to call from every test; only the first call has any effect.
pub(crate) fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("NETVU_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A full JPEG picture header for camera `cam` at `width`x`height`.
pub(crate) fn jpeg_header(cam: i32, width: i16, height: i16, factor: i32) -> PictureHeader {
    PictureHeader {
        version: PIC_VERSION,
        cam,
        vid_format: 0,
        factor,
        session_time: 1_584_268_200,
        milliseconds: 250,
        title: format!("Camera {cam}"),
        locale: "UK".to_owned(),
        format: PicFormat {
            src_pixels: width,
            src_lines: height,
            target_pixels: width,
            target_lines: height,
            pixel_offset: 0,
            line_offset: 0,
        },
        ..Default::default()
    }
}

/// Appends a binary-framed frame of `data_type` holding `body`.
pub(crate) fn push_frame(out: &mut Vec<u8>, data_type: u8, channel: u8, body: &[u8]) {
    let sep = Separator {
        data_type,
        channel,
        size: u32::try_from(body.len()).unwrap(),
    };
    out.extend_from_slice(&sep.to_bytes());
    out.extend_from_slice(body);
}

/// Returns `header` followed by `text` and `payload`, with `start_offset` and
/// `size` filled in.
pub(crate) fn picture(mut header: PictureHeader, text: &[u8], payload: &[u8]) -> Vec<u8> {
    header.start_offset = u32::try_from(text.len()).unwrap();
    header.size = i32::try_from(payload.len()).unwrap();
    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(text);
    out.extend_from_slice(payload);
    out
}
