// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keyframe detection for MPEG-4 part 2 and H.264 payloads which arrive
//! without a picture header saying what they are.

use h264_reader::nal::{NalHeader, UnitType};

const VOP_START_CODE: u8 = 0xb6;

/// Yields the byte following each `00 00 01` start code, with the rest of the
/// buffer.
fn start_codes(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> + '_ {
    let mut i = 0;
    std::iter::from_fn(move || {
        while i + 3 < data.len() {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                let code = data[i + 3];
                let rest = &data[i + 4..];
                i += 3;
                return Some((code, rest));
            }
            i += 1;
        }
        None
    })
}

/// Returns true if the first VOP in `data` is intra-coded.
///
/// `vop_coding_type` is the top two bits after the VOP start code; zero is an
/// I-VOP. Leading VOS/VOL/GOV headers are skipped.
pub(crate) fn mpeg4_is_intra(data: &[u8]) -> bool {
    start_codes(data)
        .find(|(code, _)| *code == VOP_START_CODE)
        .and_then(|(_, rest)| rest.first())
        .map_or(false, |b| b >> 6 == 0)
}

/// Returns true if `data` (Annex B) contains an IDR slice.
pub(crate) fn h264_is_idr(data: &[u8]) -> bool {
    start_codes(data).any(|(b, _)| {
        NalHeader::new(b).map_or(false, |h| {
            matches!(h.nal_unit_type(), UnitType::SliceLayerWithoutPartitioningIdr)
        })
    })
}
