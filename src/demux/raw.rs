// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Back-to-back picture headers, each followed by its text and payload.

use std::io::Read;

use log::warn;

use super::{invalid_header, read_picture, Ctx, Frame, Payload};
use crate::codec::pic::{is_valid_version, PictureHeader, PIC_HEADER_SIZE};
use crate::error::ErrorInt;
use crate::{Error, FrameContext};

#[derive(Debug, Default)]
pub(crate) struct Demuxer;

impl Demuxer {
    pub(crate) fn read_frame<R: Read>(
        &mut self,
        cx: &mut Ctx<'_, R>,
    ) -> Result<Option<(FrameContext, Frame)>, Error> {
        let start = cx.frame_ctx();
        let mut skipped = 0;
        loop {
            let head = cx.peek(&start, 4)?;
            let len = head.len();
            if len == 4
                && is_valid_version(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
            {
                break;
            }
            if len == 0 && skipped == 0 {
                return Ok(None);
            }
            if len < 4 {
                bail!(ErrorInt::IncompleteData {
                    ctx: start,
                    description: format!(
                        "input ended {len} bytes after {skipped} bytes of garbage"
                    ),
                });
            }
            if skipped == cx.options.max_resync_bytes {
                bail!(ErrorInt::InvalidHeader {
                    ctx: start,
                    description: format!("no picture header within {skipped} bytes"),
                    data: bytes::Bytes::new(),
                });
            }
            cx.skip(&start, 1)?;
            skipped += 1;
        }
        if skipped > 0 {
            warn!(
                "[{}] skipped {} bytes to resynchronize on a picture header",
                &start, skipped
            );
        }
        let ctx = cx.frame_ctx();
        read_raw_picture(cx, &ctx).map(|f| Some((ctx, f)))
    }
}

/// Reads a picture header, its text and payload, choosing the payload type
/// from the header.
pub(crate) fn read_raw_picture<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
) -> Result<Frame, Error> {
    let raw = cx.array::<PIC_HEADER_SIZE>(ctx)?;
    let header = PictureHeader::decode(&raw)
        .map_err(|description| invalid_header(*ctx, description, &raw))?;
    let Some(format) = header.video_format() else {
        return Err(invalid_header(
            *ctx,
            format!("unknown video format {}", header.vid_format),
            &raw,
        ));
    };
    read_picture(cx, ctx, header, Payload::for_format(format), false)
}
