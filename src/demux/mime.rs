// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The "admime" framing: `multipart/x-mixed-replace` server push.
//!
//! Each part carries `Content-type` and usually `Content-length` headers.
//! MPEG-4 and H.264 parts are followed by a `text/plain` part describing the
//! picture. Some servers emit mangled boundaries (leading bytes replaced with
//! `0xCD`), and some send bare JPEG images with no headers at all.

use std::io::Read;

use bytes::Bytes;
use log::{debug, trace, warn};

use super::{
    audio_frame, data_frame, jfif_frame, read_error, Ctx, DataRecord, DataType, Frame,
};
use crate::codec::audio::{mode_for, AudioCodec, AudioHeader};
use crate::codec::comment::{self, Vocabulary};
use crate::codec::jfif::EOI;
use crate::codec::mpeg::{h264_is_idr, mpeg4_is_intra};
use crate::codec::pic::{PictureHeader, VideoFormat};
use crate::codec::{
    AdditionalText, CodecId, FrameMetadata, InfoFormat, OverlayFormat, VideoMetadata,
};
use crate::error::ErrorInt;
use crate::hex::LimitedHex;
use crate::{Error, FrameContext};

/// Longest header or text line accepted.
const MAX_LINE: usize = 1024;

/// Boundary line prefixes, including the mangled variants seen in the field.
const BOUNDARY_PREFIXES: [&[u8]; 7] = [
    b"--0plm(",
    b"\xCD-0plm(",
    b"\xCD\xCD0plm(",
    b"\xCD\xCD\xCDplm(",
    b"\xCD\xCD\xCD\xCDlm(",
    b"\xCD\xCD\xCD\xCD\xCDm(",
    b"/r--0plm(",
];

/// Follows the server id.
const BOUNDARY_SUFFIX: &[u8] = b":Server-Push:Boundary-String)1qaz";

/// The start of a JPEG image: SOI and the first byte of the next marker.
const JPEG_START: [u8; 3] = [0xff, 0xd8, 0xff];

/// Returns true if `line` (without its terminator) is a part boundary.
pub fn is_boundary(line: &[u8]) -> bool {
    let line = trim_ascii_end(line);
    BOUNDARY_PREFIXES.iter().any(|prefix| {
        line.strip_prefix(*prefix).map_or(false, |rest| {
            rest.iter()
                .position(|&b| b == b':')
                .map_or(false, |colon| &rest[colon..] == BOUNDARY_SUFFIX)
        })
    })
}

/// Returns true if `buf` plausibly starts a MIME stream.
pub(super) fn probe(buf: &[u8]) -> bool {
    let start = buf
        .iter()
        .position(|&b| b != b'\r' && b != b'\n')
        .unwrap_or(buf.len());
    let buf = &buf[start..];
    BOUNDARY_PREFIXES.iter().any(|p| buf.starts_with(p))
        || buf
            .get(..8)
            .map_or(false, |b| b.eq_ignore_ascii_case(b"content-"))
        || buf.starts_with(&JPEG_START)
}

fn trim_ascii_end(mut s: &[u8]) -> &[u8] {
    while let [rest @ .., last] = s {
        if !last.is_ascii_whitespace() {
            break;
        }
        s = rest;
    }
    s
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a `Name: value` header line.
fn split_header(line: &[u8]) -> Option<(&str, String)> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = &line[..colon];
    if name.is_empty()
        || !name
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return None;
    }
    let name = std::str::from_utf8(name).ok()?;
    let value = crate::codec::pic::latin1(&line[colon + 1..]);
    Some((name, value.trim().to_owned()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ContentType {
    Jpeg,
    Mpeg4,
    H264,
    Audio {
        codec: AudioCodec,
        rate: Option<u32>,
    },
    Text,
    Xml,
    Layout,
    Pbm,
    Bmp,
    Other(String),
}

impl ContentType {
    fn parse(value: &str) -> Self {
        let lower = value.trim().to_ascii_lowercase();
        let mut params = lower.split(';');
        let main = params.next().unwrap_or_default().trim();
        let rate = params
            .filter_map(|p| p.trim().strip_prefix("rate="))
            .find_map(|r| r.trim().parse().ok());
        match main {
            "image/jpeg" => ContentType::Jpeg,
            "image/admp4" => ContentType::Mpeg4,
            "image/admh264" => ContentType::H264,
            "audio/adpcm" => ContentType::Audio {
                codec: AudioCodec::Adpcm,
                rate,
            },
            "audio/l16" => ContentType::Audio {
                codec: AudioCodec::Pcm,
                rate,
            },
            "text/plain" => ContentType::Text,
            "text/xml" => ContentType::Xml,
            "data/layout" => ContentType::Layout,
            "image/pbm" => ContentType::Pbm,
            "image/bmp" => ContentType::Bmp,
            _ => ContentType::Other(main.to_owned()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PartHeaders {
    content_type: Option<ContentType>,
    content_length: Option<usize>,
}

/// What follows the next boundary.
#[derive(Debug)]
enum Part {
    Headers(PartHeaders),

    /// A JPEG with no headers, beginning with the given bytes.
    RawJpeg(Vec<u8>),
    End,
}

#[derive(Debug, Default)]
pub(crate) struct Demuxer {
    /// A part start read while looking for an MPEG picture's text.
    pending: Option<Part>,

    /// An error reading the part after an MPEG picture, returned on the next
    /// read.
    deferred: Option<Error>,
}

impl Demuxer {
    pub(crate) fn read_frame<R: Read>(
        &mut self,
        cx: &mut Ctx<'_, R>,
    ) -> Result<Option<(FrameContext, Frame)>, Error> {
        loop {
            let ctx = cx.frame_ctx();
            let headers = match self.read_part_start(cx, &ctx)? {
                Part::End => return Ok(None),
                Part::RawJpeg(prefix) => {
                    cx.conn.datatype = Some(DataType::Jfif);
                    return Ok(Some((ctx, read_raw_jpeg(cx, &ctx, prefix)?)));
                }
                Part::Headers(h) => h,
            };
            let Some(content_type) = headers.content_type else {
                warn!(
                    "[{}] skipping MIME part with no Content-type, length {:?}",
                    &ctx, headers.content_length
                );
                if let Some(len) = headers.content_length {
                    let len = cx.check_size(&ctx, to_i64(len), "part")?;
                    cx.skip(&ctx, len)?;
                }
                continue;
            };
            let len = headers.content_length;
            let frame = match content_type {
                ContentType::Jpeg => {
                    cx.conn.datatype = Some(DataType::Jfif);
                    match len {
                        Some(len) => {
                            let len = cx.check_size(&ctx, to_i64(len), "image")?;
                            let data = cx.vec(&ctx, len)?;
                            jfif_frame(cx.jfif, &ctx, data, 1, cx.conn.utc_offset)?
                        }
                        None => read_raw_jpeg(cx, &ctx, Vec::new())?,
                    }
                }
                ContentType::Mpeg4 => {
                    let data = read_body(cx, &ctx, len)?;
                    self.video_with_text(cx, &ctx, CodecId::Mpeg4, data)?
                }
                ContentType::H264 => {
                    let data = read_body(cx, &ctx, len)?;
                    self.video_with_text(cx, &ctx, CodecId::H264, data)?
                }
                ContentType::Audio { codec, rate } => {
                    cx.conn.datatype = Some(match codec {
                        AudioCodec::Adpcm => DataType::AudioAdpcm,
                        AudioCodec::Pcm => DataType::AudioRaw,
                    });
                    let data = read_body(cx, &ctx, len)?.to_vec();
                    let mode = rate.and_then(|r| mode_for(codec, r)).unwrap_or_else(|| {
                        debug!("[{}] unknown audio rate {:?}; assuming 8 kHz", &ctx, rate);
                        mode_for(codec, 8000).unwrap_or(5)
                    });
                    let ms = cx.conn.last_time_ms.unwrap_or(0);
                    let header = AudioHeader::synthetic(
                        mode,
                        0,
                        u32::try_from(ms / 1000).unwrap_or(0),
                        u32::try_from(ms % 1000).unwrap_or(0),
                        u32::try_from(data.len()).unwrap_or(u32::MAX),
                    );
                    audio_frame(header, data)
                }
                ContentType::Text => {
                    cx.conn.datatype = Some(DataType::Info);
                    let text = read_text(cx, &ctx, len)?;
                    data_frame(DataRecord::Info(InfoFormat::Text), Bytes::from(text))
                }
                ContentType::Xml => {
                    cx.conn.datatype = Some(DataType::XmlInfo);
                    let data = read_body(cx, &ctx, len)?;
                    data_frame(DataRecord::Info(InfoFormat::Xml), data)
                }
                ContentType::Layout => {
                    cx.conn.datatype = Some(DataType::Layout);
                    data_frame(DataRecord::Layout, read_body(cx, &ctx, len)?)
                }
                ContentType::Pbm => {
                    cx.conn.datatype = Some(DataType::Pbm);
                    let data = read_body(cx, &ctx, len)?;
                    data_frame(DataRecord::Overlay(OverlayFormat::Pbm), data)
                }
                ContentType::Bmp => {
                    cx.conn.datatype = Some(DataType::Bmp);
                    let data = read_body(cx, &ctx, len)?;
                    data_frame(DataRecord::Overlay(OverlayFormat::Bmp), data)
                }
                ContentType::Other(t) => {
                    warn!("[{}] skipping MIME part of type {:?}", &ctx, t);
                    if let Some(len) = len {
                        let len = cx.check_size(&ctx, to_i64(len), "part")?;
                        cx.skip(&ctx, len)?;
                    }
                    continue;
                }
            };
            return Ok(Some((ctx, frame)));
        }
    }

    /// Reads through the headers of the next part.
    ///
    /// Boundaries and blank lines between parts are skipped. A JPEG SOI where
    /// a header was expected starts a headerless image.
    fn read_part_start<R: Read>(
        &mut self,
        cx: &mut Ctx<'_, R>,
        ctx: &FrameContext,
    ) -> Result<Part, Error> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        if let Some(p) = self.pending.take() {
            return Ok(p);
        }
        let mut h = PartHeaders::default();
        loop {
            let empty = h == PartHeaders::default();
            if empty && cx.peek(ctx, JPEG_START.len())? == JPEG_START {
                return Ok(Part::RawJpeg(Vec::new()));
            }
            let Some(line) = cx.line(ctx, MAX_LINE)? else {
                if empty {
                    return Ok(Part::End);
                }
                bail!(ErrorInt::IncompleteData {
                    ctx: *ctx,
                    description: "input ended within MIME headers".to_owned(),
                });
            };
            let trimmed = trim_ascii_end(&line);
            if trimmed.is_empty() {
                if !empty {
                    return Ok(Part::Headers(h));
                }
                continue;
            }
            if is_boundary(trimmed) {
                if !empty {
                    debug!("[{}] boundary ended incomplete headers {:?}", ctx, &h);
                    h = PartHeaders::default();
                }
                continue;
            }
            if let Some((name, value)) = split_header(trimmed) {
                if name.eq_ignore_ascii_case("content-length") {
                    let len = value.parse().map_err(|_| {
                        wrap!(ErrorInt::FramingError {
                            ctx: *ctx,
                            description: format!("bad Content-length {value:?}"),
                        })
                    })?;
                    h.content_length = Some(len);
                } else if name.eq_ignore_ascii_case("content-type") {
                    h.content_type = Some(ContentType::parse(&value));
                } else {
                    trace!("[{}] ignoring MIME header {}", ctx, name);
                }
                continue;
            }
            if let Some(soi) = find(&line, &JPEG_START) {
                warn!(
                    "[{}] malformed MIME header; scanning for the end of a bare JPEG",
                    ctx
                );
                return Ok(Part::RawJpeg(line[soi..].to_vec()));
            }
            bail!(ErrorInt::FramingError {
                ctx: *ctx,
                description: format!(
                    "malformed MIME header line\n{:?}",
                    LimitedHex::new(&line, 64)
                ),
            });
        }
    }

    /// Builds the frame for an MPEG-4 or H.264 part, taking its picture
    /// metadata from the following `text/plain` part if there is one.
    fn video_with_text<R: Read>(
        &mut self,
        cx: &mut Ctx<'_, R>,
        ctx: &FrameContext,
        codec: CodecId,
        data: Bytes,
    ) -> Result<Frame, Error> {
        let mut header = PictureHeader::minimal(1, 0, 0, cx.conn.utc_offset);
        header.title.clear();
        let mut additional_text = AdditionalText::default();
        match self.read_part_start(cx, ctx) {
            Ok(Part::Headers(PartHeaders {
                content_type: Some(ContentType::Text),
                content_length,
            })) => {
                let text = read_text(cx, ctx, content_length)?;
                comment::parse(Vocabulary::Mime, &text, &mut header, &mut additional_text);
            }
            Ok(next) => {
                trace!("[{}] no text after video part; next is {:?}", ctx, &next);
                self.pending = Some(next);
            }
            Err(e) => {
                debug!("[{}] bad part after video part: {}", ctx, e);
                self.deferred = Some(e);
            }
        }
        if header.title.is_empty() {
            header.title = format!("Camera {}", header.cam);
        }
        let (is_keyframe, vid_format, datatype) = if codec == CodecId::Mpeg4 {
            if mpeg4_is_intra(&data) {
                (true, VideoFormat::Mpeg4I, DataType::Mpeg4I)
            } else {
                (false, VideoFormat::Mpeg4P, DataType::Mpeg4P)
            }
        } else if h264_is_idr(&data) {
            (true, VideoFormat::H264I, DataType::H264I)
        } else {
            (false, VideoFormat::H264P, DataType::H264P)
        };
        cx.conn.datatype = Some(datatype);
        header.vid_format = vid_format as i32;
        header.size = i32::try_from(data.len()).unwrap_or(i32::MAX);
        Ok(Frame {
            codec,
            metadata: FrameMetadata::Video(VideoMetadata {
                header,
                additional_text,
                telemetry: None,
            }),
            is_keyframe,
            data,
        })
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Reads a binary part body, which must declare its length.
fn read_body<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
    len: Option<usize>,
) -> Result<Bytes, Error> {
    let Some(len) = len else {
        bail!(ErrorInt::FramingError {
            ctx: *ctx,
            description: "binary part has no Content-length".to_owned(),
        });
    };
    let len = cx.check_size(ctx, to_i64(len), "part")?;
    cx.bytes(ctx, len)
}

/// Reads the body of a text part.
///
/// A declared length is authoritative: exactly that many bytes are consumed,
/// and a NUL among them ends the text early. Without one, lines are read up to
/// a blank line, a line starting with NUL, a boundary, or the end of input.
fn read_text<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
    len: Option<usize>,
) -> Result<Vec<u8>, Error> {
    if let Some(len) = len {
        let len = cx.check_size(ctx, to_i64(len), "text")?;
        let mut text = cx.vec(ctx, len)?;
        if let Some(nul) = text.iter().position(|&b| b == 0) {
            text.truncate(nul);
        }
        return Ok(text);
    }
    let mut text = Vec::new();
    while let Some(line) = cx.line(ctx, MAX_LINE)? {
        let trimmed = trim_ascii_end(&line);
        if trimmed.is_empty() || is_boundary(trimmed) {
            break;
        }
        if let Some(nul) = line.iter().position(|&b| b == 0) {
            text.extend_from_slice(&line[..nul]);
            break;
        }
        text.extend_from_slice(&line);
    }
    Ok(text)
}

/// Reads a JPEG which arrived without headers, through its EOI marker.
fn read_raw_jpeg<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
    mut data: Vec<u8>,
) -> Result<Frame, Error> {
    let limit = cx.options.max_raw_jpeg_size;
    match find(&data, &EOI) {
        Some(eoi) => data.truncate(eoi + EOI.len()),
        None => {
            let rest = cx
                .reader
                .read_until(&EOI, limit.saturating_sub(data.len()))
                .map_err(|e| read_error(*ctx, e))?;
            data.extend_from_slice(&rest);
        }
    }
    jfif_frame(cx.jfif, ctx, data, 1, cx.conn.utc_offset)
}
