// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The "adbinary" framing: a 6-byte [`Separator`] before every frame.

use std::io::Read;

use bytes::Bytes;
use log::{debug, trace, warn};

use super::{
    audio_frame, data_frame, invalid_header, jfif_frame, read_audio, read_picture, Ctx,
    DataRecord, DataType, Frame, Payload,
};
use crate::codec::audio::{AudioHeader, AUDIO_HEADER_SIZE};
use crate::codec::mpeg::mpeg4_is_intra;
use crate::codec::pic::{PictureHeader, VideoFormat, PIC_HEADER_SIZE};
use crate::codec::{CodecId, FrameMetadata, InfoFormat, OverlayFormat, VideoMetadata};
use crate::{Error, FrameContext};

pub const SEPARATOR_SIZE: usize = 6;

/// `session_time: u32, milliseconds: u16`.
const MINIMAL_VIDEO_HEADER_SIZE: usize = 6;

/// `seconds: u32, msecs: u16, mode: u16`.
const MINIMAL_AUDIO_HEADER_SIZE: usize = 8;

/// The record preceding each frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Separator {
    /// A [`DataType`] code.
    pub data_type: u8,
    pub channel: u8,

    /// Bytes following the separator.
    pub size: u32,
}

impl Separator {
    pub fn parse(raw: [u8; SEPARATOR_SIZE]) -> Self {
        Separator {
            data_type: raw[0],
            channel: raw[1],
            size: u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; SEPARATOR_SIZE] {
        let s = self.size.to_be_bytes();
        [self.data_type, self.channel, s[0], s[1], s[2], s[3]]
    }
}

/// Returns true if `buf` plausibly starts with a separator.
pub(super) fn probe(buf: &[u8]) -> bool {
    let Some(raw) = buf.get(..SEPARATOR_SIZE) else {
        return false;
    };
    let mut sep = [0; SEPARATOR_SIZE];
    sep.copy_from_slice(raw);
    let sep = Separator::parse(sep);
    let Some(data_type) = DataType::from_u8(sep.data_type) else {
        return false;
    };
    if sep.size == 0 || sep.size > 8 << 20 {
        return false;
    }
    match data_type {
        DataType::Jpeg
        | DataType::Mpeg4I
        | DataType::Mpeg4P
        | DataType::H264I
        | DataType::H264P => buf.get(SEPARATOR_SIZE..SEPARATOR_SIZE + 4).map_or(true, |v| {
            crate::codec::pic::is_valid_version(u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
        }),
        _ => true,
    }
}

#[derive(Debug, Default)]
pub(crate) struct Demuxer;

impl Demuxer {
    pub(crate) fn read_frame<R: Read>(
        &mut self,
        cx: &mut Ctx<'_, R>,
    ) -> Result<Option<(FrameContext, Frame)>, Error> {
        loop {
            let ctx = cx.frame_ctx();
            if cx.at_eof(&ctx)? {
                return Ok(None);
            }
            let raw = cx.array::<SEPARATOR_SIZE>(&ctx)?;
            let sep = Separator::parse(raw);
            if sep.size == 0 {
                // Servers end a stream this way; anywhere else it's garbage.
                if cx.at_eof(&ctx)? {
                    return Ok(None);
                }
                return Err(invalid_header(ctx, "zero-length frame".to_owned(), &raw));
            }
            let Some(data_type) = DataType::from_u8(sep.data_type) else {
                warn!(
                    "[{}] skipping {}-byte frame of unknown type {}",
                    &ctx, sep.size, sep.data_type
                );
                let size = cx.check_size(&ctx, i64::from(sep.size), "frame")?;
                cx.skip(&ctx, size)?;
                continue;
            };
            cx.conn.datatype = Some(data_type);
            let size = cx.check_size(&ctx, i64::from(sep.size), "frame")?;
            trace!("[{}] {:?} channel {} size {}", &ctx, data_type, sep.channel, size);
            let frame = read_typed(cx, &ctx, &sep, data_type, size)?;
            return Ok(Some((ctx, frame)));
        }
    }
}

fn need<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
    size: usize,
    header: usize,
    what: &str,
) -> Result<(), Error> {
    if size < header {
        // Keep aligned with the next separator before failing.
        cx.skip(ctx, size)?;
        return Err(invalid_header(
            *ctx,
            format!("{size}-byte frame too short for {header}-byte {what} header"),
            &[],
        ));
    }
    Ok(())
}

/// Skips whatever the separator declared beyond what the frame used.
fn skip_excess<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
    declared: usize,
    used: u64,
) -> Result<(), Error> {
    let declared64 = crate::to_u64(declared);
    if declared64 > used {
        debug!(
            "[{}] separator declares {} bytes; frame used {}",
            ctx, declared, used
        );
        let excess = usize::try_from(declared64 - used).unwrap_or(usize::MAX);
        cx.skip(ctx, excess)?;
    } else if declared64 < used {
        warn!(
            "[{}] separator declares {} bytes; picture header says {}",
            ctx, declared, used
        );
    }
    Ok(())
}

fn camera(sep: &Separator) -> i32 {
    i32::from(sep.channel) + 1
}

fn read_typed<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
    sep: &Separator,
    data_type: DataType,
    size: usize,
) -> Result<Frame, Error> {
    Ok(match data_type {
        DataType::Jpeg
        | DataType::Mpeg4I
        | DataType::Mpeg4P
        | DataType::H264I
        | DataType::H264P => {
            need(cx, ctx, size, PIC_HEADER_SIZE, "picture")?;
            let raw = cx.array::<PIC_HEADER_SIZE>(ctx)?;
            let header = PictureHeader::decode(&raw)
                .map_err(|description| invalid_header(*ctx, description, &raw))?;
            let used = crate::to_u64(PIC_HEADER_SIZE)
                + u64::from(header.start_offset)
                + u64::try_from(header.size).unwrap_or(0);
            let (payload, intra) = match data_type {
                DataType::Jpeg => (Payload::Jpeg, true),
                DataType::Mpeg4I => (Payload::Mpeg4, true),
                DataType::Mpeg4P => (Payload::Mpeg4, false),
                DataType::H264I => (Payload::H264, true),
                _ => (Payload::H264, false),
            };
            let frame = read_picture(cx, ctx, header, payload, intra)?;
            skip_excess(cx, ctx, size, used)?;
            frame
        }
        DataType::Jfif => {
            let data = cx.vec(ctx, size)?;
            jfif_frame(cx.jfif, ctx, data, camera(sep), cx.conn.utc_offset)?
        }
        DataType::MinimalMpeg4 => {
            need(cx, ctx, size, MINIMAL_VIDEO_HEADER_SIZE, "minimal video")?;
            let raw = cx.array::<MINIMAL_VIDEO_HEADER_SIZE>(ctx)?;
            let session_time = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let milliseconds = u16::from_be_bytes([raw[4], raw[5]]);
            let data = cx.bytes(ctx, size - MINIMAL_VIDEO_HEADER_SIZE)?;
            let intra = mpeg4_is_intra(&data);
            let mut header = PictureHeader::minimal(
                camera(sep),
                session_time,
                u32::from(milliseconds),
                cx.conn.utc_offset,
            );
            let vid_format = if intra {
                VideoFormat::Mpeg4I
            } else {
                VideoFormat::Mpeg4P
            };
            header.vid_format = vid_format as i32;
            header.size = i32::try_from(data.len()).unwrap_or(i32::MAX);
            Frame {
                codec: CodecId::Mpeg4,
                metadata: FrameMetadata::Video(VideoMetadata {
                    header,
                    additional_text: Default::default(),
                    telemetry: None,
                }),
                is_keyframe: intra,
                data,
            }
        }
        DataType::AudioAdpcm | DataType::AudioRaw => {
            need(cx, ctx, size, AUDIO_HEADER_SIZE, "audio")?;
            let raw = cx.array::<AUDIO_HEADER_SIZE>(ctx)?;
            let (frame, body) = read_audio(cx, ctx, &raw, Some(size - AUDIO_HEADER_SIZE))?;
            skip_excess(cx, ctx, size, crate::to_u64(AUDIO_HEADER_SIZE + body))?;
            frame
        }
        DataType::MinimalAudioAdpcm => {
            need(cx, ctx, size, MINIMAL_AUDIO_HEADER_SIZE, "minimal audio")?;
            let raw = cx.array::<MINIMAL_AUDIO_HEADER_SIZE>(ctx)?;
            let seconds = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let msecs = u16::from_be_bytes([raw[4], raw[5]]);
            let mode = u16::from_be_bytes([raw[6], raw[7]]);
            let samples = size - MINIMAL_AUDIO_HEADER_SIZE;
            let data = cx.vec(ctx, samples)?;
            let header = AudioHeader::synthetic(
                u32::from(mode),
                i32::from(sep.channel),
                seconds,
                u32::from(msecs),
                u32::try_from(samples).unwrap_or(u32::MAX),
            );
            audio_frame(header, data)
        }
        DataType::Layout => data_frame(DataRecord::Layout, cx.bytes(ctx, size)?),
        DataType::Info => data_frame(DataRecord::Info(InfoFormat::Text), cx.bytes(ctx, size)?),
        DataType::XmlInfo => data_frame(DataRecord::Info(InfoFormat::Xml), cx.bytes(ctx, size)?),
        DataType::Bmp => data_frame(DataRecord::Overlay(OverlayFormat::Bmp), cx.bytes(ctx, size)?),
        DataType::Pbm => data_frame(DataRecord::Overlay(OverlayFormat::Pbm), cx.bytes(ctx, size)?),
    })
}

/// Encodes `data` as one binary-framed frame, or `None` if it's too large.
pub fn frame(data_type: DataType, channel: u8, data: &[u8]) -> Option<Bytes> {
    let size = u32::try_from(data.len()).ok()?;
    let mut out = Vec::with_capacity(SEPARATOR_SIZE + data.len());
    out.extend_from_slice(
        &Separator {
            data_type: data_type as u8,
            channel,
            size,
        }
        .to_bytes(),
    );
    out.extend_from_slice(data);
    Some(out.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::audio::{mode_for, AudioCodec, AUD_VERSION};
    use crate::codec::pic::PIC_VERSION;
    use crate::demux::{DemuxOptions, Demuxer as Facade, Format};
    use crate::testutil::{init_logging, jpeg_header, picture, push_frame};
    use crate::ErrorKind;

    fn demux(stream: &[u8]) -> Facade<&[u8]> {
        Facade::new(Format::Binary, stream, DemuxOptions::default())
    }

    #[test]
    fn separator() {
        let s = Separator::parse([1, 3, 0, 0, 0x12, 0x34]);
        assert_eq!(
            s,
            Separator {
                data_type: 1,
                channel: 3,
                size: 0x1234
            }
        );
        assert_eq!(s.to_bytes(), [1, 3, 0, 0, 0x12, 0x34]);
    }

    #[test]
    fn zero_size_is_never_a_frame() {
        init_logging();
        // At end of input, it's a clean end.
        let mut d = demux(&[0, 0, 0, 0, 0, 0]);
        assert!(d.read_packet().unwrap().is_none());

        // Followed by more data, it's an error.
        let mut stream = vec![0, 0, 0, 0, 0, 0];
        push_frame(&mut stream, DataType::Info as u8, 0, b"x");
        let mut d = demux(&stream);
        assert_eq!(d.read_packet().unwrap_err().kind(), ErrorKind::InvalidHeader);
    }

    #[test]
    fn truncated_frame() {
        let scan = [0x55u8; 100];
        let mut stream = Vec::new();
        push_frame(&mut stream, 0, 0, &picture(jpeg_header(1, 352, 288, 50), b"", &scan));
        stream.truncate(stream.len() - 10);
        let mut d = demux(&stream);
        assert_eq!(d.read_packet().unwrap_err().kind(), ErrorKind::IncompleteData);
    }

    #[test]
    fn bad_version() {
        let mut h = jpeg_header(1, 352, 288, 50);
        h.version = 0xDECA_DE20;
        let mut stream = Vec::new();
        push_frame(&mut stream, 0, 0, &picture(h, b"", b"abc"));
        let e = demux(&stream).read_packet().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidHeader);
        assert!(e.to_string().contains("0xdecade20"), "{e}");
    }

    #[test]
    fn unknown_type_skipped() {
        init_logging();
        let mut stream = Vec::new();
        push_frame(&mut stream, 99, 0, b"whatever this is");
        push_frame(&mut stream, DataType::Layout as u8, 0, b"layout");
        let mut d = demux(&stream);
        let p = d.read_packet().unwrap().unwrap();
        assert_eq!(p.metadata(), &FrameMetadata::DataLayout);
        assert_eq!(&p.data()[..], b"layout");
        assert_eq!(p.ctx().pos(), 22);
        assert!(d.read_packet().unwrap().is_none());
    }

    #[test]
    fn text_and_excess() {
        let text = b"Comments: front door\r\nAlarm-text: Motion\r\n";
        let mut body = picture(jpeg_header(4, 704, 576, 60), text, &[1, 2, 3]);
        body.extend_from_slice(b"pad");
        let mut stream = Vec::new();
        push_frame(&mut stream, 0, 0, &body);
        push_frame(&mut stream, DataType::Info as u8, 0, b"next");
        let mut d = demux(&stream);
        let p = d.read_packet().unwrap().unwrap();
        let FrameMetadata::Video(v) = p.metadata() else {
            panic!("{:?}", p.metadata());
        };
        assert_eq!(v.header.alarm, "Motion");
        assert_eq!(v.additional_text.as_bytes(), b"Comments: front door\r\n");
        assert!(p.data().ends_with(&[1, 2, 3, 0xff, 0xd9]));
        let p = d.read_packet().unwrap().unwrap();
        assert_eq!(&p.data()[..], b"next");
    }

    /// The picture header's size wins over a separator which declares less.
    #[test]
    fn separator_declares_too_little() {
        init_logging();
        let body = picture(jpeg_header(2, 352, 288, 40), b"", &[1, 2, 3]);
        let mut stream = Separator {
            data_type: DataType::Jpeg as u8,
            channel: 1,
            size: u32::try_from(body.len() - 2).unwrap(),
        }
        .to_bytes()
        .to_vec();
        stream.extend_from_slice(&body);
        push_frame(&mut stream, DataType::Info as u8, 0, b"next");
        let mut d = demux(&stream);
        let p = d.read_packet().unwrap().unwrap();
        assert_eq!(p.picture_header().unwrap().format.target_pixels, 352);
        assert!(p.data().ends_with(&[1, 2, 3, 0xff, 0xd9]));
        let p = d.read_packet().unwrap().unwrap();
        assert_eq!(&p.data()[..], b"next");
    }

    #[test]
    fn mpeg4_full_and_minimal() {
        let vop_p = b"\x00\x00\x01\xb6\x50\x60\x70";
        let vop_i = b"\x00\x00\x01\xb6\x10\x60\x70";
        let mut h = jpeg_header(1, 704, 576, 0);
        h.vid_format = VideoFormat::Mpeg4P as i32;
        let mut stream = Vec::new();
        push_frame(&mut stream, DataType::Mpeg4P as u8, 0, &picture(h, b"", vop_p));

        let mut minimal = Vec::new();
        minimal.extend_from_slice(&1_000_000u32.to_be_bytes());
        minimal.extend_from_slice(&120u16.to_be_bytes());
        minimal.extend_from_slice(vop_i);
        push_frame(&mut stream, DataType::MinimalMpeg4 as u8, 1, &minimal);

        let mut d = Facade::new(
            Format::Binary,
            &stream[..],
            DemuxOptions::default().utc_offset(60),
        );
        let p = d.read_packet().unwrap().unwrap();
        assert!(!p.is_keyframe());
        assert_eq!(&p.data()[..], vop_p);

        let p = d.read_packet().unwrap().unwrap();
        assert!(p.is_keyframe());
        assert_eq!(&p.data()[..], vop_i);
        let h = p.picture_header().unwrap();
        assert_eq!(h.cam, 2);
        assert_eq!(h.title, "Camera 2");
        assert_eq!(h.version, PIC_VERSION);
        assert_eq!(h.vid_format, VideoFormat::Mpeg4I as i32);
        // The full header before it carried no offset.
        assert_eq!(h.utc_offset, 0);
        assert_eq!(p.timestamp().timestamp(), 1_000_000_120);
    }

    #[test]
    fn minimal_mpeg4_takes_connection_offset() {
        let mut minimal = Vec::new();
        minimal.extend_from_slice(&5u32.to_be_bytes());
        minimal.extend_from_slice(&0u16.to_be_bytes());
        minimal.extend_from_slice(b"\x00\x00\x01\xb6\x50");
        let mut stream = Vec::new();
        push_frame(&mut stream, DataType::MinimalMpeg4 as u8, 0, &minimal);
        let mut d = Facade::new(
            Format::Binary,
            &stream[..],
            DemuxOptions::default().utc_offset(-300),
        );
        let p = d.read_packet().unwrap().unwrap();
        assert_eq!(p.picture_header().unwrap().utc_offset, -300);
        assert_eq!(d.session_metadata().unwrap().utc_offset, -300);
    }

    #[test]
    fn audio() {
        let mode = mode_for(AudioCodec::Adpcm, 16000).unwrap();
        let header = AudioHeader {
            version: AUD_VERSION,
            mode,
            channel: 2,
            size_of_additional_data: 3,
            size_of_audio_data: 7,
            seconds: 10,
            msecs: 500,
            additional_data: Bytes::from_static(b"abc"),
        };
        let mut body = Vec::new();
        header.encode(&mut body);
        body.extend_from_slice(&[0x12, 0x34, 0x56, 0x78, 0xab, 0x0f, 0x90]);
        let mut stream = Vec::new();
        push_frame(&mut stream, DataType::AudioAdpcm as u8, 2, &body);

        let mut minimal = Vec::new();
        minimal.extend_from_slice(&11u32.to_be_bytes());
        minimal.extend_from_slice(&0u16.to_be_bytes());
        minimal.extend_from_slice(&u16::try_from(mode).unwrap().to_be_bytes());
        minimal.extend_from_slice(&[0x00, 0x01, 0x02, 0x03, 0x21]);
        push_frame(&mut stream, DataType::MinimalAudioAdpcm as u8, 2, &minimal);

        let mut d = demux(&stream);
        let p = d.read_packet().unwrap().unwrap();
        assert_eq!(&p.data()[..], &[0x34, 0x12, 0x56, 0x78, 0xba, 0xf0, 0x09]);
        let FrameMetadata::Audio(a) = p.metadata() else {
            panic!("{:?}", p.metadata());
        };
        assert_eq!(&a.additional_data[..], b"abc");
        assert_eq!(p.timestamp().clock_rate().get(), 16000);
        assert_eq!(p.timestamp().timestamp(), 168_000);

        let p2 = d.read_packet().unwrap().unwrap();
        assert_eq!(p2.stream_index(), p.stream_index());
        assert_eq!(&p2.data()[..], &[0x01, 0x00, 0x02, 0x03, 0x12]);
        assert_eq!(p2.timestamp().elapsed(), 8000);
    }

    #[test]
    fn audio_header_overruns_frame() {
        let header = AudioHeader::synthetic(5, 0, 0, 0, 100);
        let mut body = Vec::new();
        header.encode(&mut body);
        body.extend_from_slice(&[0; 10]);
        let mut stream = Vec::new();
        push_frame(&mut stream, DataType::AudioAdpcm as u8, 0, &body);
        let e = demux(&stream).read_packet().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidHeader);
    }

    #[test]
    fn short_frame_kept_aligned() {
        let mut stream = Vec::new();
        push_frame(&mut stream, DataType::MinimalAudioAdpcm as u8, 0, &[1, 2, 3]);
        push_frame(&mut stream, DataType::Pbm as u8, 0, b"P4");
        let mut d = demux(&stream);
        assert_eq!(d.read_packet().unwrap_err().kind(), ErrorKind::InvalidHeader);
        let p = d.read_packet().unwrap().unwrap();
        assert_eq!(p.metadata(), &FrameMetadata::Overlay(OverlayFormat::Pbm));
    }

    #[test]
    fn encode_frame() {
        let f = frame(DataType::Bmp, 7, b"BM").unwrap();
        assert_eq!(&f[..], b"\x0d\x07\x00\x00\x00\x02BM");
    }
}
