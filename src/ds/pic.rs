// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-frame telemetry carried in Digital Sprite images.
//!
//! Servers send each picture as a complete JFIF image with an extra APP0
//! segment identified by `DSFD`. Its payload, after the identifier, is:
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 4      | 2    | camera (one-based) |
//! | 6      | 1    | interlace        |
//! | 7      | 1    | Q factor         |
//! | 8      | 2    | width            |
//! | 10     | 2    | height           |
//! | 12     | 4    | time (Unix seconds) |
//! | 16     | 2    | milliseconds     |
//! | 18     | 4    | activity mask    |
//! | 22     | 4    | frame counter    |
//! | 26     | 32   | alarm text       |

use bytes::{Buf, BufMut, Bytes};
use log::trace;

use super::msg::ConnectReply;
use crate::codec::jfif::{Jfif, Segments, APP0};
use crate::codec::pic::{get_latin1, put_latin1};
use crate::codec::{CodecId, FrameMetadata, VideoMetadata};
use crate::demux::{invalid_header, Frame};
use crate::{Error, FrameContext};

const DSFD_ID: &[u8; 4] = b"DSFD";
const ALARM_TEXT_SIZE: usize = 32;

/// Length of a telemetry segment payload, including the identifier.
pub const DSFD_SIZE: usize = 4 + 22 + ALARM_TEXT_SIZE;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DsFrameData {
    pub camera: u16,

    /// 0 for a full frame; otherwise the field number.
    pub interlace: u8,
    pub q: u8,
    pub width: u16,
    pub height: u16,
    pub time: u32,
    pub msecs: u16,

    /// Bit `n` is set while detector `n` sees activity.
    pub activity_mask: u32,
    pub frame_counter: u32,
    pub alarm_text: String,
}

impl DsFrameData {
    /// Decodes a telemetry segment payload, identifier included.
    pub fn decode(mut b: &[u8]) -> Result<Self, String> {
        if b.len() < DSFD_SIZE {
            return Err(format!(
                "telemetry segment is {} bytes; expected at least {DSFD_SIZE}",
                b.len()
            ));
        }
        if !b.starts_with(DSFD_ID) {
            return Err("telemetry segment lacks DSFD identifier".to_owned());
        }
        b.advance(DSFD_ID.len());
        Ok(DsFrameData {
            camera: b.get_u16(),
            interlace: b.get_u8(),
            q: b.get_u8(),
            width: b.get_u16(),
            height: b.get_u16(),
            time: b.get_u32(),
            msecs: b.get_u16(),
            activity_mask: b.get_u32(),
            frame_counter: b.get_u32(),
            alarm_text: get_latin1(&mut b, ALARM_TEXT_SIZE),
        })
    }

    /// Encodes the segment payload, identifier included.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_slice(DSFD_ID);
        out.put_u16(self.camera);
        out.put_u8(self.interlace);
        out.put_u8(self.q);
        out.put_u16(self.width);
        out.put_u16(self.height);
        out.put_u32(self.time);
        out.put_u16(self.msecs);
        out.put_u32(self.activity_mask);
        out.put_u32(self.frame_counter);
        put_latin1(out, &self.alarm_text, ALARM_TEXT_SIZE);
    }

    /// Finds and decodes the telemetry segment of a JFIF image, if any.
    pub fn find(image: &[u8]) -> Result<Option<Self>, String> {
        for seg in Segments::new(image)? {
            let seg = seg?;
            if seg.marker == APP0 && seg.payload.starts_with(DSFD_ID) {
                return Self::decode(seg.payload).map(Some);
            }
        }
        Ok(None)
    }
}

/// Converts a Digital Sprite image into a frame.
///
/// Header fields come from the JFIF markers and comment, then the telemetry
/// segment overrides camera, time, Q and alarm state. The title comes from the
/// image comment, else from the connect reply, else is `Camera N`.
pub(crate) fn image_frame(
    jfif: &Jfif,
    ctx: &FrameContext,
    image: &Bytes,
    reply: Option<&ConnectReply>,
    default_cam: i32,
    utc_offset: i32,
) -> Result<Frame, Error> {
    let head = &image[..image.len().min(64)];
    let telemetry =
        DsFrameData::find(image).map_err(|description| invalid_header(*ctx, description, head))?;
    let mut data = image.to_vec();
    let parsed = jfif
        .parse(&mut data)
        .map_err(|description| invalid_header(*ctx, description, head))?;
    let mut header = parsed.header;
    if let Some(t) = &telemetry {
        trace!("[{ctx}] telemetry {t:?}");
        header.cam = i32::from(t.camera);
        if t.q != 0 {
            header.factor = i32::from(t.q);
        }
        header.session_time = t.time;
        header.milliseconds = u32::from(t.msecs);
        header.alm_bitmask = t.activity_mask;
        if !t.alarm_text.is_empty() {
            header.alarm.clone_from(&t.alarm_text);
        }
    }
    if header.cam == 0 {
        header.cam = default_cam;
    }
    if header.title.is_empty() {
        header.title = reply
            .and_then(|r| r.camera_title(header.cam))
            .map_or_else(|| format!("Camera {}", header.cam), str::to_owned);
    }
    if header.utc_offset == 0 {
        header.utc_offset = utc_offset;
    }
    Ok(Frame {
        codec: CodecId::Mjpeg,
        metadata: FrameMetadata::Video(VideoMetadata {
            header,
            additional_text: parsed.additional_text,
            telemetry,
        }),
        is_keyframe: true,
        data: Bytes::from(data),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::jfif::EOI;
    use crate::testutil::jpeg_header;

    pub(crate) fn telemetry(camera: u16) -> DsFrameData {
        DsFrameData {
            camera,
            interlace: 0,
            q: 40,
            width: 704,
            height: 576,
            time: 1_584_268_200,
            msecs: 120,
            activity_mask: 0x11,
            frame_counter: 9_001,
            alarm_text: "motion".to_owned(),
        }
    }

    /// Builds a JFIF image, optionally carrying a telemetry segment after the
    /// JFIF APP0.
    pub(crate) fn image(t: Option<&DsFrameData>) -> Bytes {
        let jfif = Jfif::new();
        let mut out = jfif.build(&jpeg_header(1, 704, 576, 40), 1024).unwrap();
        if let Some(t) = t {
            let mut seg = vec![0xff, APP0];
            seg.put_u16(u16::try_from(2 + DSFD_SIZE).unwrap());
            t.encode(&mut seg);
            out.splice(20..20, seg);
        }
        out.extend_from_slice(&[0x12, 0x34, 0x56]);
        out.extend_from_slice(&EOI);
        out.into()
    }

    pub(crate) fn reply() -> ConnectReply {
        let mut camera_titles = vec![String::new(); 16];
        camera_titles[1] = "Car park".to_owned();
        ConnectReply {
            num_cameras: 2,
            viewable_cam_mask: 3,
            telemetry_cam_mask: 3,
            failed_cam_mask: 0,
            max_msg_interval: 10,
            timestamp: 0x5e6e_1a28,
            camera_titles,
            unit_type: 0,
            app_version: 0,
            video_standard: 0,
            mac: [0x00, 0x0e, 0xa5, 0x01, 0x02, 0x03],
            min_viewing_time: 0,
        }
    }

    #[test]
    fn decode() {
        let mut raw = Vec::new();
        telemetry(3).encode(&mut raw);
        assert_eq!(raw.len(), DSFD_SIZE);
        assert_eq!(&raw[4..6], &[0, 3]);
        assert_eq!(DsFrameData::decode(&raw).unwrap(), telemetry(3));
        assert!(DsFrameData::decode(&raw[..DSFD_SIZE - 1]).is_err());
        raw[0] = b'X';
        assert!(DsFrameData::decode(&raw).is_err());
    }

    #[test]
    fn find() {
        let t = telemetry(2);
        assert_eq!(DsFrameData::find(&image(Some(&t))).unwrap(), Some(t));
        assert_eq!(DsFrameData::find(&image(None)).unwrap(), None);
        assert!(DsFrameData::find(b"not a jpeg").is_err());
    }

    #[test]
    fn merge() {
        let reply = reply();
        let jfif = Jfif::new();
        let ctx = FrameContext::dummy();
        let img = image(Some(&telemetry(2)));
        let f = image_frame(&jfif, &ctx, &img, Some(&reply), 1, 60).unwrap();
        let FrameMetadata::Video(v) = &f.metadata else {
            panic!("expected video metadata");
        };
        assert_eq!(v.header.cam, 2);
        assert_eq!(v.header.title, "Car park");
        assert_eq!(v.header.utc_offset, 60);
        assert_eq!(v.header.factor, 40);
        assert_eq!(v.header.session_time, 1_584_268_200);
        assert_eq!(v.header.milliseconds, 120);
        assert_eq!(v.header.alm_bitmask, 0x11);
        assert_eq!(v.header.alarm, "motion");
        assert_eq!(v.header.format.target_pixels, 704);
        assert_eq!(v.telemetry.as_ref().unwrap().frame_counter, 9_001);
        assert!(f.data.ends_with(&EOI));
    }

    #[test]
    fn merge_without_telemetry() {
        let jfif = Jfif::new();
        let ctx = FrameContext::dummy();
        let f = image_frame(&jfif, &ctx, &image(None), None, 4, 0).unwrap();
        let FrameMetadata::Video(v) = &f.metadata else {
            panic!("expected video metadata");
        };
        assert!(v.telemetry.is_none());
        assert_eq!(v.header.cam, 4);
        assert_eq!(v.header.title, "Camera 4");
        assert_eq!(v.header.factor, 40);
    }

    #[test]
    fn corrupt_image() {
        let jfif = Jfif::new();
        let ctx = FrameContext::dummy();
        let e = image_frame(&jfif, &ctx, &Bytes::from_static(b"\xff\xd8\xff"), None, 1, 0)
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidHeader);
    }
}
