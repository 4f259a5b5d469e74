// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The 168-byte picture header which precedes every NetVu video frame.
//!
//! All integers are big-endian. Strings are fixed-size, NUL-padded Latin-1.
//!
//! ```text
//! off  size  field
//!   0     4  version          (MIN_PIC_VERSION..=PIC_VERSION)
//!   4     4  mode
//!   8     4  cam
//!  12     4  vid_format       (see VideoFormat)
//!  16     4  start_offset     (bytes of text between header and payload)
//!  20     4  size             (payload bytes)
//!  24     4  max_size
//!  28     4  target_size
//!  32     4  factor           (JPEG Q factor)
//!  36     4  alm_bitmask_hi
//!  40     4  status
//!  44     4  session_time     (seconds since the Unix epoch, UTC)
//!  48     4  milliseconds
//!  52     4  res
//!  56    31  title
//!  87    31  alarm
//! 118    12  format           (6 x i16, see PicFormat)
//! 130    30  locale
//! 160     4  utc_offset       (minutes)
//! 164     4  alm_bitmask
//! ```

use bytes::{Buf, BufMut};

pub const PIC_HEADER_SIZE: usize = 168;

pub const MIN_PIC_VERSION: u32 = 0xDECA_DE10;
pub const PIC_REVISION: u32 = 1;
pub const PIC_VERSION: u32 = MIN_PIC_VERSION + PIC_REVISION;

pub const TITLE_SIZE: usize = 31;
pub const ALARM_SIZE: usize = 31;
pub const LOCALE_SIZE: usize = 30;

/// Returns true if `version` is one this crate understands.
#[inline]
pub fn is_valid_version(version: u32) -> bool {
    (MIN_PIC_VERSION..=PIC_VERSION).contains(&version)
}

/// Payload encoding named by [`PictureHeader::vid_format`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoFormat {
    /// JPEG scan data with 4:2:2 chroma sampling.
    Jpeg422 = 0,

    /// JPEG scan data with 4:1:1 chroma sampling.
    Jpeg411 = 1,
    Mpeg4P = 2,
    Mpeg4I = 3,
    Mpeg4GovP = 4,
    Mpeg4GovI = 5,
    H264I = 6,
    H264P = 7,
}

impl VideoFormat {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => VideoFormat::Jpeg422,
            1 => VideoFormat::Jpeg411,
            2 => VideoFormat::Mpeg4P,
            3 => VideoFormat::Mpeg4I,
            4 => VideoFormat::Mpeg4GovP,
            5 => VideoFormat::Mpeg4GovI,
            6 => VideoFormat::H264I,
            7 => VideoFormat::H264P,
            _ => return None,
        })
    }

    pub fn is_jpeg(self) -> bool {
        matches!(self, VideoFormat::Jpeg422 | VideoFormat::Jpeg411)
    }

    pub fn is_mpeg4(self) -> bool {
        matches!(
            self,
            VideoFormat::Mpeg4P
                | VideoFormat::Mpeg4I
                | VideoFormat::Mpeg4GovP
                | VideoFormat::Mpeg4GovI
        )
    }

    pub fn is_h264(self) -> bool {
        matches!(self, VideoFormat::H264I | VideoFormat::H264P)
    }

    /// Returns true for formats which are always independently decodable.
    pub fn is_intra(self) -> bool {
        matches!(
            self,
            VideoFormat::Jpeg422
                | VideoFormat::Jpeg411
                | VideoFormat::Mpeg4I
                | VideoFormat::Mpeg4GovI
                | VideoFormat::H264I
        )
    }
}

/// Source and target geometry of a picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PicFormat {
    pub src_pixels: i16,
    pub src_lines: i16,
    pub target_pixels: i16,
    pub target_lines: i16,
    pub pixel_offset: i16,
    pub line_offset: i16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureHeader {
    pub version: u32,
    pub mode: i32,
    pub cam: i32,
    pub vid_format: i32,
    pub start_offset: u32,
    pub size: i32,
    pub max_size: i32,
    pub target_size: i32,
    pub factor: i32,
    pub alm_bitmask_hi: u32,
    pub status: i32,
    pub session_time: u32,
    pub milliseconds: u32,
    pub res: [u8; 4],
    pub title: String,
    pub alarm: String,
    pub format: PicFormat,
    pub locale: String,
    pub utc_offset: i32,
    pub alm_bitmask: u32,
}

impl PictureHeader {
    /// Returns a header for frames which carry only a timestamp on the wire.
    ///
    /// The title is `Camera <cam>`.
    pub fn minimal(cam: i32, session_time: u32, milliseconds: u32, utc_offset: i32) -> Self {
        PictureHeader {
            version: PIC_VERSION,
            cam,
            session_time,
            milliseconds,
            utc_offset,
            title: format!("Camera {cam}"),
            ..Default::default()
        }
    }

    pub fn video_format(&self) -> Option<VideoFormat> {
        VideoFormat::from_raw(self.vid_format)
    }

    /// Decodes the first [`PIC_HEADER_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < PIC_HEADER_SIZE {
            return Err(format!(
                "picture header needs {PIC_HEADER_SIZE} bytes; have {}",
                buf.len()
            ));
        }
        let mut b = &buf[..PIC_HEADER_SIZE];
        let version = b.get_u32();
        if !is_valid_version(version) {
            return Err(format!("bad picture header version {version:#010x}"));
        }
        let h = PictureHeader {
            version,
            mode: b.get_i32(),
            cam: b.get_i32(),
            vid_format: b.get_i32(),
            start_offset: b.get_u32(),
            size: b.get_i32(),
            max_size: b.get_i32(),
            target_size: b.get_i32(),
            factor: b.get_i32(),
            alm_bitmask_hi: b.get_u32(),
            status: b.get_i32(),
            session_time: b.get_u32(),
            milliseconds: b.get_u32(),
            res: {
                let mut res = [0u8; 4];
                b.copy_to_slice(&mut res);
                res
            },
            title: get_latin1(&mut b, TITLE_SIZE),
            alarm: get_latin1(&mut b, ALARM_SIZE),
            format: PicFormat {
                src_pixels: b.get_i16(),
                src_lines: b.get_i16(),
                target_pixels: b.get_i16(),
                target_lines: b.get_i16(),
                pixel_offset: b.get_i16(),
                line_offset: b.get_i16(),
            },
            locale: get_latin1(&mut b, LOCALE_SIZE),
            utc_offset: b.get_i32(),
            alm_bitmask: b.get_u32(),
        };
        debug_assert!(!b.has_remaining());
        Ok(h)
    }

    /// Writes exactly [`PIC_HEADER_SIZE`] bytes.
    ///
    /// Strings are truncated to their field sizes; characters outside Latin-1
    /// are written as `?`.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.version);
        out.put_i32(self.mode);
        out.put_i32(self.cam);
        out.put_i32(self.vid_format);
        out.put_u32(self.start_offset);
        out.put_i32(self.size);
        out.put_i32(self.max_size);
        out.put_i32(self.target_size);
        out.put_i32(self.factor);
        out.put_u32(self.alm_bitmask_hi);
        out.put_i32(self.status);
        out.put_u32(self.session_time);
        out.put_u32(self.milliseconds);
        out.put_slice(&self.res);
        put_latin1(out, &self.title, TITLE_SIZE);
        put_latin1(out, &self.alarm, ALARM_SIZE);
        out.put_i16(self.format.src_pixels);
        out.put_i16(self.format.src_lines);
        out.put_i16(self.format.target_pixels);
        out.put_i16(self.format.target_lines);
        out.put_i16(self.format.pixel_offset);
        out.put_i16(self.format.line_offset);
        put_latin1(out, &self.locale, LOCALE_SIZE);
        out.put_i32(self.utc_offset);
        out.put_u32(self.alm_bitmask);
    }

    pub fn to_bytes(&self) -> [u8; PIC_HEADER_SIZE] {
        let mut out = [0u8; PIC_HEADER_SIZE];
        self.encode(&mut &mut out[..]);
        out
    }
}

/// Decodes a NUL-padded Latin-1 field, stopping at the first NUL.
pub(crate) fn get_latin1(b: &mut &[u8], len: usize) -> String {
    let (field, rest) = b.split_at(len);
    *b = rest;
    latin1(field)
}

/// Decodes Latin-1 bytes up to the first NUL.
pub(crate) fn latin1(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|&&c| c != 0)
        .map(|&c| char::from(c))
        .collect()
}

pub(crate) fn put_latin1<B: BufMut>(out: &mut B, s: &str, len: usize) {
    let mut written = 0;
    for c in s.chars().take(len) {
        out.put_u8(u8::try_from(u32::from(c)).unwrap_or(b'?'));
        written += 1;
    }
    out.put_bytes(0, len - written);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PictureHeader {
        PictureHeader {
            version: PIC_VERSION,
            mode: 0,
            cam: 3,
            vid_format: VideoFormat::Jpeg422 as i32,
            start_offset: 0,
            size: 12_345,
            max_size: 0,
            target_size: 0,
            factor: 40,
            alm_bitmask_hi: 0x8000_0001,
            status: 0,
            session_time: 1_584_268_200,
            milliseconds: 250,
            res: [0; 4],
            title: "Caméra 3".to_owned(),
            alarm: "Door".to_owned(),
            format: PicFormat {
                src_pixels: 704,
                src_lines: 576,
                target_pixels: 704,
                target_lines: 576,
                pixel_offset: 0,
                line_offset: 0,
            },
            locale: "UK".to_owned(),
            utc_offset: -60,
            alm_bitmask: 0x0000_0102,
        }
    }

    #[test]
    fn field_offsets() {
        let raw = sample().to_bytes();
        assert_eq!(&raw[0..4], &[0xde, 0xca, 0xde, 0x11]);
        assert_eq!(&raw[8..12], &[0, 0, 0, 3]);
        assert_eq!(&raw[32..36], &[0, 0, 0, 40]);
        assert_eq!(&raw[44..48], &1_584_268_200u32.to_be_bytes());
        assert_eq!(&raw[56..63], b"Cam\xe9ra ");
        assert_eq!(raw[87], b'D');
        assert_eq!(&raw[118..120], &704i16.to_be_bytes());
        assert_eq!(&raw[124..126], &576i16.to_be_bytes());
        assert_eq!(&raw[130..132], b"UK");
        assert_eq!(&raw[160..164], &(-60i32).to_be_bytes());
        assert_eq!(&raw[164..168], &[0, 0, 1, 2]);
    }

    #[test]
    fn decode_reverses_encode() {
        let h = sample();
        assert_eq!(PictureHeader::decode(&h.to_bytes()).unwrap(), h);
    }

    #[test]
    fn full_width_strings() {
        let mut h = sample();
        h.title = "x".repeat(TITLE_SIZE);
        let decoded = PictureHeader::decode(&h.to_bytes()).unwrap();
        assert_eq!(decoded.title, h.title);
        assert_eq!(decoded.alarm, "Door");
    }

    #[test]
    fn rejects_bad_version() {
        let mut raw = sample().to_bytes();
        raw[3] = 0x12;
        let e = PictureHeader::decode(&raw).unwrap_err();
        assert!(e.contains("0xdecade12"), "{e}");
        raw[3] = 0x10;
        assert_eq!(PictureHeader::decode(&raw).unwrap().version, MIN_PIC_VERSION);
    }

    #[test]
    fn rejects_short() {
        let raw = sample().to_bytes();
        PictureHeader::decode(&raw[..167]).unwrap_err();
    }

    #[test]
    fn minimal_title() {
        let h = PictureHeader::minimal(4, 1, 2, 60);
        assert_eq!(h.title, "Camera 4");
        assert_eq!(h.version, PIC_VERSION);
        assert_eq!(h.utc_offset, 60);
    }
}
