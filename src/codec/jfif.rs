// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [JPEG](https://www.itu.int/rec/T-REC-T.81-199209-I/en) interchange headers.
//!
//! NetVu servers send JPEG pictures in two shapes:
//!
//! *   bare scan data behind a [`PictureHeader`], for which [`Jfif::build`]
//!     synthesizes the SOI through SOS segments;
//! *   complete JFIF images, from which [`Jfif::parse`] recovers a
//!     [`PictureHeader`] (dimensions, sampling, Q factor, comment metadata).

use log::{debug, trace};

use super::comment::{self, Vocabulary};
use super::pic::{PicFormat, PictureHeader, VideoFormat, PIC_VERSION};
use super::AdditionalText;

#[rustfmt::skip]
const ZIGZAG : [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10,
    17, 24, 32, 25, 18, 11, 4, 5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13, 6, 7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63
];

/// Table K.1 from JPEG spec.
#[rustfmt::skip]
const JPEG_LUMA_QUANTIZER: [i32; 8 * 8] = [
    16, 11, 10, 16, 24, 40, 51, 61,
    12, 12, 14, 19, 26, 58, 60, 55,
    14, 13, 16, 24, 40, 57, 69, 56,
    14, 17, 22, 29, 51, 87, 80, 62,
    18, 22, 37, 56, 68, 109, 103, 77,
    24, 35, 55, 64, 81, 104, 113, 92,
    49, 64, 78, 87, 103, 121, 120, 101,
    72, 92, 95, 98, 112, 100, 103, 99,
];

/// Table K.2 from JPEG spec.
#[rustfmt::skip]
const JPEG_CHROMA_QUANTIZER: [i32; 8 * 8] = [
    17, 18, 24, 47, 99, 99, 99, 99,
    18, 21, 26, 66, 99, 99, 99, 99,
    24, 26, 56, 99, 99, 99, 99, 99,
    47, 66, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
];

// Table K.3 through K.6 from JPEG spec.

const LUM_DC_CODELENS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const LUM_DC_SYMBOLS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
const LUM_AC_CODELENS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];

#[rustfmt::skip]
const LUM_AC_SYMBOLS: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12,
    0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07,
    0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08,
    0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52, 0xd1, 0xf0,
    0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16,
    0x17, 0x18, 0x19, 0x1a, 0x25, 0x26, 0x27, 0x28,
    0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39,
    0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49,
    0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59,
    0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79,
    0x7a, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89,
    0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98,
    0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7,
    0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6,
    0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5,
    0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4,
    0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2,
    0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea,
    0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa
];

const CHM_DC_CODELENS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const CHM_DC_SYMBOLS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
const CHM_AC_CODELENS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];

#[rustfmt::skip]
const CHM_AC_SYMBOLS: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21,
    0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71,
    0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91,
    0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33, 0x52, 0xf0,
    0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34,
    0xe1, 0x25, 0xf1, 0x17, 0x18, 0x19, 0x1a, 0x26,
    0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58,
    0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78,
    0x79, 0x7a, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96,
    0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5,
    0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4,
    0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3,
    0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2,
    0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda,
    0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9,
    0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa
];

pub(crate) const APP0: u8 = 0xe0;
const DQT: u8 = 0xdb;
const SOF0: u8 = 0xc0;
const SOF1: u8 = 0xc1;
const SOF2: u8 = 0xc2;
const DHT: u8 = 0xc4;
const SOS: u8 = 0xda;
const COM: u8 = 0xfe;

pub const SOI: [u8; 2] = [0xff, 0xd8];
pub const EOI: [u8; 2] = [0xff, 0xd9];

/// SOI, then a JFIF 1.02 APP0 segment with aspect-ratio-only density 25:50
/// and no thumbnail.
#[rustfmt::skip]
const JFIF_PREAMBLE: [u8; 20] = [
    0xff, 0xd8,
    0xff, APP0, 0x00, 0x10,
    b'J', b'F', b'I', b'F', 0x00,
    0x01, 0x02, // version
    0x00,       // units
    0x00, 0x19, // X density
    0x00, 0x32, // Y density
    0x00, 0x00, // thumbnail
];

/// Low byte of the Y density within [`JFIF_PREAMBLE`].
const Y_DENSITY_LSB: usize = 17;

/// Sampling factor byte of the luma component for 4:2:2 (h=2, v=1).
const SAMPLING_422: u8 = 0x21;

/// Sampling factor byte of the luma component for 4:1:1 (h=2, v=2).
const SAMPLING_411: u8 = 0x22;

/// Number of leading zig-zag coefficients compared by [`Jfif::find_q`].
const Q_MATCH_COEFFS: usize = 32;

type QTables = Box<[[u8; 64]; 256]>;

/// Scales `base` for each Q factor 0..=255, in zig-zag order.
fn make_tables(base: &[i32; 64]) -> QTables {
    let mut tables = Box::new([[0u8; 64]; 256]);
    for (q, table) in tables.iter_mut().enumerate() {
        for (i, v) in table.iter_mut().enumerate() {
            let scaled = (base[ZIGZAG[i]] * q as i32 + 25) / 50;
            *v = scaled.clamp(1, 255) as u8;
        }
    }
    tables
}

/// Appends segments while enforcing a size limit.
struct Builder {
    buf: Vec<u8>,
    max_size: usize,
}

impl Builder {
    fn put(&mut self, what: &str, bytes: &[u8]) -> Result<(), String> {
        if self.buf.len() + bytes.len() > self.max_size {
            return Err(format!(
                "{what} doesn't fit: {} + {} bytes exceeds {}-byte JFIF header limit",
                self.buf.len(),
                bytes.len(),
                self.max_size
            ));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn put_quant(&mut self, table_no: u8, qt: &[u8; 64]) -> Result<(), String> {
        let mut seg = [0u8; 69];
        seg[..5].copy_from_slice(&[0xff, DQT, 0, 67, table_no]);
        seg[5..].copy_from_slice(qt);
        self.put("DQT", &seg)
    }
}

fn make_huffman_table(p: &mut Vec<u8>, codelens: &[u8], symbols: &[u8], class_and_id: u8) {
    p.push(class_and_id);
    p.extend_from_slice(codelens);
    p.extend_from_slice(symbols);
}

/// A single DHT segment holding the four standard tables.
fn make_huffman_segment() -> Vec<u8> {
    let mut p = vec![0xff, DHT, 0, 0];
    make_huffman_table(&mut p, &LUM_DC_CODELENS, &LUM_DC_SYMBOLS, 0x00);
    make_huffman_table(&mut p, &LUM_AC_CODELENS, &LUM_AC_SYMBOLS, 0x10);
    make_huffman_table(&mut p, &CHM_DC_CODELENS, &CHM_DC_SYMBOLS, 0x01);
    make_huffman_table(&mut p, &CHM_AC_CODELENS, &CHM_AC_SYMBOLS, 0x11);
    let len = (p.len() - 2) as u16;
    p[2..4].copy_from_slice(&len.to_be_bytes());
    p
}

#[rustfmt::skip]
const SOS_SEGMENT: [u8; 14] = [
    0xff, SOS, 0x00, 0x0c,
    0x03,       // components
    0x00, 0x00, // comp 0: huffman tables 0/0
    0x01, 0x11, // comp 1: huffman tables 1/1
    0x02, 0x11, // comp 2: huffman tables 1/1
    0x00, 0x3f, // spectral selection
    0x00,       // successive approx.
];

/// A marker segment; `offset` is the index of `payload` in the image.
#[derive(Debug)]
pub(crate) struct Segment<'a> {
    pub(crate) marker: u8,
    pub(crate) offset: usize,
    pub(crate) payload: &'a [u8],
}

/// Walks marker segments from just after SOI through SOS inclusive.
pub(crate) struct Segments<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> Segments<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self, String> {
        if !data.starts_with(&SOI) {
            return Err("image doesn't start with SOI".to_owned());
        }
        Ok(Self {
            data,
            pos: 2,
            done: false,
        })
    }

    /// Returns the offset just past the last segment yielded.
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    /// Returns true once SOS has been yielded.
    pub(crate) fn reached_scan(&self) -> bool {
        self.done
    }

    fn next_segment(&mut self) -> Result<Option<Segment<'a>>, String> {
        loop {
            if self.done {
                return Ok(None);
            }
            let rest = &self.data[self.pos..];
            if rest.len() < 2 {
                return Err(format!("image ends at offset {} before SOS", self.pos));
            }
            if rest[0] != 0xff {
                return Err(format!(
                    "expected marker at offset {}, found {:#04x}",
                    self.pos, rest[0]
                ));
            }
            let marker = rest[1];
            if marker == 0xff {
                self.pos += 1; // fill byte
                continue;
            }
            if marker == 0x01 || (0xd0..=0xd7).contains(&marker) {
                self.pos += 2;
                continue;
            }
            if rest.len() < 4 {
                return Err(format!("marker {marker:#04x} at offset {} truncated", self.pos));
            }
            let len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
            if len < 2 || len + 2 > rest.len() {
                return Err(format!(
                    "marker {marker:#04x} at offset {} has bad length {len}",
                    self.pos
                ));
            }
            let offset = self.pos + 4;
            self.pos += 2 + len;
            self.done = marker == SOS;
            return Ok(Some(Segment {
                marker,
                offset,
                payload: &rest[4..2 + len],
            }));
        }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<Segment<'a>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_segment() {
            Ok(s) => s.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// The result of [`Jfif::parse`].
#[derive(Debug)]
pub struct ParsedJfif {
    pub header: PictureHeader,
    pub additional_text: AdditionalText,

    /// Bytes from SOI through the end of the SOS segment.
    pub header_len: usize,
}

/// Returns the corrected `(x, y)` density if the server wrote an aspect ratio
/// that doesn't match the picture geometry.
///
/// Pictures wider than 360 pixels but no taller than 360 lines are a single
/// field, with pixels twice as tall as wide (X:Y 2:1). Pictures at most 360
/// pixels wide but taller than 360 lines have pixels twice as wide as tall
/// (X:Y 1:2). Anything else has square pixels.
fn fix_density(width: u16, height: u16, x: u16, y: u16) -> Option<(u16, u16)> {
    let (x2, y2) = (u32::from(x) * 2, u32::from(y) * 2);
    let (x32, y32) = (u32::from(x), u32::from(y));
    match (width > 360, height > 360) {
        (true, false) if y32 == x2 => Some((y, x)),
        (false, true) if x32 == y2 => Some((y, x)),
        (true, true) | (false, false) if x32 == y2 || y32 == x2 => {
            let v = x.min(y);
            Some((v, v))
        }
        _ => None,
    }
}

/// JPEG header synthesis and parsing, with quantization tables precomputed for
/// every Q factor.
pub struct Jfif {
    luma: QTables,
    chroma: QTables,
    huffman: Vec<u8>,
}

impl Default for Jfif {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Jfif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jfif").finish_non_exhaustive()
    }
}

impl Jfif {
    pub fn new() -> Self {
        Self {
            luma: make_tables(&JPEG_LUMA_QUANTIZER),
            chroma: make_tables(&JPEG_CHROMA_QUANTIZER),
            huffman: make_huffman_segment(),
        }
    }

    /// Returns the luminance table for `q`, in zig-zag order.
    pub fn luma_table(&self, q: u8) -> &[u8; 64] {
        &self.luma[usize::from(q)]
    }

    /// Returns the chrominance table for `q`, in zig-zag order.
    pub fn chroma_table(&self, q: u8) -> &[u8; 64] {
        &self.chroma[usize::from(q)]
    }

    /// Builds the headers (SOI through SOS) to place before `pic`'s scan data.
    ///
    /// Fails rather than truncating if they'd exceed `max_size` bytes.
    pub fn build(&self, pic: &PictureHeader, max_size: usize) -> Result<Vec<u8>, String> {
        let q = pic.factor.clamp(0, 255) as u8;
        let width = u16::try_from(pic.format.target_pixels)
            .map_err(|_| format!("bad target width {}", pic.format.target_pixels))?;
        let height = u16::try_from(pic.format.target_lines)
            .map_err(|_| format!("bad target height {}", pic.format.target_lines))?;
        let sampling = match pic.video_format() {
            Some(VideoFormat::Jpeg411) => SAMPLING_411,
            _ => SAMPLING_422,
        };

        let mut b = Builder {
            buf: Vec::with_capacity(max_size.min(1024)),
            max_size,
        };
        b.put("JFIF APP0", &JFIF_PREAMBLE)?;
        if width > 360 && height > 480 {
            b.buf[Y_DENSITY_LSB] = 0x19;
        }
        b.put_quant(0, self.luma_table(q))?;
        b.put_quant(1, self.chroma_table(q))?;

        let [h_msb, h_lsb] = height.to_be_bytes();
        let [w_msb, w_lsb] = width.to_be_bytes();
        #[rustfmt::skip]
        let sof = [
            0xff, SOF0, 0x00, 0x11,
            8, // 8-bit precision
            h_msb, h_lsb,
            w_msb, w_lsb,
            3, // number of components
            0, sampling, 0, // comp 0: quant table 0
            1, 0x11, 1,     // comp 1: quant table 1
            2, 0x11, 1,     // comp 2: quant table 1
        ];
        b.put("SOF0", &sof)?;
        b.put("DHT", &self.huffman)?;
        b.put("SOS", &SOS_SEGMENT)?;
        Ok(b.buf)
    }

    /// Returns the Q factor whose luminance table best matches `table` (in
    /// zig-zag order) over its first 32 coefficients.
    ///
    /// Ties go to the lowest factor.
    pub fn find_q(&self, table: &[u8]) -> u8 {
        let n = table.len().min(Q_MATCH_COEFFS);
        let mut best_err = u32::MAX;
        let mut best_q = 1;
        for q in 1..=255u8 {
            let err: u32 = table[..n]
                .iter()
                .zip(self.luma_table(q).iter())
                .map(|(&a, &b)| u32::from(a.abs_diff(b)))
                .sum();
            if err < best_err {
                best_err = err;
                best_q = q;
                if err == 0 {
                    break;
                }
            }
        }
        best_q
    }

    /// Recovers a picture header from a complete JFIF image.
    ///
    /// `header.size` is the scan data length, excluding the trailing EOI.
    /// A known server bug writes the APP0 aspect ratio backwards; it's
    /// corrected in `data`.
    pub fn parse(&self, data: &mut [u8]) -> Result<ParsedJfif, String> {
        let mut header = PictureHeader {
            version: PIC_VERSION,
            ..Default::default()
        };
        let mut additional_text = AdditionalText::default();
        let mut density_at = None;
        let mut frame = None;

        let mut segs = Segments::new(data)?;
        for seg in &mut segs {
            let seg = seg?;
            let p = seg.payload;
            match seg.marker {
                APP0 if p.len() >= 12 && p.starts_with(b"JFIF\0") => {
                    density_at = Some(seg.offset + 8);
                }
                DQT => {
                    let mut rest = p;
                    while let Some((&pq_tq, tail)) = rest.split_first() {
                        let table_len = if pq_tq >> 4 == 0 { 64 } else { 128 };
                        if tail.len() < table_len {
                            return Err("DQT segment truncated".to_owned());
                        }
                        if pq_tq == 0 {
                            header.factor = i32::from(self.find_q(&tail[..64]));
                        }
                        rest = &tail[table_len..];
                    }
                }
                SOF0 | SOF1 | SOF2 => {
                    if p.len() < 8 {
                        return Err(format!("SOF segment too short: {} bytes", p.len()));
                    }
                    let lines = u16::from_be_bytes([p[1], p[2]]);
                    let pixels = u16::from_be_bytes([p[3], p[4]]);
                    frame = Some((pixels, lines, p[7]));
                }
                COM => {
                    comment::parse(Vocabulary::Jfif, p, &mut header, &mut additional_text)
                }
                m => trace!("skipping marker {m:#04x} ({} bytes)", p.len()),
            }
        }
        if !segs.reached_scan() {
            return Err("image has no SOS marker".to_owned());
        }
        let header_len = segs.pos();

        let Some((width, height, sampling)) = frame else {
            return Err("image has no frame header".to_owned());
        };
        let w = i16::try_from(width).map_err(|_| format!("width {width} out of range"))?;
        let h = i16::try_from(height).map_err(|_| format!("height {height} out of range"))?;
        header.format = PicFormat {
            src_pixels: w,
            src_lines: h,
            target_pixels: w,
            target_lines: h,
            pixel_offset: 0,
            line_offset: 0,
        };
        header.vid_format = match sampling {
            SAMPLING_411 => VideoFormat::Jpeg411,
            SAMPLING_422 => VideoFormat::Jpeg422,
            s => {
                debug!("unexpected luma sampling {s:#04x}; assuming 4:2:2");
                VideoFormat::Jpeg422
            }
        } as i32;

        let scan_len = data
            .len()
            .checked_sub(header_len + EOI.len())
            .ok_or_else(|| "image too short for EOI".to_owned())?;
        header.size = i32::try_from(scan_len).map_err(|_| "image too large".to_owned())?;

        if let Some(at) = density_at {
            let x = u16::from_be_bytes([data[at], data[at + 1]]);
            let y = u16::from_be_bytes([data[at + 2], data[at + 3]]);
            if let Some((x, y)) = fix_density(width, height, x, y) {
                trace!("correcting {width}x{height} density to {x}:{y}");
                data[at..at + 2].copy_from_slice(&x.to_be_bytes());
                data[at + 2..at + 4].copy_from_slice(&y.to_be_bytes());
            }
        }

        Ok(ParsedJfif {
            header,
            additional_text,
            header_len,
        })
    }
}
