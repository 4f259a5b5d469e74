// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire formats shared by every NetVu framing, and the [`Packet`] they all
//! produce.
//!
//! *   [`pic`]: the 168-byte picture header.
//! *   [`audio`]: the audio header and ADPCM byte-order conversion.
//! *   [`jfif`]: JFIF header synthesis for bare JPEG scan data, and recovery of
//!     a picture header from a server-generated JFIF image.
//! *   [`comment`]: `Label: value` text metadata.

use bytes::{Buf, Bytes};

use crate::{FrameContext, Timestamp};

pub mod audio;
pub mod comment;
pub mod jfif;
pub(crate) mod mpeg;
pub mod pic;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Data,
}

/// The encoding of a [`Packet`]'s payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecId {
    /// Complete JFIF images.
    Mjpeg,

    /// MPEG-4 part 2 elementary stream.
    Mpeg4,

    /// H.264 Annex B elementary stream.
    H264,

    /// IMA ADPCM, converted to host nibble order.
    Adpcm,

    /// 16-bit big-endian linear PCM.
    PcmS16Be,

    /// Plain text information records.
    Text,

    /// XML information records.
    Xml,

    /// Camera layout records.
    Layout,

    /// BMP overlay images.
    Bmp,

    /// PBM overlay images.
    Pbm,
}

impl CodecId {
    pub fn media_kind(self) -> MediaKind {
        match self {
            CodecId::Mjpeg | CodecId::Mpeg4 | CodecId::H264 => MediaKind::Video,
            CodecId::Adpcm | CodecId::PcmS16Be => MediaKind::Audio,
            CodecId::Text | CodecId::Xml | CodecId::Layout | CodecId::Bmp | CodecId::Pbm => {
                MediaKind::Data
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::Mjpeg => "mjpeg",
            CodecId::Mpeg4 => "mpeg4",
            CodecId::H264 => "h264",
            CodecId::Adpcm => "adpcm_ima_wav",
            CodecId::PcmS16Be => "pcm_s16be",
            CodecId::Text => "text",
            CodecId::Xml => "xml",
            CodecId::Layout => "layout",
            CodecId::Bmp => "bmp",
            CodecId::Pbm => "pbm",
        }
    }
}

/// Free-form text that accompanied a picture but matched no known label.
///
/// Each line is stored followed by `\r\n`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AdditionalText(Vec<u8>);

impl AdditionalText {
    pub(crate) fn push_line(&mut self, line: &[u8]) {
        self.0.extend_from_slice(line);
        self.0.extend_from_slice(b"\r\n");
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for AdditionalText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&String::from_utf8_lossy(&self.0), f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoMetadata {
    pub header: pic::PictureHeader,
    pub additional_text: AdditionalText,

    /// Per-frame telemetry from a Digital Sprite server, when present.
    pub telemetry: Option<crate::ds::pic::DsFrameData>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InfoFormat {
    Text,
    Xml,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverlayFormat {
    Bmp,
    Pbm,
}

/// What kind of record a [`Packet`] holds, with its decoded header if any.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum FrameMetadata {
    Video(VideoMetadata),
    Audio(audio::AudioHeader),
    DataInfo(InfoFormat),
    DataLayout,
    Overlay(OverlayFormat),
}

/// A demultiplexed frame.
///
/// Use the [bytes::Buf] implementation or [`Packet::data`] to retrieve the
/// payload. JPEG payloads are complete JFIF images; audio is in host order.
pub struct Packet {
    pub(crate) ctx: FrameContext,
    pub(crate) stream_index: usize,
    pub(crate) timestamp: Timestamp,
    pub(crate) is_keyframe: bool,
    pub(crate) metadata: FrameMetadata,
    pub(crate) data: Bytes,
}

impl Packet {
    /// Returns where the frame started in the input.
    #[inline]
    pub fn ctx(&self) -> &FrameContext {
        &self.ctx
    }

    /// Returns the index of this packet's stream within the demuxer's
    /// registry.
    #[inline]
    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns true if this frame can be decoded without any other.
    #[inline]
    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    #[inline]
    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Returns the picture header, for video packets.
    pub fn picture_header(&self) -> Option<&pic::PictureHeader> {
        match &self.metadata {
            FrameMetadata::Video(v) => Some(&v.header),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("ctx", &self.ctx)
            .field("stream_index", &self.stream_index)
            .field("timestamp", &self.timestamp)
            .field("is_keyframe", &self.is_keyframe)
            .field("metadata", &self.metadata)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

impl Buf for Packet {
    fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn chunk(&self) -> &[u8] {
        self.data.chunk()
    }

    fn advance(&mut self, cnt: usize) {
        self.data.advance(cnt)
    }
}
