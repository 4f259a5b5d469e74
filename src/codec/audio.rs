// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The audio header preceding NetVu ADPCM and PCM audio frames.
//!
//! A 28-byte fixed portion of big-endian integers
//! (`version, mode, channel, size_of_additional_data, size_of_audio_data,
//! seconds, msecs`) is followed by `size_of_additional_data` opaque bytes and
//! then the samples.

use std::num::NonZeroU32;

use bytes::{Buf, BufMut, Bytes};
use log::debug;

pub const AUDIO_HEADER_SIZE: usize = 28;
pub const AUD_VERSION: u32 = 0x0ABC_DEF0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AudioCodec {
    /// IMA ADPCM, 4 bits per sample.
    Adpcm,

    /// 16-bit big-endian linear PCM ("L16").
    Pcm,
}

const fn hz(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(n) => n,
        None => panic!("zero sample rate"),
    }
}

/// `mode` values, which follow RTP payload type numbering where one exists.
const MODES: [(u32, AudioCodec, NonZeroU32); 14] = [
    (5, AudioCodec::Adpcm, hz(8000)),
    (16, AudioCodec::Adpcm, hz(11025)),
    (6, AudioCodec::Adpcm, hz(16000)),
    (17, AudioCodec::Adpcm, hz(22050)),
    (96, AudioCodec::Adpcm, hz(32000)),
    (97, AudioCodec::Adpcm, hz(44100)),
    (98, AudioCodec::Adpcm, hz(48000)),
    (100, AudioCodec::Pcm, hz(8000)),
    (101, AudioCodec::Pcm, hz(11025)),
    (102, AudioCodec::Pcm, hz(16000)),
    (103, AudioCodec::Pcm, hz(22050)),
    (104, AudioCodec::Pcm, hz(32000)),
    (11, AudioCodec::Pcm, hz(44100)),
    (105, AudioCodec::Pcm, hz(48000)),
];

/// Returns the codec and sample rate for `mode`; unknown modes are treated as
/// 8 kHz ADPCM.
pub fn mode_info(mode: u32) -> (AudioCodec, NonZeroU32) {
    MODES
        .iter()
        .find(|m| m.0 == mode)
        .map(|m| (m.1, m.2))
        .unwrap_or((AudioCodec::Adpcm, hz(8000)))
}

/// Returns the `mode` for the given codec and sample rate, if there is one.
pub fn mode_for(codec: AudioCodec, sample_rate: u32) -> Option<u32> {
    MODES
        .iter()
        .find(|m| m.1 == codec && m.2.get() == sample_rate)
        .map(|m| m.0)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioHeader {
    pub version: u32,
    pub mode: u32,
    pub channel: i32,
    pub size_of_additional_data: u32,
    pub size_of_audio_data: u32,
    pub seconds: u32,
    pub msecs: u32,

    /// The `size_of_additional_data` bytes following the fixed portion.
    pub additional_data: Bytes,
}

impl AudioHeader {
    /// Returns a header for audio which arrived without one.
    pub(crate) fn synthetic(
        mode: u32,
        channel: i32,
        seconds: u32,
        msecs: u32,
        size_of_audio_data: u32,
    ) -> Self {
        AudioHeader {
            version: AUD_VERSION,
            mode,
            channel,
            size_of_additional_data: 0,
            size_of_audio_data,
            seconds,
            msecs,
            additional_data: Bytes::new(),
        }
    }

    /// Decodes the fixed portion. `additional_data` is left empty; the caller
    /// reads it from the stream.
    ///
    /// Unexpected versions are accepted; servers in the field don't agree on
    /// the value.
    pub fn decode(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < AUDIO_HEADER_SIZE {
            return Err(format!(
                "audio header needs {AUDIO_HEADER_SIZE} bytes; have {}",
                buf.len()
            ));
        }
        let mut b = &buf[..AUDIO_HEADER_SIZE];
        let h = AudioHeader {
            version: b.get_u32(),
            mode: b.get_u32(),
            channel: b.get_i32(),
            size_of_additional_data: b.get_u32(),
            size_of_audio_data: b.get_u32(),
            seconds: b.get_u32(),
            msecs: b.get_u32(),
            additional_data: Bytes::new(),
        };
        if h.version != AUD_VERSION {
            debug!("audio header version {:#010x}; continuing", h.version);
        }
        Ok(h)
    }

    /// Writes the fixed portion followed by `additional_data`.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.version);
        out.put_u32(self.mode);
        out.put_i32(self.channel);
        out.put_u32(self.size_of_additional_data);
        out.put_u32(self.size_of_audio_data);
        out.put_u32(self.seconds);
        out.put_u32(self.msecs);
        out.put_slice(&self.additional_data);
    }

    pub fn codec(&self) -> AudioCodec {
        mode_info(self.mode).0
    }

    pub fn sample_rate(&self) -> NonZeroU32 {
        mode_info(self.mode).1
    }
}

/// Converts an ADPCM block from the server's byte order to the one decoders
/// expect, in place.
///
/// The block starts with a 16-bit big-endian predictor (rewritten
/// little-endian) and two bytes of step index and reserved (kept as is). Every
/// following byte holds two samples with the first in the high nibble; the
/// nibbles are swapped.
///
/// Both swaps are self-inverse, so applying this twice restores the input.
/// Demuxers apply it exactly once, when reading a block.
pub fn adpcm_network_to_host(data: &mut [u8]) {
    if data.len() >= 2 {
        data.swap(0, 1);
    }
    for b in data.iter_mut().skip(4) {
        *b = b.rotate_left(4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes() {
        assert_eq!(mode_info(5), (AudioCodec::Adpcm, hz(8000)));
        assert_eq!(mode_info(11), (AudioCodec::Pcm, hz(44100)));
        assert_eq!(mode_info(98), (AudioCodec::Adpcm, hz(48000)));
        assert_eq!(mode_info(1234), (AudioCodec::Adpcm, hz(8000)));
        assert_eq!(mode_for(AudioCodec::Pcm, 16000), Some(102));
        assert_eq!(mode_for(AudioCodec::Adpcm, 12345), None);
    }

    #[test]
    fn decode() {
        let raw = [
            0x0a, 0xbc, 0xde, 0xf0, // version
            0x00, 0x00, 0x00, 0x06, // mode: ADPCM 16 kHz
            0x00, 0x00, 0x00, 0x01, // channel
            0x00, 0x00, 0x00, 0x02, // additional data
            0x00, 0x00, 0x01, 0x00, // audio data
            0x5e, 0x6e, 0x00, 0xa8, // seconds
            0x00, 0x00, 0x00, 0x7d, // msecs
        ];
        let h = AudioHeader::decode(&raw).unwrap();
        assert_eq!(h.version, AUD_VERSION);
        assert_eq!(h.channel, 1);
        assert_eq!(h.size_of_additional_data, 2);
        assert_eq!(h.size_of_audio_data, 256);
        assert_eq!(h.seconds, 0x5e6e_00a8);
        assert_eq!(h.msecs, 125);
        assert_eq!(h.sample_rate().get(), 16000);
        AudioHeader::decode(&raw[..27]).unwrap_err();

        let mut out = Vec::new();
        h.encode(&mut out);
        assert_eq!(&out[..], &raw[..]);
    }

    #[test]
    fn adpcm_swap() {
        let mut block = [0x12, 0x34, 0x56, 0x78, 0xab, 0x0f, 0x90];
        adpcm_network_to_host(&mut block);
        assert_eq!(block, [0x34, 0x12, 0x56, 0x78, 0xba, 0xf0, 0x09]);
        adpcm_network_to_host(&mut block);
        assert_eq!(block, [0x12, 0x34, 0x56, 0x78, 0xab, 0x0f, 0x90]);
    }

    #[test]
    fn adpcm_swap_tiny() {
        let mut block = [0x12];
        adpcm_network_to_host(&mut block);
        assert_eq!(block, [0x12]);
    }
}
