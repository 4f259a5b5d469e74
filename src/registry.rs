// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logical streams, created on first sight of each distinct source.
//!
//! A NetVu connection multiplexes cameras, audio channels and data records
//! without announcing them up front, so streams are discovered as frames
//! arrive. Lookups are linear; a connection rarely carries more than a handful.

use std::num::NonZeroU32;

use log::debug;
use smallvec::SmallVec;

use crate::codec::{CodecId, MediaKind};
use crate::Timestamp;

/// Identifies a logical stream.
///
/// Video dimensions are rounded up to a multiple of 16, so a camera whose
/// frames vary slightly in size (eg cropped fields) stays on one stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamKey {
    Video {
        codec: CodecId,
        camera: i32,
        width: u32,
        height: u32,
    },
    Audio {
        channel: i32,
    },
    Data {
        codec: CodecId,
    },
}

fn round_up_16(n: i32) -> u32 {
    let n = u32::try_from(n).unwrap_or(0);
    (n.saturating_add(15)) & !15
}

impl StreamKey {
    pub fn video(codec: CodecId, camera: i32, width: i32, height: i32) -> Self {
        StreamKey::Video {
            codec,
            camera,
            width: round_up_16(width),
            height: round_up_16(height),
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        match self {
            StreamKey::Video { .. } => MediaKind::Video,
            StreamKey::Audio { .. } => MediaKind::Audio,
            StreamKey::Data { .. } => MediaKind::Data,
        }
    }
}

/// Descriptive metadata taken from the first frame of a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub title: Option<String>,

    /// Camera number for video, channel for audio.
    pub track: Option<i32>,
    pub locale: Option<String>,

    /// Minutes east of UTC.
    pub utc_offset: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct Stream {
    index: usize,
    key: StreamKey,
    codec: CodecId,
    time_base: NonZeroU32,
    metadata: StreamMetadata,
    start: Option<i64>,
    frames: u64,
}

impl Stream {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn media_kind(&self) -> MediaKind {
        self.key.media_kind()
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    /// Returns the clock rate of this stream's timestamps, in Hz.
    pub fn time_base(&self) -> NonZeroU32 {
        self.time_base
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    /// Returns the timestamp of the first frame, if any.
    pub fn start(&self) -> Option<i64> {
        self.start
    }

    /// Returns the number of frames delivered on this stream.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// The streams of one connection or file.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: SmallVec<[Stream; 4]>,
}

impl StreamRegistry {
    /// Returns the index of the stream for `key`, creating it if necessary.
    ///
    /// `metadata` is only consulted on creation.
    pub fn get_or_create(
        &mut self,
        key: StreamKey,
        codec: CodecId,
        time_base: NonZeroU32,
        metadata: impl FnOnce() -> StreamMetadata,
    ) -> usize {
        if let Some(s) = self.streams.iter().find(|s| s.key == key) {
            return s.index;
        }
        let index = self.streams.len();
        let metadata = metadata();
        debug!(
            "new stream {}: {:?} {} at {} Hz, {:?}",
            index,
            key,
            codec.name(),
            time_base,
            &metadata
        );
        self.streams.push(Stream {
            index,
            key,
            codec,
            time_base,
            metadata,
            start: None,
            frames: 0,
        });
        index
    }

    /// Annotates `timestamp` for stream `index`, recording it as the start if
    /// it's the stream's first.
    pub(crate) fn timestamp(&mut self, index: usize, timestamp: i64) -> Timestamp {
        let s = &mut self.streams[index];
        let start = *s.start.get_or_insert(timestamp);
        s.frames += 1;
        // A server clock jumping back past i64::MIN from the start isn't
        // plausible; treat the frame as starting the stream if it does.
        Timestamp::new(timestamp, s.time_base, start).unwrap_or(Timestamp {
            timestamp,
            clock_rate: s.time_base,
            start: timestamp,
        })
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn get(&self, index: usize) -> Option<&Stream> {
        self.streams.get(index)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
