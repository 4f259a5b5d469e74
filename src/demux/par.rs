// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Frames from PAR recording files.
//!
//! Parsing the indexed PAR container itself is left to a [`ParSource`]; this
//! module turns the whole frames it hands over into [`Packet`]s, exactly as
//! the byte-stream framings would.

use bytes::Bytes;

use super::raw::read_raw_picture;
use super::{read_audio, Assembler, Ctx, DataRecord, DemuxOptions, SessionMetadata};
use crate::codec::audio::AUDIO_HEADER_SIZE;
use crate::codec::jfif::Jfif;
use crate::codec::{InfoFormat, Packet};
use crate::error::ErrorInt;
use crate::io::{Reader, RetryPolicy};
use crate::registry::Stream;
use crate::{Error, FrameContext};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParFrameKind {
    /// A picture header, its text and payload.
    Video,

    /// An audio header, its additional data and samples.
    Audio,

    /// Plain text.
    Info,
}

#[derive(Clone, Debug)]
pub struct ParFrame {
    pub kind: ParFrameKind,
    pub buffer: Bytes,
}

/// A reader of PAR files.
pub trait ParSource {
    /// Returns the next frame, or `None` at the end of the file.
    fn next_frame(&mut self) -> Result<Option<ParFrame>, std::io::Error>;

    /// Returns the number of frames in the file, if known.
    fn frame_count(&self) -> Option<u64> {
        None
    }

    /// Positions the source so the next frame returned is `index`.
    fn seek_frame(&mut self, index: u64) -> Result<(), std::io::Error> {
        let _ = index;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "seeking not supported",
        ))
    }
}

/// A demuxer over a [`ParSource`].
///
/// Packet contexts carry the frame index rather than a byte position.
pub struct ParDemuxer<S> {
    source: S,
    jfif: Jfif,
    options: DemuxOptions,
    assembler: Assembler,
    next_index: u64,
}

impl<S: ParSource> ParDemuxer<S> {
    pub fn new(source: S, options: DemuxOptions) -> Self {
        ParDemuxer {
            source,
            jfif: Jfif::new(),
            assembler: Assembler::new(options.utc_offset),
            options,
            next_index: 0,
        }
    }

    pub fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        let ctx = FrameContext::new(self.next_index);
        let Some(frame) = self
            .source
            .next_frame()
            .map_err(|source| wrap!(ErrorInt::ReadError { ctx, source }))?
        else {
            return Ok(None);
        };
        self.next_index += 1;
        let mut reader = Reader::new(&frame.buffer[..], RetryPolicy::never());
        let mut cx = Ctx {
            reader: &mut reader,
            jfif: &self.jfif,
            options: &self.options,
            conn: &mut self.assembler.conn,
        };
        let f = match frame.kind {
            ParFrameKind::Video => read_raw_picture(&mut cx, &ctx)?,
            ParFrameKind::Audio => {
                let raw = cx.array::<AUDIO_HEADER_SIZE>(&ctx)?;
                let available = frame.buffer.len() - AUDIO_HEADER_SIZE;
                read_audio(&mut cx, &ctx, &raw, Some(available))?.0
            }
            ParFrameKind::Info => {
                super::data_frame(DataRecord::Info(InfoFormat::Text), frame.buffer.clone())
            }
        };
        Ok(Some(self.assembler.packet(ctx, f)))
    }

    pub fn frame_count(&self) -> Option<u64> {
        self.source.frame_count()
    }

    /// Seeks to frame `index`; streams and their start times are kept.
    pub fn seek_frame(&mut self, index: u64) -> Result<(), Error> {
        self.source.seek_frame(index).map_err(|source| {
            wrap!(ErrorInt::ReadError {
                ctx: FrameContext::new(index),
                source,
            })
        })?;
        self.next_index = index;
        Ok(())
    }

    pub fn streams(&self) -> &[Stream] {
        self.assembler.registry.streams()
    }

    pub fn session_metadata(&self) -> Option<&SessionMetadata> {
        self.assembler.session.as_ref()
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::audio::AudioHeader;
    use crate::codec::FrameMetadata;
    use crate::testutil::{jpeg_header, picture};
    use crate::ErrorKind;

    struct VecSource {
        frames: Vec<ParFrame>,
        next: usize,
    }

    impl ParSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<ParFrame>, std::io::Error> {
            let f = self.frames.get(self.next).cloned();
            self.next += 1;
            Ok(f)
        }

        fn frame_count(&self) -> Option<u64> {
            Some(u64::try_from(self.frames.len()).unwrap())
        }

        fn seek_frame(&mut self, index: u64) -> Result<(), std::io::Error> {
            self.next = usize::try_from(index).unwrap();
            Ok(())
        }
    }

    fn frames() -> Vec<ParFrame> {
        let mut audio = Vec::new();
        AudioHeader::synthetic(100, 1, 1_584_268_200, 300, 4).encode(&mut audio);
        audio.extend_from_slice(&[0, 1, 0, 2]);
        vec![
            ParFrame {
                kind: ParFrameKind::Video,
                buffer: picture(
                    jpeg_header(3, 704, 576, 50),
                    b"Name: Lobby\r\n",
                    &[7, 8],
                )
                .into(),
            },
            ParFrame {
                kind: ParFrameKind::Audio,
                buffer: audio.into(),
            },
            ParFrame {
                kind: ParFrameKind::Info,
                buffer: Bytes::from_static(b"camera moved"),
            },
        ]
    }

    #[test]
    fn frames_and_seek() {
        let mut d = ParDemuxer::new(
            VecSource {
                frames: frames(),
                next: 0,
            },
            DemuxOptions::default(),
        );
        assert_eq!(d.frame_count(), Some(3));
        let v = d.read_packet().unwrap().unwrap();
        assert_eq!(v.picture_header().unwrap().title, "Lobby");
        assert!(v.data().ends_with(&[7, 8, 0xff, 0xd9]));
        let a = d.read_packet().unwrap().unwrap();
        assert!(matches!(a.metadata(), FrameMetadata::Audio(_)));
        assert_eq!(a.ctx().pos(), 1);
        assert_eq!(&a.data()[..], &[0, 1, 0, 2]);
        let i = d.read_packet().unwrap().unwrap();
        // Info records take the time of the last picture.
        assert_eq!(i.timestamp().timestamp(), v.timestamp().timestamp());
        assert!(d.read_packet().unwrap().is_none());

        d.seek_frame(0).unwrap();
        let again = d.read_packet().unwrap().unwrap();
        assert_eq!(again.stream_index(), v.stream_index());
        assert_eq!(again.ctx().pos(), 0);
        assert_eq!(d.streams().len(), 3);
        assert_eq!(d.session_metadata().unwrap().title, "Lobby");
    }

    #[test]
    fn seek_unsupported() {
        struct Once(Option<ParFrame>);
        impl ParSource for Once {
            fn next_frame(&mut self) -> Result<Option<ParFrame>, std::io::Error> {
                Ok(self.0.take())
            }
        }
        let mut d = ParDemuxer::new(Once(None), DemuxOptions::default());
        assert_eq!(d.frame_count(), None);
        assert_eq!(d.seek_frame(5).unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn short_video_frame() {
        let mut buffer = picture(jpeg_header(3, 704, 576, 50), b"", &[7, 8, 9]);
        buffer.truncate(buffer.len() - 1);
        let mut d = ParDemuxer::new(
            VecSource {
                frames: vec![ParFrame {
                    kind: ParFrameKind::Video,
                    buffer: buffer.into(),
                }],
                next: 0,
            },
            DemuxOptions::default(),
        );
        assert_eq!(d.read_packet().unwrap_err().kind(), ErrorKind::IncompleteData);
    }
}
