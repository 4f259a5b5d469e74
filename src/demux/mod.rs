// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Demultiplexers for the NetVu byte-stream framings.
//!
//! [`Demuxer`] pulls frames from a blocking [`std::io::Read`] one at a time.
//! Every framing decodes into the same internal frame representation, which
//! is then assigned a stream and timestamp by a shared assembler; so a JPEG
//! arriving over "adbinary" and one arriving over "admime" produce identical
//! [`Packet`]s.
//!
//! [`par::ParDemuxer`] does the same for frames handed over whole by a PAR
//! file reader.

use std::io::Read;
use std::num::NonZeroU32;

use bytes::Bytes;
use log::trace;

use crate::codec::audio::{adpcm_network_to_host, AudioCodec, AudioHeader, AUDIO_HEADER_SIZE};
use crate::codec::comment::{self, Vocabulary};
use crate::codec::jfif::{Jfif, EOI};
use crate::codec::mpeg::{h264_is_idr, mpeg4_is_intra};
use crate::codec::pic::{self, PictureHeader, VideoFormat};
use crate::codec::{
    AdditionalText, CodecId, FrameMetadata, InfoFormat, OverlayFormat, Packet, VideoMetadata,
};
use crate::io::{ReadError, Reader, RetryPolicy};
use crate::registry::{Stream, StreamKey, StreamMetadata, StreamRegistry};
use crate::{Error, ErrorInt, FrameContext};

pub mod binary;
pub mod mime;
pub mod par;
pub mod raw;

/// Video and data records are timestamped in milliseconds.
const MILLIS: NonZeroU32 = match NonZeroU32::new(1000) {
    Some(n) => n,
    None => panic!("zero clock rate"),
};

/// A byte-stream framing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    /// "adbinary": 6-byte separators before each frame.
    Binary,

    /// "admime": server-push multipart parts.
    Mime,

    /// Back-to-back picture headers with no separators.
    Raw,
}

impl Format {
    /// Guesses the framing from the first bytes of a stream.
    ///
    /// At least 16 bytes should be supplied; fewer may be inconclusive.
    pub fn probe(buf: &[u8]) -> Option<Format> {
        if let Some(&[a, b, c, d]) = buf.get(..4) {
            if pic::is_valid_version(u32::from_be_bytes([a, b, c, d])) {
                return Some(Format::Raw);
            }
        }
        if binary::probe(buf) {
            return Some(Format::Binary);
        }
        if mime::probe(buf) {
            return Some(Format::Mime);
        }
        None
    }
}

/// Frame type codes, as carried in the binary separator.
///
/// MIME content types map onto the same codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    /// Picture header, text, JPEG scan data.
    Jpeg = 0,

    /// A complete JFIF image.
    Jfif = 1,
    Mpeg4I = 2,
    Mpeg4P = 3,
    AudioAdpcm = 4,
    AudioRaw = 5,

    /// MPEG-4 with only a timestamp for a header.
    MinimalMpeg4 = 6,

    /// ADPCM with only a timestamp and mode for a header.
    MinimalAudioAdpcm = 7,
    Layout = 8,
    Info = 9,
    H264I = 10,
    H264P = 11,
    XmlInfo = 12,
    Bmp = 13,
    Pbm = 14,
}

impl DataType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => DataType::Jpeg,
            1 => DataType::Jfif,
            2 => DataType::Mpeg4I,
            3 => DataType::Mpeg4P,
            4 => DataType::AudioAdpcm,
            5 => DataType::AudioRaw,
            6 => DataType::MinimalMpeg4,
            7 => DataType::MinimalAudioAdpcm,
            8 => DataType::Layout,
            9 => DataType::Info,
            10 => DataType::H264I,
            11 => DataType::H264P,
            12 => DataType::XmlInfo,
            13 => DataType::Bmp,
            14 => DataType::Pbm,
            _ => return None,
        })
    }
}

/// Options for a [`Demuxer`] or [`par::ParDemuxer`].
#[derive(Clone, Debug)]
pub struct DemuxOptions {
    retry: RetryPolicy,
    max_frame_size: usize,
    max_raw_jpeg_size: usize,
    max_jfif_header_size: usize,
    max_resync_bytes: usize,
    utc_offset: i32,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_frame_size: 8 << 20,
            max_raw_jpeg_size: 256 << 10,
            max_jfif_header_size: 1024,
            max_resync_bytes: 1 << 20,
            utc_offset: 0,
        }
    }
}

impl DemuxOptions {
    /// Sets the policy for retrying transient read errors.
    pub fn retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// Sets the largest size any single frame may declare.
    ///
    /// Larger declarations are rejected as invalid headers before anything is
    /// allocated.
    pub fn max_frame_size(self, max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            ..self
        }
    }

    /// Sets how far to scan for the end of a JPEG that arrived without MIME
    /// headers.
    pub fn max_raw_jpeg_size(self, max_raw_jpeg_size: usize) -> Self {
        Self {
            max_raw_jpeg_size,
            ..self
        }
    }

    /// Sets the room allowed for a synthesized JFIF header.
    pub fn max_jfif_header_size(self, max_jfif_header_size: usize) -> Self {
        Self {
            max_jfif_header_size,
            ..self
        }
    }

    /// Sets how many bytes the raw framing may discard looking for the next
    /// picture header.
    pub fn max_resync_bytes(self, max_resync_bytes: usize) -> Self {
        Self {
            max_resync_bytes,
            ..self
        }
    }

    /// Sets the UTC offset, in minutes, given to frames whose header doesn't
    /// carry one.
    pub fn utc_offset(self, utc_offset: i32) -> Self {
        Self { utc_offset, ..self }
    }
}

/// Descriptive metadata from the first picture of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub title: String,
    pub camera: i32,
    pub locale: String,

    /// Minutes east of UTC.
    pub utc_offset: i32,
}

/// Per-connection state shared by every frame read.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    /// Applied to frames with minimal headers.
    pub(crate) utc_offset: i32,

    /// The type of the most recent frame.
    pub(crate) datatype: Option<DataType>,

    /// Whether [`SessionMetadata`] has been taken from a picture yet.
    pub(crate) metadata_set: bool,

    /// The most recent picture time, in milliseconds, for records which carry
    /// no time of their own.
    pub(crate) last_time_ms: Option<i64>,
}

/// A decoded frame, not yet assigned to a stream.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) codec: CodecId,
    pub(crate) metadata: FrameMetadata,
    pub(crate) is_keyframe: bool,
    pub(crate) data: Bytes,
}

/// The non-media record kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DataRecord {
    Info(InfoFormat),
    Layout,
    Overlay(OverlayFormat),
}

impl DataRecord {
    fn codec(self) -> CodecId {
        match self {
            DataRecord::Info(InfoFormat::Text) => CodecId::Text,
            DataRecord::Info(InfoFormat::Xml) => CodecId::Xml,
            DataRecord::Layout => CodecId::Layout,
            DataRecord::Overlay(OverlayFormat::Bmp) => CodecId::Bmp,
            DataRecord::Overlay(OverlayFormat::Pbm) => CodecId::Pbm,
        }
    }

    fn metadata(self) -> FrameMetadata {
        match self {
            DataRecord::Info(f) => FrameMetadata::DataInfo(f),
            DataRecord::Layout => FrameMetadata::DataLayout,
            DataRecord::Overlay(f) => FrameMetadata::Overlay(f),
        }
    }
}

/// How to interpret the payload behind a full picture header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Payload {
    Jpeg,
    Mpeg4,
    H264,
}

impl Payload {
    pub(crate) fn for_format(f: VideoFormat) -> Self {
        if f.is_jpeg() {
            Payload::Jpeg
        } else if f.is_mpeg4() {
            Payload::Mpeg4
        } else {
            Payload::H264
        }
    }
}

/// Converts a [`ReadError`] into a frame error.
pub(crate) fn read_error(ctx: FrameContext, e: ReadError) -> Error {
    wrap!(match e {
        ReadError::Eof { wanted, got } => ErrorInt::IncompleteData {
            ctx,
            description: format!("input ended after {got} of {wanted} bytes"),
        },
        ReadError::Io(source) => ErrorInt::ReadError { ctx, source },
        ReadError::OutOfMemory(requested) => ErrorInt::OutOfMemory { ctx, requested },
        ReadError::TooLong { limit } => ErrorInt::FramingError {
            ctx,
            description: format!("no terminator within {limit} bytes"),
        },
    })
}

pub(crate) fn invalid_header(ctx: FrameContext, description: String, data: &[u8]) -> Error {
    wrap!(ErrorInt::InvalidHeader {
        ctx,
        description,
        data: Bytes::copy_from_slice(data),
    })
}

/// Everything a framing needs to read one frame.
pub(crate) struct Ctx<'a, R> {
    pub(crate) reader: &'a mut Reader<R>,
    pub(crate) jfif: &'a Jfif,
    pub(crate) options: &'a DemuxOptions,
    pub(crate) conn: &'a mut ConnectionState,
}

impl<R: Read> Ctx<'_, R> {
    pub(crate) fn frame_ctx(&self) -> FrameContext {
        FrameContext::new(self.reader.pos())
    }

    pub(crate) fn at_eof(&mut self, ctx: &FrameContext) -> Result<bool, Error> {
        self.reader
            .at_eof()
            .map_err(|e| read_error(*ctx, e.into()))
    }

    pub(crate) fn peek(&mut self, ctx: &FrameContext, n: usize) -> Result<&[u8], Error> {
        self.reader
            .peek(n)
            .map_err(|e| read_error(*ctx, e.into()))
    }

    pub(crate) fn array<const N: usize>(&mut self, ctx: &FrameContext) -> Result<[u8; N], Error> {
        self.reader.read_array().map_err(|e| read_error(*ctx, e))
    }

    pub(crate) fn vec(&mut self, ctx: &FrameContext, n: usize) -> Result<Vec<u8>, Error> {
        self.reader.read_vec(n).map_err(|e| read_error(*ctx, e))
    }

    pub(crate) fn bytes(&mut self, ctx: &FrameContext, n: usize) -> Result<Bytes, Error> {
        self.reader.read_bytes(n).map_err(|e| read_error(*ctx, e))
    }

    pub(crate) fn skip(&mut self, ctx: &FrameContext, n: usize) -> Result<(), Error> {
        self.reader.skip(n).map_err(|e| read_error(*ctx, e))
    }

    pub(crate) fn line(
        &mut self,
        ctx: &FrameContext,
        max_len: usize,
    ) -> Result<Option<Bytes>, Error> {
        self.reader
            .read_line(max_len)
            .map_err(|e| read_error(*ctx, e))
    }

    /// Validates a size declared on the wire against `max_frame_size`.
    pub(crate) fn check_size(
        &self,
        ctx: &FrameContext,
        declared: i64,
        what: &str,
    ) -> Result<usize, Error> {
        match usize::try_from(declared) {
            Ok(n) if n <= self.options.max_frame_size => Ok(n),
            _ => bail!(ErrorInt::InvalidHeader {
                ctx: *ctx,
                description: format!(
                    "{what} size {declared} outside [0, {}]",
                    self.options.max_frame_size
                ),
                data: Bytes::new(),
            }),
        }
    }
}

/// Reads the text and payload following a decoded full picture header.
///
/// `intra` marks the frame as a keyframe regardless of what the payload looks
/// like.
pub(crate) fn read_picture<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
    mut header: PictureHeader,
    payload: Payload,
    intra: bool,
) -> Result<Frame, Error> {
    let mut additional_text = AdditionalText::default();
    if header.start_offset > 0 {
        let n = cx.check_size(ctx, i64::from(header.start_offset), "text")?;
        let text = cx.vec(ctx, n)?;
        comment::parse(Vocabulary::Jfif, &text, &mut header, &mut additional_text);
    }
    let size = cx.check_size(ctx, i64::from(header.size), "picture")?;
    let intra = intra || header.video_format().map_or(false, VideoFormat::is_intra);
    let (codec, data, is_keyframe) = match payload {
        Payload::Jpeg => {
            let jfif_header = cx
                .jfif
                .build(&header, cx.options.max_jfif_header_size)
                .map_err(|description| invalid_header(*ctx, description, &header.to_bytes()))?;
            let total = jfif_header.len() + size + EOI.len();
            let mut data = Vec::new();
            data.try_reserve_exact(total)
                .map_err(|_| wrap!(ErrorInt::OutOfMemory { ctx: *ctx, requested: total }))?;
            data.extend_from_slice(&jfif_header);
            cx.reader
                .read_into(&mut data, size)
                .map_err(|e| read_error(*ctx, e))?;
            data.extend_from_slice(&EOI);
            (CodecId::Mjpeg, Bytes::from(data), true)
        }
        Payload::Mpeg4 => {
            let data = cx.bytes(ctx, size)?;
            let key = intra || mpeg4_is_intra(&data);
            (CodecId::Mpeg4, data, key)
        }
        Payload::H264 => {
            let data = cx.bytes(ctx, size)?;
            let key = intra || h264_is_idr(&data);
            (CodecId::H264, data, key)
        }
    };
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

/// Reads the additional data and samples following a full audio header.
///
/// Returns the frame and the number of bytes it occupied after `raw`.
pub(crate) fn read_audio<R: Read>(
    cx: &mut Ctx<'_, R>,
    ctx: &FrameContext,
    raw: &[u8; AUDIO_HEADER_SIZE],
    available: Option<usize>,
) -> Result<(Frame, usize), Error> {
    let mut header =
        AudioHeader::decode(raw).map_err(|description| invalid_header(*ctx, description, raw))?;
    let additional = cx.check_size(
        ctx,
        i64::from(header.size_of_additional_data),
        "audio additional data",
    )?;
    let samples = cx.check_size(ctx, i64::from(header.size_of_audio_data), "audio")?;
    let body = additional + samples;
    if let Some(available) = available {
        if body > available {
            return Err(invalid_header(
                *ctx,
                format!("audio header declares {body} bytes; frame holds {available}"),
                raw,
            ));
        }
    }
    header.additional_data = cx.bytes(ctx, additional)?;
    let data = cx.vec(ctx, samples)?;
    Ok((audio_frame(header, data), body))
}

/// Converts samples to host order and wraps them as a frame.
pub(crate) fn audio_frame(header: AudioHeader, mut data: Vec<u8>) -> Frame {
    let codec = match header.codec() {
        AudioCodec::Adpcm => {
            adpcm_network_to_host(&mut data);
            CodecId::Adpcm
        }
        AudioCodec::Pcm => CodecId::PcmS16Be,
    };
    Frame {
        codec,
        metadata: FrameMetadata::Audio(header),
        is_keyframe: true,
        data: Bytes::from(data),
    }
}

pub(crate) fn data_frame(record: DataRecord, data: Bytes) -> Frame {
    Frame {
        codec: record.codec(),
        metadata: record.metadata(),
        is_keyframe: true,
        data,
    }
}

/// Recovers the picture header from a complete JFIF image.
///
/// Fields the image doesn't carry are filled in from `cam` and `utc_offset`.
pub(crate) fn jfif_frame(
    jfif: &Jfif,
    ctx: &FrameContext,
    mut data: Vec<u8>,
    cam: i32,
    utc_offset: i32,
) -> Result<Frame, Error> {
    let parsed = jfif
        .parse(&mut data)
        .map_err(|description| invalid_header(*ctx, description, &data[..data.len().min(64)]))?;
    let mut header = parsed.header;
    if header.cam == 0 {
        header.cam = cam;
    }
    if header.title.is_empty() {
        header.title = format!("Camera {}", header.cam);
    }
    if header.utc_offset == 0 {
        header.utc_offset = utc_offset;
    }
    Ok(Frame {
        codec: CodecId::Mjpeg,
        metadata: FrameMetadata::Video(VideoMetadata {
            header,
            additional_text: parsed.additional_text,
            telemetry: None,
        }),
        is_keyframe: true,
        data: Bytes::from(data),
    })
}

fn stream_metadata(m: &FrameMetadata) -> StreamMetadata {
    match m {
        FrameMetadata::Video(v) => StreamMetadata {
            title: Some(v.header.title.clone()),
            track: Some(v.header.cam),
            locale: Some(v.header.locale.clone()).filter(|l| !l.is_empty()),
            utc_offset: Some(v.header.utc_offset),
        },
        FrameMetadata::Audio(a) => StreamMetadata {
            track: Some(a.channel),
            ..Default::default()
        },
        _ => StreamMetadata::default(),
    }
}

/// Assigns frames to streams and timestamps them.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    pub(crate) registry: StreamRegistry,
    pub(crate) conn: ConnectionState,
    pub(crate) session: Option<SessionMetadata>,
}

impl Assembler {
    pub(crate) fn new(utc_offset: i32) -> Self {
        Assembler {
            conn: ConnectionState {
                utc_offset,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(crate) fn packet(&mut self, ctx: FrameContext, frame: Frame) -> Packet {
        let (key, time_base, ts) = match &frame.metadata {
            FrameMetadata::Video(v) => {
                let h = &v.header;
                if !self.conn.metadata_set {
                    self.session = Some(SessionMetadata {
                        title: h.title.clone(),
                        camera: h.cam,
                        locale: h.locale.clone(),
                        utc_offset: h.utc_offset,
                    });
                    self.conn.metadata_set = true;
                }
                self.conn.utc_offset = h.utc_offset;
                let ms = i64::from(h.session_time) * 1000 + i64::from(h.milliseconds);
                self.conn.last_time_ms = Some(ms);
                let key = StreamKey::video(
                    frame.codec,
                    h.cam,
                    i32::from(h.format.target_pixels),
                    i32::from(h.format.target_lines),
                );
                (key, MILLIS, ms)
            }
            FrameMetadata::Audio(a) => {
                let rate = a.sample_rate();
                let ms = i64::from(a.seconds) * 1000 + i64::from(a.msecs);
                let ts = ms * i64::from(rate.get()) / 1000;
                (StreamKey::Audio { channel: a.channel }, rate, ts)
            }
            FrameMetadata::DataInfo(_) | FrameMetadata::DataLayout | FrameMetadata::Overlay(_) => {
                let ms = self.conn.last_time_ms.unwrap_or(0);
                (StreamKey::Data { codec: frame.codec }, MILLIS, ms)
            }
        };
        let stream_index = self
            .registry
            .get_or_create(key, frame.codec, time_base, || stream_metadata(&frame.metadata));
        let timestamp = self.registry.timestamp(stream_index, ts);
        trace!(
            "[{}] stream {} {} {} bytes{}",
            &ctx,
            stream_index,
            &timestamp,
            frame.data.len(),
            if frame.is_keyframe { " (key)" } else { "" }
        );
        Packet {
            ctx,
            stream_index,
            timestamp,
            is_keyframe: frame.is_keyframe,
            metadata: frame.metadata,
            data: frame.data,
        }
    }
}

enum DemuxerInner {
    Binary(binary::Demuxer),
    Mime(mime::Demuxer),
    Raw(raw::Demuxer),
}

/// Pulls [`Packet`]s from a NetVu byte stream.
pub struct Demuxer<R> {
    reader: Reader<R>,
    format: Format,
    inner: DemuxerInner,
    jfif: Jfif,
    options: DemuxOptions,
    assembler: Assembler,
}

impl<R: Read> Demuxer<R> {
    pub fn new(format: Format, inner: R, options: DemuxOptions) -> Self {
        let reader = Reader::new(inner, options.retry.clone());
        Self::with_reader(format, reader, options)
    }

    /// Creates a demuxer for whatever framing the stream begins with.
    pub fn probe(inner: R, options: DemuxOptions) -> Result<Self, Error> {
        let mut reader = Reader::new(inner, options.retry.clone());
        let head = reader
            .peek(16)
            .map_err(|e| read_error(FrameContext::new(0), e.into()))?;
        let Some(format) = Format::probe(head) else {
            return Err(invalid_header(
                FrameContext::new(0),
                "unrecognized framing".to_owned(),
                head,
            ));
        };
        Ok(Self::with_reader(format, reader, options))
    }

    fn with_reader(format: Format, reader: Reader<R>, options: DemuxOptions) -> Self {
        let inner = match format {
            Format::Binary => DemuxerInner::Binary(binary::Demuxer::default()),
            Format::Mime => DemuxerInner::Mime(mime::Demuxer::default()),
            Format::Raw => DemuxerInner::Raw(raw::Demuxer::default()),
        };
        Demuxer {
            reader,
            format,
            inner,
            jfif: Jfif::new(),
            assembler: Assembler::new(options.utc_offset),
            options,
        }
    }

    /// Reads the next packet, or `None` at a clean end of input.
    ///
    /// After an error, the caller may try again; the framing resumes wherever
    /// the failed frame left the input.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        let mut cx = Ctx {
            reader: &mut self.reader,
            jfif: &self.jfif,
            options: &self.options,
            conn: &mut self.assembler.conn,
        };
        let next = match &mut self.inner {
            DemuxerInner::Binary(d) => d.read_frame(&mut cx)?,
            DemuxerInner::Mime(d) => d.read_frame(&mut cx)?,
            DemuxerInner::Raw(d) => d.read_frame(&mut cx)?,
        };
        Ok(next.map(|(ctx, frame)| self.assembler.packet(ctx, frame)))
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn streams(&self) -> &[Stream] {
        self.assembler.registry.streams()
    }

    /// Returns metadata from the session's first picture, once one has been
    /// read.
    pub fn session_metadata(&self) -> Option<&SessionMetadata> {
        self.assembler.session.as_ref()
    }

    /// Returns the type of the most recently read frame.
    pub fn datatype(&self) -> Option<DataType> {
        self.assembler.conn.datatype
    }

    /// Returns the number of input bytes consumed.
    pub fn pos(&self) -> u64 {
        self.reader.pos()
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

impl<R: Read> Iterator for Demuxer<R> {
    type Item = Result<Packet, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_packet().transpose()
    }
}
