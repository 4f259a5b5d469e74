// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`tokio_util::codec`] framing of Digital Sprite messages.

use bytes::{Buf, BytesMut};

use super::msg::{Body, Header, Message, HEADER_SIZE, MAGIC, VERSION};
use crate::{MessageContext, WallTime};

/// Largest body accepted; image data is the only large message.
const MAX_BODY: usize = 8 << 20;

/// A decoded message with its position in the stream.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub ctx: MessageContext,
    pub sequence: u32,
    pub msg: Message,
}

/// Encodes and decodes Digital Sprite messages.
pub(crate) struct Codec {
    /// Number of bytes read and processed (drained from the input buffer).
    pub(crate) read_pos: u64,

    /// Sequence number for the next message sent.
    next_sequence: u32,
}

/// An intermediate error type that exists because [`tokio_util::codec::Framed`]
/// expects the codec's error type to implement `From<std::io::Error>`, and
/// [`crate::Error`] takes additional context.
#[derive(Debug)]
pub(crate) enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    pub(crate) fn new() -> Self {
        Codec {
            read_pos: 0,
            next_sequence: 1,
        }
    }

    fn parse_error(&self, description: String) -> CodecError {
        CodecError::ParseError {
            description,
            pos: self.read_pos,
        }
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = Header::decode(&src[..HEADER_SIZE]).map_err(|d| self.parse_error(d))?;
        if header.magic != MAGIC {
            return Err(self.parse_error(format!(
                "bad magic {:#010x}; buffered:\n{:#?}",
                header.magic,
                crate::hex::LimitedHex::new(&src[..], 128),
            )));
        }
        let len = usize::try_from(header.length).unwrap_or(usize::MAX);
        if len > MAX_BODY {
            return Err(self.parse_error(format!(
                "{len}-byte message body exceeds {MAX_BODY}-byte limit"
            )));
        }
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let raw = src.split_to(len).freeze();
        let body = Body::decode(header.message_type, raw).map_err(|d| self.parse_error(d))?;
        let msg = ReceivedMessage {
            ctx: MessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
            },
            sequence: header.sequence,
            msg: Message {
                channel_id: header.channel_id,
                body,
            },
        };
        self.read_pos += crate::to_u64(HEADER_SIZE + len);
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.body.encoded_len();
        let length = u32::try_from(len).map_err(|_| {
            CodecError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{len}-byte message body is too long"),
            ))
        })?;
        dst.reserve(HEADER_SIZE + len);
        Header {
            magic: MAGIC,
            length,
            channel_id: item.channel_id,
            sequence: self.next_sequence,
            version: VERSION,
            checksum: 0,
            message_type: item.body.message_type(),
        }
        .encode(dst);
        item.body.encode(dst);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(())
    }
}
