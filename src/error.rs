// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::ds::msg::RejectReason;
use crate::{ConnectionContext, FrameContext, MessageContext};
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable error messages: most carry the byte
/// position of the offending frame or message so it can be found in a capture.
/// [`Error::kind`] gives a coarse classification for programmatic handling.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the broad class of this error.
    pub fn kind(&self) -> ErrorKind {
        match *self.0 {
            ErrorInt::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ErrorInt::IncompleteData { .. } => ErrorKind::IncompleteData,
            ErrorInt::InvalidHeader { .. } => ErrorKind::InvalidHeader,
            ErrorInt::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            ErrorInt::FramingError { .. } => ErrorKind::Framing,
            ErrorInt::ReadError { .. }
            | ErrorInt::ConnectError(_)
            | ErrorInt::DsReadError { .. }
            | ErrorInt::WriteError { .. } => ErrorKind::Io,
            ErrorInt::DsFramingError { .. } => ErrorKind::ProtocolDesync,
            ErrorInt::ConnectRejected { .. } => ErrorKind::ConnectRejected,
            ErrorInt::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            ErrorInt::Timeout => ErrorKind::Timeout,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Coarse classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller supplied an invalid argument.
    InvalidArgument,

    /// The input ended (or a read failed) partway through a frame.
    IncompleteData,

    /// A picture/audio header or separator failed validation.
    InvalidHeader,

    /// A frame declared a size that couldn't be allocated.
    OutOfMemory,

    /// Malformed framing, such as an unparseable MIME header block.
    Framing,

    /// An I/O error other than a short read.
    Io,

    /// A Digital Sprite message didn't start with the expected magic.
    ProtocolDesync,

    /// The Digital Sprite server refused the login.
    ConnectRejected,

    FailedPrecondition,

    Timeout,
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("[{ctx}] Incomplete frame: {description}")]
    IncompleteData {
        ctx: FrameContext,
        description: String,
    },

    #[error(
        "[{ctx}] Invalid header: {description}\n{:?}",
        crate::hex::LimitedHex::new(data, 64)
    )]
    InvalidHeader {
        ctx: FrameContext,
        description: String,
        data: Bytes,
    },

    #[error("[{ctx}] Unable to allocate {requested}-byte frame")]
    OutOfMemory { ctx: FrameContext, requested: usize },

    #[error("[{ctx}] Framing error: {description}")]
    FramingError {
        ctx: FrameContext,
        description: String,
    },

    #[error("[{ctx}] Error reading frame: {source}")]
    ReadError {
        ctx: FrameContext,
        source: std::io::Error,
    },

    #[error("Unable to connect to Digital Sprite server: {0}")]
    ConnectError(#[source] std::io::Error),

    /// Unparseable or unexpected Digital Sprite message.
    #[error("[{conn_ctx}, {msg_ctx}] Digital Sprite framing error: {description}")]
    DsFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: MessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Error reading from Digital Sprite peer: {source}")]
    DsReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: MessageContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Error writing to Digital Sprite peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Connection rejected: {reason}")]
    ConnectRejected {
        conn_ctx: ConnectionContext,
        reason: RejectReason,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Timeout")]
    Timeout,
}
