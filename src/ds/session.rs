// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based Digital Sprite [`Session`].

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::{Host, Url};

use super::codec::{Codec, CodecError, ReceivedMessage};
use super::handshake::{Failure, Handshake, SessionOptions, Step};
use super::msg::{Body, ConnectReply, Message};
use super::pic::image_frame;
use crate::codec::jfif::Jfif;
use crate::codec::Packet;
use crate::demux::{Assembler, SessionMetadata};
use crate::error::ErrorInt;
use crate::registry::Stream;
use crate::{ConnectionContext, Error, FrameContext, MessageContext, WallTime};

/// TCP port used when a `ds://` URL doesn't name one.
pub const DEFAULT_PORT: u16 = 8968;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Open,
    Ended,
    Failed,
}

/// A logged-in Digital Sprite session, yielding picture packets.
///
/// Implements [`futures::Stream`]; the stream ends when the server
/// disconnects or closes the connection.
pub struct Session<T> {
    framed: Framed<T, Codec>,
    conn_ctx: ConnectionContext,
    reply: ConnectReply,
    jfif: Jfif,
    assembler: Assembler,
    state: State,
}

impl Session<TcpStream> {
    /// Connects to `ds://host[:port]` and logs in.
    pub async fn connect(url: &Url, options: SessionOptions) -> Result<Self, Error> {
        if url.scheme() != "ds" {
            bail!(ErrorInt::InvalidArgument(format!(
                "Only ds urls supported; got {url}"
            )));
        }
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let stream = match url.host() {
            Some(Host::Domain(h)) => TcpStream::connect((h, port)).await,
            Some(Host::Ipv4(h)) => TcpStream::connect((h, port)).await,
            Some(Host::Ipv6(h)) => TcpStream::connect((h, port)).await,
            None => bail!(ErrorInt::InvalidArgument(format!(
                "Must specify host in ds url {url}"
            ))),
        }
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let established_wall = WallTime::now();
        let local_addr = stream
            .local_addr()
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let conn_ctx = ConnectionContext {
            local_addr,
            peer_addr,
            established_wall,
        };
        Self::handshake(stream, conn_ctx, options).await
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Session<T> {
    /// Logs in over an established transport.
    pub async fn handshake(
        transport: T,
        conn_ctx: ConnectionContext,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let mut framed = Framed::new(transport, Codec::new());
        let reply = match options.get_login_timeout() {
            Some(d) => tokio::time::timeout(d, login(&mut framed, &conn_ctx, options))
                .await
                .map_err(|_| wrap!(ErrorInt::Timeout))??,
            None => login(&mut framed, &conn_ctx, options).await?,
        };
        debug!(
            "[{}] logged in; {} cameras, viewable mask {:#x}",
            &conn_ctx, reply.num_cameras, reply.viewable_cam_mask
        );
        Ok(Session {
            framed,
            conn_ctx,
            reply,
            jfif: Jfif::new(),
            assembler: Assembler::new(0),
            state: State::Open,
        })
    }

    /// Returns the next packet, or `None` once the server has disconnected.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>, Error> {
        self.next().await.transpose()
    }

    /// Tells the server this client is going away.
    pub async fn disconnect(mut self) -> Result<(), Error> {
        let conn_ctx = self.conn_ctx;
        self.framed
            .send(Message::new(Body::CliDisconnect))
            .await
            .map_err(|e| write_error(conn_ctx, e))
    }

    pub fn conn_ctx(&self) -> &ConnectionContext {
        &self.conn_ctx
    }

    /// Returns the server's reply to the login.
    pub fn connect_reply(&self) -> &ConnectReply {
        &self.reply
    }

    pub fn streams(&self) -> &[Stream] {
        self.assembler.registry.streams()
    }

    pub fn session_metadata(&self) -> Option<&SessionMetadata> {
        self.assembler.session.as_ref()
    }

    fn handle_message(&mut self, received: ReceivedMessage) -> Option<Result<Packet, Error>> {
        let ctx = FrameContext::new(received.ctx.pos());
        match received.msg.body {
            Body::ImgData(image) => {
                let default_cam = i32::try_from(received.msg.channel_id)
                    .map_or(1, |c| c.saturating_add(1));
                let frame = image_frame(
                    &self.jfif,
                    &ctx,
                    &image,
                    Some(&self.reply),
                    default_cam,
                    self.assembler.conn.utc_offset,
                );
                Some(frame.map(|f| self.assembler.packet(ctx, f)))
            }
            Body::Nudge => {
                trace!("[{}, {}] nudge", &self.conn_ctx, &received.ctx);
                None
            }
            Body::SrvDisconnect => {
                debug!("[{}, {}] server disconnected", &self.conn_ctx, &received.ctx);
                self.state = State::Ended;
                None
            }
            body => {
                warn!(
                    "[{}, {}] ignoring unexpected message type {}",
                    &self.conn_ctx,
                    &received.ctx,
                    body.message_type()
                );
                None
            }
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> futures::Stream for Session<T> {
    type Item = Result<Packet, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match this.state {
                State::Open => {}
                State::Ended => return Poll::Ready(None),
                State::Failed => {
                    return Poll::Ready(Some(Err(wrap!(ErrorInt::FailedPrecondition(
                        "session already failed".to_owned()
                    )))))
                }
            }
            let received = match futures::ready!(this.framed.poll_next_unpin(cx)) {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    this.state = State::Failed;
                    return Poll::Ready(Some(Err(read_error(this.conn_ctx, &this.framed, e))));
                }
                None => {
                    debug!("[{}] connection closed", &this.conn_ctx);
                    this.state = State::Ended;
                    return Poll::Ready(None);
                }
            };
            if let Some(item) = this.handle_message(received) {
                return Poll::Ready(Some(item));
            }
        }
    }
}

/// Runs the login exchange through the connect reply.
async fn login<T: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<T, Codec>,
    conn_ctx: &ConnectionContext,
    options: SessionOptions,
) -> Result<ConnectReply, Error> {
    let mut handshake = Handshake::new(options);
    framed
        .send(handshake.start())
        .await
        .map_err(|e| write_error(*conn_ctx, e))?;
    loop {
        let received = match framed.next().await {
            Some(Ok(m)) => m,
            Some(Err(e)) => return Err(read_error(*conn_ctx, framed, e)),
            None => bail!(ErrorInt::DsReadError {
                conn_ctx: *conn_ctx,
                msg_ctx: eof_ctx(framed),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during login",
                ),
            }),
        };
        match handshake.handle(&received.msg) {
            Ok(Step::Send(m)) => framed
                .send(m)
                .await
                .map_err(|e| write_error(*conn_ctx, e))?,
            Ok(Step::Wait) => {}
            Ok(Step::Established { reply, request }) => {
                framed
                    .send(request)
                    .await
                    .map_err(|e| write_error(*conn_ctx, e))?;
                return Ok(reply);
            }
            Err(Failure::Rejected(reason)) => bail!(ErrorInt::ConnectRejected {
                conn_ctx: *conn_ctx,
                reason,
            }),
            Err(Failure::Unexpected { message_type }) => bail!(ErrorInt::DsFramingError {
                conn_ctx: *conn_ctx,
                msg_ctx: received.ctx,
                description: format!("unexpected message type {message_type} during login"),
            }),
        }
    }
}

fn eof_ctx<T>(framed: &Framed<T, Codec>) -> MessageContext {
    MessageContext {
        pos: framed.codec().read_pos + crate::to_u64(framed.read_buffer().len()),
        received_wall: WallTime::now(),
    }
}

fn read_error<T>(conn_ctx: ConnectionContext, framed: &Framed<T, Codec>, e: CodecError) -> Error {
    wrap!(match e {
        CodecError::IoError(source) => ErrorInt::DsReadError {
            conn_ctx,
            msg_ctx: eof_ctx(framed),
            source,
        },
        CodecError::ParseError { description, pos } => ErrorInt::DsFramingError {
            conn_ctx,
            msg_ctx: MessageContext {
                pos,
                received_wall: WallTime::now(),
            },
            description,
        },
    })
}

fn write_error(conn_ctx: ConnectionContext, e: CodecError) -> Error {
    wrap!(match e {
        CodecError::IoError(source) => ErrorInt::WriteError { conn_ctx, source },
        CodecError::ParseError { description, .. } => ErrorInt::WriteError {
            conn_ctx,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, description),
        },
    })
}
