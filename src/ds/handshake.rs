// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Login and stream request, independent of any transport.
//!
//! The client sends a [`ClientConnect`] with an empty password. A server
//! which wants authentication rejects it with
//! [`RejectReason::AuthRequired`], supplying the seeds for
//! [`password_digest`]; the client retries once with the digest. A
//! [`ConnectReply`] completes the login, and the client follows it with the
//! configured live or playback request.

use std::time::Duration;

use log::debug;

use super::auth::{password_digest, Credentials};
use super::msg::{
    Body, ClientConnect, ConnectReply, LiveRequest, Message, PlayMode, PlayRequest, RejectReason,
    Resolution,
};

/// What to ask the server to send once logged in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamRequest {
    Live {
        /// Bit `n` requests camera `n + 1`.
        camera_mask: u32,
        resolution: Resolution,
    },
    Playback {
        camera_mask: u32,
        mode: PlayMode,

        /// Speed in percent.
        pace: u32,

        /// Seconds since the Unix epoch.
        from_time: u32,
        to_time: u32,
    },
}

impl Default for StreamRequest {
    fn default() -> Self {
        StreamRequest::Live {
            camera_mask: 1,
            resolution: Resolution::Full,
        }
    }
}

impl StreamRequest {
    fn to_message(&self) -> Message {
        Message::new(match *self {
            StreamRequest::Live {
                camera_mask,
                resolution,
            } => Body::LiveRequest(LiveRequest {
                camera_mask,
                resolution: resolution as u32,
            }),
            StreamRequest::Playback {
                camera_mask,
                mode,
                pace,
                from_time,
                to_time,
            } => Body::PlayRequest(PlayRequest {
                camera_mask,
                mode: mode as u32,
                pace,
                from_time,
                to_time,
            }),
        })
    }
}

/// Options for a Digital Sprite session.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    creds: Option<Credentials>,
    request: StreamRequest,
    udp_port: u32,
    connect_type: u32,
    login_timeout: Option<Duration>,
}

impl SessionOptions {
    /// Uses the given credentials when the server asks for authentication.
    pub fn creds(mut self, creds: Option<Credentials>) -> Self {
        self.creds = creds;
        self
    }

    /// Sets the request sent after login; defaults to live, full resolution
    /// camera 1.
    pub fn request(mut self, request: StreamRequest) -> Self {
        self.request = request;
        self
    }

    pub fn udp_port(mut self, udp_port: u32) -> Self {
        self.udp_port = udp_port;
        self
    }

    pub fn connect_type(mut self, connect_type: u32) -> Self {
        self.connect_type = connect_type;
        self
    }

    /// Bounds the time from connecting through the connect reply.
    pub fn login_timeout(mut self, login_timeout: Option<Duration>) -> Self {
        self.login_timeout = login_timeout;
        self
    }

    pub(crate) fn get_login_timeout(&self) -> Option<Duration> {
        self.login_timeout
    }
}

/// The next action after handling a server message.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Send this message and wait for another.
    Send(Message),

    /// Nothing to send; wait for another message.
    Wait,

    /// Logged in. Send `request`; image data follows.
    Established {
        reply: ConnectReply,
        request: Message,
    },
}

/// Why a login failed.
#[derive(Debug, PartialEq, Eq)]
pub enum Failure {
    Rejected(RejectReason),
    Unexpected { message_type: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Start,
    SentLogin,
    SentDigest,
    Done,
}

/// The client side of the login exchange.
#[derive(Debug)]
pub struct Handshake {
    options: SessionOptions,
    state: State,
}

impl Handshake {
    pub fn new(options: SessionOptions) -> Self {
        Handshake {
            options,
            state: State::Start,
        }
    }

    fn connect_message(&self, password: String) -> Message {
        Message::new(Body::ClientConnect(ClientConnect {
            udp_port: self.options.udp_port,
            connect_type: self.options.connect_type,
            username: self
                .options
                .creds
                .as_ref()
                .map(|c| c.username.clone())
                .unwrap_or_default(),
            password,
        }))
    }

    /// Returns the initial login message.
    pub fn start(&mut self) -> Message {
        self.state = State::SentLogin;
        self.connect_message(String::new())
    }

    /// Handles a message received from the server.
    pub fn handle(&mut self, msg: &Message) -> Result<Step, Failure> {
        let unexpected = || Failure::Unexpected {
            message_type: msg.body.message_type(),
        };
        match (&msg.body, self.state) {
            (Body::Nudge, State::SentLogin | State::SentDigest) => Ok(Step::Wait),
            (Body::ConnectReject(r), State::SentLogin)
                if r.reason == RejectReason::AuthRequired =>
            {
                let Some(creds) = self.options.creds.as_ref() else {
                    return Err(Failure::Rejected(r.reason));
                };
                debug!("server requires authentication; sending digest");
                let digest = password_digest(creds, r.timestamp, &r.mac);
                self.state = State::SentDigest;
                Ok(Step::Send(self.connect_message(digest)))
            }
            (Body::ConnectReject(r), State::SentLogin | State::SentDigest) => {
                self.state = State::Done;
                Err(Failure::Rejected(r.reason))
            }
            (Body::ConnectReply(reply), State::SentLogin | State::SentDigest) => {
                self.state = State::Done;
                Ok(Step::Established {
                    reply: reply.clone(),
                    request: self.options.request.to_message(),
                })
            }
            _ => Err(unexpected()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::msg::{ConnectReject, MessageType};
    use crate::ds::pic::tests::reply;

    fn reject(reason: RejectReason) -> Message {
        Message::new(Body::ConnectReject(ConnectReject {
            reason,
            timestamp: 0x5e6e_1a28,
            mac: [0x00, 0x0e, 0xa5, 0x01, 0x02, 0x03],
            app_version: 0,
            min_viewing_time: 0,
        }))
    }

    fn options() -> SessionOptions {
        SessionOptions::default().creds(Some(Credentials {
            username: "admin".to_owned(),
            password: "secret".to_owned(),
        }))
    }

    fn login(m: &Message) -> &ClientConnect {
        match &m.body {
            Body::ClientConnect(c) => c,
            o => panic!("expected login, got {o:?}"),
        }
    }

    #[test]
    fn accept() {
        let mut h = Handshake::new(options().udp_port(5000));
        let first = h.start();
        assert_eq!(login(&first).username, "admin");
        assert_eq!(login(&first).password, "");
        assert_eq!(login(&first).udp_port, 5000);
        assert_eq!(h.handle(&Message::new(Body::Nudge)).unwrap(), Step::Wait);
        match h.handle(&Message::new(Body::ConnectReply(reply()))).unwrap() {
            Step::Established { reply: r, request } => {
                assert_eq!(r, reply());
                assert_eq!(
                    request.body,
                    Body::LiveRequest(LiveRequest {
                        camera_mask: 1,
                        resolution: 1,
                    })
                );
            }
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn auth_required_retry() {
        let request = StreamRequest::Playback {
            camera_mask: 0b110,
            mode: PlayMode::Play,
            pace: 100,
            from_time: 1_584_268_200,
            to_time: 1_584_271_800,
        };
        let mut h = Handshake::new(options().request(request));
        h.start();
        let retry = match h.handle(&reject(RejectReason::AuthRequired)).unwrap() {
            Step::Send(m) => m,
            o => panic!("unexpected {o:?}"),
        };
        assert_eq!(login(&retry).password, "225A5AC4DB5A34C2C47DFC5C98272FE0");
        match h.handle(&Message::new(Body::ConnectReply(reply()))).unwrap() {
            Step::Established { request, .. } => {
                assert_eq!(
                    request.body.message_type(),
                    MessageType::CliImgPlayRequest as u32
                );
            }
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn second_reject() {
        let mut h = Handshake::new(options());
        h.start();
        assert!(matches!(
            h.handle(&reject(RejectReason::AuthRequired)),
            Ok(Step::Send(_))
        ));
        assert_eq!(
            h.handle(&reject(RejectReason::AuthRequired)).unwrap_err(),
            Failure::Rejected(RejectReason::AuthRequired)
        );
    }

    #[test]
    fn auth_required_without_creds() {
        let mut h = Handshake::new(SessionOptions::default());
        assert_eq!(login(&h.start()).username, "");
        assert_eq!(
            h.handle(&reject(RejectReason::AuthRequired)).unwrap_err(),
            Failure::Rejected(RejectReason::AuthRequired)
        );
    }

    #[test]
    fn busy() {
        let mut h = Handshake::new(options());
        h.start();
        assert_eq!(
            h.handle(&reject(RejectReason::Busy)).unwrap_err(),
            Failure::Rejected(RejectReason::Busy)
        );
    }

    #[test]
    fn unexpected_message() {
        let mut h = Handshake::new(options());
        h.start();
        assert_eq!(
            h.handle(&Message::new(Body::SrvDisconnect)).unwrap_err(),
            Failure::Unexpected {
                message_type: MessageType::SrvDisconnect as u32
            }
        );
    }
}
