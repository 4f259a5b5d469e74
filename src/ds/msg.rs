// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Digital Sprite messages.
//!
//! Every message is a 28-byte [`Header`] followed by `length` bytes of body.
//! All integers are big-endian. Bodies are decoded field by field:
//!
//! | message               | bytes | layout                                                        |
//! |-----------------------|-------|---------------------------------------------------------------|
//! | [`ClientConnect`]     | 104   | udp_port, connect_type, username\[30\], password\[64\], pad\[2\] |
//! | [`ConnectReject`]     | 24    | reason, timestamp, mac\[6\], pad\[2\], app_version, min_viewing_time |
//! | [`ConnectReply`]      | 560   | num_cameras, viewable/telemetry/failed masks, max_msg_interval, timestamp, titles\[16\]\[32\], unit_type, app_version, video_standard, mac\[6\], pad\[2\], min_viewing_time |
//! | [`LiveRequest`]       | 8     | camera_mask, resolution                                       |
//! | [`PlayRequest`]       | 20    | camera_mask, mode, pace, from_time, to_time                   |

use std::fmt::Display;

use bytes::{Buf, BufMut, Bytes};

use crate::codec::pic::{get_latin1, put_latin1};

pub const HEADER_SIZE: usize = 28;
pub const MAGIC: u32 = 0xFACE_D0FF;
pub const VERSION: u32 = 1;

pub const USERNAME_SIZE: usize = 30;
pub const PASSWORD_SIZE: usize = 64;
pub const TITLE_SIZE: usize = 32;
pub const MAX_CAMERAS: usize = 16;

const CLIENT_CONNECT_SIZE: usize = 104;
const CONNECT_REJECT_SIZE: usize = 24;
const CONNECT_REPLY_SIZE: usize = 560;
const LIVE_REQUEST_SIZE: usize = 8;
const PLAY_REQUEST_SIZE: usize = 20;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    Invalid = 0,
    CliConnect = 1,
    SrvConnectReject = 2,
    SrvConnectReply = 3,
    CliImgLiveRequest = 4,
    CliImgPlayRequest = 5,
    SrvImgData = 6,
    SrvNudge = 7,
    SrvDisconnect = 8,
    CliDisconnect = 16,
}

impl MessageType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => MessageType::Invalid,
            1 => MessageType::CliConnect,
            2 => MessageType::SrvConnectReject,
            3 => MessageType::SrvConnectReply,
            4 => MessageType::CliImgLiveRequest,
            5 => MessageType::CliImgPlayRequest,
            6 => MessageType::SrvImgData,
            7 => MessageType::SrvNudge,
            8 => MessageType::SrvDisconnect,
            16 => MessageType::CliDisconnect,
            _ => return None,
        })
    }
}

/// The fixed header of every message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,

    /// Length of the body which follows.
    pub length: u32,
    pub channel_id: u32,
    pub sequence: u32,
    pub version: u32,
    pub checksum: u32,
    pub message_type: u32,
}

impl Header {
    /// Decodes a header without validating it.
    pub fn decode(mut b: &[u8]) -> Result<Self, String> {
        if b.len() < HEADER_SIZE {
            return Err(format!("header needs {HEADER_SIZE} bytes; have {}", b.len()));
        }
        Ok(Header {
            magic: b.get_u32(),
            length: b.get_u32(),
            channel_id: b.get_u32(),
            sequence: b.get_u32(),
            version: b.get_u32(),
            checksum: b.get_u32(),
            message_type: b.get_u32(),
        })
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.magic);
        out.put_u32(self.length);
        out.put_u32(self.channel_id);
        out.put_u32(self.sequence);
        out.put_u32(self.version);
        out.put_u32(self.checksum);
        out.put_u32(self.message_type);
    }
}

fn need(b: &[u8], size: usize, what: &str) -> Result<(), String> {
    if b.len() < size {
        return Err(format!("{what} needs {size} bytes; have {}", b.len()));
    }
    Ok(())
}

fn get_mac(b: &mut &[u8]) -> [u8; 6] {
    let mut mac = [0; 6];
    b.copy_to_slice(&mut mac);
    b.advance(2);
    mac
}

fn put_mac<B: BufMut>(out: &mut B, mac: &[u8; 6]) {
    out.put_slice(mac);
    out.put_bytes(0, 2);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConnect {
    pub udp_port: u32,
    pub connect_type: u32,
    pub username: String,

    /// Empty, or the digest computed by [`super::auth::password_digest`].
    pub password: String,
}

impl ClientConnect {
    pub fn decode(mut b: &[u8]) -> Result<Self, String> {
        need(b, CLIENT_CONNECT_SIZE, "client connect")?;
        let m = ClientConnect {
            udp_port: b.get_u32(),
            connect_type: b.get_u32(),
            username: get_latin1(&mut b, USERNAME_SIZE),
            password: get_latin1(&mut b, PASSWORD_SIZE),
        };
        Ok(m)
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.udp_port);
        out.put_u32(self.connect_type);
        put_latin1(out, &self.username, USERNAME_SIZE);
        put_latin1(out, &self.password, PASSWORD_SIZE);
        out.put_bytes(0, 2);
    }
}

/// Why a server refused a login.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// All connections are in use.
    Busy,

    /// The user isn't known.
    InvalidUser,

    /// Retry with a password digest.
    AuthRequired,

    /// The password digest didn't match.
    AuthInvalid,
    Other(i32),
}

impl RejectReason {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => RejectReason::Busy,
            2 => RejectReason::InvalidUser,
            3 => RejectReason::AuthRequired,
            4 => RejectReason::AuthInvalid,
            o => RejectReason::Other(o),
        }
    }

    pub fn to_i32(self) -> i32 {
        match self {
            RejectReason::Busy => 1,
            RejectReason::InvalidUser => 2,
            RejectReason::AuthRequired => 3,
            RejectReason::AuthInvalid => 4,
            RejectReason::Other(o) => o,
        }
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Busy => f.write_str("server busy"),
            RejectReason::InvalidUser => f.write_str("invalid user"),
            RejectReason::AuthRequired => f.write_str("authentication required"),
            RejectReason::AuthInvalid => f.write_str("authentication failed"),
            RejectReason::Other(o) => write!(f, "reason {o}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectReject {
    pub reason: RejectReason,

    /// Seeds the password digest.
    pub timestamp: u32,
    pub mac: [u8; 6],
    pub app_version: u32,
    pub min_viewing_time: u32,
}

impl ConnectReject {
    pub fn decode(mut b: &[u8]) -> Result<Self, String> {
        need(b, CONNECT_REJECT_SIZE, "connect reject")?;
        Ok(ConnectReject {
            reason: RejectReason::from_i32(b.get_i32()),
            timestamp: b.get_u32(),
            mac: get_mac(&mut b),
            app_version: b.get_u32(),
            min_viewing_time: b.get_u32(),
        })
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_i32(self.reason.to_i32());
        out.put_u32(self.timestamp);
        put_mac(out, &self.mac);
        out.put_u32(self.app_version);
        out.put_u32(self.min_viewing_time);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectReply {
    pub num_cameras: u32,
    pub viewable_cam_mask: u32,
    pub telemetry_cam_mask: u32,
    pub failed_cam_mask: u32,

    /// Longest the server will go without sending anything, in seconds.
    pub max_msg_interval: u32,
    pub timestamp: u32,

    /// Indexed by camera number minus one.
    pub camera_titles: Vec<String>,
    pub unit_type: u32,
    pub app_version: u32,
    pub video_standard: u32,
    pub mac: [u8; 6],
    pub min_viewing_time: u32,
}

impl ConnectReply {
    pub fn decode(mut b: &[u8]) -> Result<Self, String> {
        need(b, CONNECT_REPLY_SIZE, "connect reply")?;
        Ok(ConnectReply {
            num_cameras: b.get_u32(),
            viewable_cam_mask: b.get_u32(),
            telemetry_cam_mask: b.get_u32(),
            failed_cam_mask: b.get_u32(),
            max_msg_interval: b.get_u32(),
            timestamp: b.get_u32(),
            camera_titles: (0..MAX_CAMERAS)
                .map(|_| get_latin1(&mut b, TITLE_SIZE))
                .collect(),
            unit_type: b.get_u32(),
            app_version: b.get_u32(),
            video_standard: b.get_u32(),
            mac: get_mac(&mut b),
            min_viewing_time: b.get_u32(),
        })
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.num_cameras);
        out.put_u32(self.viewable_cam_mask);
        out.put_u32(self.telemetry_cam_mask);
        out.put_u32(self.failed_cam_mask);
        out.put_u32(self.max_msg_interval);
        out.put_u32(self.timestamp);
        for i in 0..MAX_CAMERAS {
            let title = self.camera_titles.get(i).map_or("", String::as_str);
            put_latin1(out, title, TITLE_SIZE);
        }
        out.put_u32(self.unit_type);
        out.put_u32(self.app_version);
        out.put_u32(self.video_standard);
        put_mac(out, &self.mac);
        out.put_u32(self.min_viewing_time);
    }

    /// Returns the title of camera `cam` (one-based), if the server named it.
    pub fn camera_title(&self, cam: i32) -> Option<&str> {
        let i = usize::try_from(cam).ok()?.checked_sub(1)?;
        self.camera_titles
            .get(i)
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }
}

/// Requested picture size.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Full = 1,
    Half = 2,
    Quarter = 3,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveRequest {
    /// Bit `n` requests camera `n + 1`.
    pub camera_mask: u32,
    pub resolution: u32,
}

impl LiveRequest {
    pub fn decode(mut b: &[u8]) -> Result<Self, String> {
        need(b, LIVE_REQUEST_SIZE, "live request")?;
        Ok(LiveRequest {
            camera_mask: b.get_u32(),
            resolution: b.get_u32(),
        })
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.camera_mask);
        out.put_u32(self.resolution);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlayMode {
    Stop = 0,
    Play = 1,
    Reverse = 2,
    StepForward = 3,
    StepBack = 4,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayRequest {
    pub camera_mask: u32,
    pub mode: u32,

    /// Playback speed in percent.
    pub pace: u32,

    /// Seconds since the Unix epoch.
    pub from_time: u32,
    pub to_time: u32,
}

impl PlayRequest {
    pub fn decode(mut b: &[u8]) -> Result<Self, String> {
        need(b, PLAY_REQUEST_SIZE, "play request")?;
        Ok(PlayRequest {
            camera_mask: b.get_u32(),
            mode: b.get_u32(),
            pace: b.get_u32(),
            from_time: b.get_u32(),
            to_time: b.get_u32(),
        })
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.camera_mask);
        out.put_u32(self.mode);
        out.put_u32(self.pace);
        out.put_u32(self.from_time);
        out.put_u32(self.to_time);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    ClientConnect(ClientConnect),
    ConnectReject(ConnectReject),
    ConnectReply(ConnectReply),
    LiveRequest(LiveRequest),
    PlayRequest(PlayRequest),

    /// A JFIF image carrying a telemetry segment.
    ImgData(Bytes),
    Nudge,
    SrvDisconnect,
    CliDisconnect,
    Unknown { message_type: u32, body: Bytes },
}

impl Body {
    pub fn message_type(&self) -> u32 {
        (match self {
            Body::ClientConnect(_) => MessageType::CliConnect,
            Body::ConnectReject(_) => MessageType::SrvConnectReject,
            Body::ConnectReply(_) => MessageType::SrvConnectReply,
            Body::LiveRequest(_) => MessageType::CliImgLiveRequest,
            Body::PlayRequest(_) => MessageType::CliImgPlayRequest,
            Body::ImgData(_) => MessageType::SrvImgData,
            Body::Nudge => MessageType::SrvNudge,
            Body::SrvDisconnect => MessageType::SrvDisconnect,
            Body::CliDisconnect => MessageType::CliDisconnect,
            Body::Unknown { message_type, .. } => return *message_type,
        }) as u32
    }

    /// Decodes the body of a message of type `message_type`.
    pub fn decode(message_type: u32, body: Bytes) -> Result<Self, String> {
        Ok(match MessageType::from_u32(message_type) {
            Some(MessageType::CliConnect) => Body::ClientConnect(ClientConnect::decode(&body)?),
            Some(MessageType::SrvConnectReject) => {
                Body::ConnectReject(ConnectReject::decode(&body)?)
            }
            Some(MessageType::SrvConnectReply) => Body::ConnectReply(ConnectReply::decode(&body)?),
            Some(MessageType::CliImgLiveRequest) => Body::LiveRequest(LiveRequest::decode(&body)?),
            Some(MessageType::CliImgPlayRequest) => Body::PlayRequest(PlayRequest::decode(&body)?),
            Some(MessageType::SrvImgData) => Body::ImgData(body),
            Some(MessageType::SrvNudge) => Body::Nudge,
            Some(MessageType::SrvDisconnect) => Body::SrvDisconnect,
            Some(MessageType::CliDisconnect) => Body::CliDisconnect,
            Some(MessageType::Invalid) | None => Body::Unknown { message_type, body },
        })
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        match self {
            Body::ClientConnect(m) => m.encode(out),
            Body::ConnectReject(m) => m.encode(out),
            Body::ConnectReply(m) => m.encode(out),
            Body::LiveRequest(m) => m.encode(out),
            Body::PlayRequest(m) => m.encode(out),
            Body::ImgData(b) | Body::Unknown { body: b, .. } => out.put_slice(b),
            Body::Nudge | Body::SrvDisconnect | Body::CliDisconnect => {}
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Body::ClientConnect(_) => CLIENT_CONNECT_SIZE,
            Body::ConnectReject(_) => CONNECT_REJECT_SIZE,
            Body::ConnectReply(_) => CONNECT_REPLY_SIZE,
            Body::LiveRequest(_) => LIVE_REQUEST_SIZE,
            Body::PlayRequest(_) => PLAY_REQUEST_SIZE,
            Body::ImgData(b) | Body::Unknown { body: b, .. } => b.len(),
            Body::Nudge | Body::SrvDisconnect | Body::CliDisconnect => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel_id: u32,
    pub body: Body,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Message {
            channel_id: 0,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header() {
        let h = Header {
            magic: MAGIC,
            length: 104,
            channel_id: 2,
            sequence: 7,
            version: VERSION,
            checksum: 0,
            message_type: MessageType::CliConnect as u32,
        };
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..8], b"\xfa\xce\xd0\xff\x00\x00\x00\x68");
        assert_eq!(&buf[24..], &[0, 0, 0, 1]);
        assert_eq!(Header::decode(&buf).unwrap(), h);
        Header::decode(&buf[..27]).unwrap_err();
    }

    #[test]
    fn body_sizes() {
        let bodies = [
            Body::ClientConnect(ClientConnect {
                udp_port: 0,
                connect_type: 0,
                username: "admin".to_owned(),
                password: String::new(),
            }),
            Body::ConnectReject(ConnectReject {
                reason: RejectReason::AuthRequired,
                timestamp: 1,
                mac: [0, 1, 2, 3, 4, 5],
                app_version: 2,
                min_viewing_time: 3,
            }),
            Body::ConnectReply(ConnectReply {
                num_cameras: 2,
                viewable_cam_mask: 3,
                telemetry_cam_mask: 3,
                failed_cam_mask: 0,
                max_msg_interval: 30,
                timestamp: 9,
                camera_titles: vec!["Gate".to_owned(), "Yard".to_owned()],
                unit_type: 1,
                app_version: 2,
                video_standard: 0,
                mac: [6; 6],
                min_viewing_time: 0,
            }),
            Body::LiveRequest(LiveRequest {
                camera_mask: 1,
                resolution: Resolution::Full as u32,
            }),
            Body::PlayRequest(PlayRequest {
                camera_mask: 1,
                mode: PlayMode::Play as u32,
                pace: 100,
                from_time: 10,
                to_time: 20,
            }),
        ];
        for b in bodies {
            let mut buf = Vec::new();
            b.encode(&mut buf);
            assert_eq!(buf.len(), b.encoded_len(), "{b:?}");
            let decoded = Body::decode(b.message_type(), Bytes::from(buf)).unwrap();
            if let Body::ConnectReply(r) = &decoded {
                assert_eq!(r.camera_titles.len(), MAX_CAMERAS);
                assert_eq!(r.camera_title(2), Some("Yard"));
                assert_eq!(r.camera_title(3), None);
                assert_eq!(r.camera_title(0), None);
            } else {
                assert_eq!(decoded, b);
            }
        }
    }

    #[test]
    fn reject_layout() {
        let raw = b"\x00\x00\x00\x03\x5e\x6e\x1a\x28\x00\x0e\xa5\x01\x02\x03\x00\x00\x00\x00\x00\x02\x00\x00\x00\x05";
        let r = ConnectReject::decode(raw).unwrap();
        assert_eq!(r.reason, RejectReason::AuthRequired);
        assert_eq!(r.timestamp, 0x5e6e_1a28);
        assert_eq!(r.mac, [0x00, 0x0e, 0xa5, 0x01, 0x02, 0x03]);
        assert_eq!(r.app_version, 2);
        assert_eq!(r.min_viewing_time, 5);
        assert_eq!(RejectReason::from_i32(42), RejectReason::Other(42));
        assert_eq!(RejectReason::Other(42).to_string(), "reason 42");
    }

    #[test]
    fn short_bodies() {
        assert!(ConnectReply::decode(&[0; 559]).is_err());
        assert!(Body::decode(MessageType::CliImgPlayRequest as u32, Bytes::from_static(&[0; 19])).is_err());
        assert_eq!(
            Body::decode(99, Bytes::from_static(b"x")).unwrap(),
            Body::Unknown {
                message_type: 99,
                body: Bytes::from_static(b"x")
            }
        );
    }
}
