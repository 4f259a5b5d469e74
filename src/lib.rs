// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Frame demultiplexing for AD/NetVu video servers.
//!
//! NetVu servers deliver JPEG, MPEG-4 and H.264 pictures, ADPCM/PCM audio and
//! assorted text/overlay records over a handful of framings:
//!
//! *   [`demux`]: the "adbinary" separator framing, the "admime" server-push
//!     framing, back-to-back raw picture headers, and frames handed over by a
//!     PAR file reader.
//! *   [`ds`]: the Digital Sprite TCP protocol, including its login handshake.
//!
//! Every framing converges on the same [`codec::Packet`], carrying either the
//! recovered [`codec::pic::PictureHeader`], an [`codec::audio::AudioHeader`] or
//! a data-record tag.

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use std::fmt::{Debug, Display};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod error;
mod hex;

pub mod codec;
pub mod demux;
pub mod ds;
pub mod io;
pub mod registry;

#[cfg(test)]
mod testutil;

pub use error::{Error, ErrorKind};

use error::ErrorInt;

/// An annotated media timestamp.
///
/// This couples together three pieces of information:
///
/// *   The stream's starting time: the first timestamp seen on that stream.
/// *   The clock rate: 1000 Hz for video and data records, the sample rate for
///     audio.
/// *   The timestamp as an `i64`, in clock rate units since the Unix epoch as
///     the server reported it.
///
/// In combination, these allow conversion to "normal play time" (NPT): seconds
/// since the start of the stream.
///
/// NetVu servers don't promise monotonic time; a timestamp may well be before
/// the stream's starting point.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    /// A timestamp which must be compared to `start`.
    timestamp: i64,

    /// The clock rate, in Hz. Must be non-zero.
    clock_rate: NonZeroU32,

    /// The stream's starting time.
    start: i64,
}

impl Timestamp {
    /// Creates a new timestamp unless `timestamp - start` underflows.
    #[inline]
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, start: i64) -> Option<Self> {
        timestamp.checked_sub(start).map(|_| Timestamp {
            timestamp,
            clock_rate,
            start,
        })
    }

    /// Returns time since the Unix epoch in clock rate units.
    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns timestamp of the start of the stream.
    #[inline]
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Returns the clock rate, in Hz.
    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Returns elapsed time since the stream start in clock rate units.
    #[inline]
    pub fn elapsed(&self) -> i64 {
        self.timestamp - self.start
    }

    /// Returns elapsed time since the stream start in seconds, aka "normal play
    /// time" (NPT).
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        (self.elapsed() as f64) / (self.clock_rate.get() as f64)
    }

    /// Returns the UTC time this timestamp represents, if in range.
    pub fn to_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let rate = i64::from(self.clock_rate.get());
        let secs = self.timestamp.div_euclid(rate);
        let frac = self.timestamp.rem_euclid(rate);
        let nanos = u32::try_from(frac * 1_000_000_000 / rate).ok()?;
        chrono::DateTime::from_timestamp(secs, nanos)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} Hz), npt {:.03}",
            self.timestamp,
            self.clock_rate,
            self.elapsed_secs()
        )
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// A wall time taken from the local machine's realtime clock, used in error reporting.
///
/// Currently this just allows formatting via `Debug` and `Display`.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// Context of a frame (or read error) within a demultiplexed byte stream.
///
/// `pos` is the byte offset of the frame's first byte. For PAR sources, which
/// hand over whole frames, it's the frame index instead.
#[derive(Copy, Clone, Debug)]
pub struct FrameContext {
    pos: u64,
    received_wall: WallTime,
}

impl FrameContext {
    pub(crate) fn new(pos: u64) -> Self {
        Self {
            pos,
            received_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self::new(0)
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for FrameContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Digital Sprite connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: std::net::SocketAddr,
    peer_addr: std::net::SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within a Digital Sprite connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct MessageContext {
    /// The starting byte position within the input stream. The bottom 32 bits
    /// can be compared to the relative TCP sequence number.
    pos: u64,

    /// Time when the application parsed the message.
    received_wall: WallTime,
}

impl MessageContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            pos: 0,
            received_wall: WallTime::now(),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Converts from `usize` to `u64`, which is lossless on all supported platforms.
#[inline]
pub(crate) fn to_u64(n: usize) -> u64 {
    n as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_elapsed() {
        let rate = NonZeroU32::new(1000).unwrap();
        let ts = Timestamp::new(1_584_268_200_500, rate, 1_584_268_200_000).unwrap();
        assert_eq!(ts.elapsed(), 500);
        assert_eq!(ts.elapsed_secs(), 0.5);
        assert_eq!(format!("{ts}"), "1584268200500 (1000 Hz), npt 0.500");
    }

    #[test]
    fn timestamp_underflow() {
        let rate = NonZeroU32::new(8000).unwrap();
        assert!(Timestamp::new(i64::MIN, rate, 1).is_none());
    }

    #[test]
    fn timestamp_to_utc() {
        let rate = NonZeroU32::new(1000).unwrap();
        let ts = Timestamp::new(1_584_268_200_250, rate, 0).unwrap();
        let utc = ts.to_utc().unwrap();
        assert_eq!(
            utc.format("%FT%T%.3f").to_string(),
            "2020-03-15T10:30:00.250"
        );
    }
}
