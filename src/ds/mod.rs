// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Digital Sprite protocol client.
//!
//! A session logs in (see [`handshake`]), requests live or recorded pictures,
//! then receives one JFIF image per message. Connect with [`Session::connect`]
//! on a `ds://host[:port]` URL, or hand an existing transport to
//! [`Session::handshake`].

pub mod auth;
pub(crate) mod codec;
pub mod handshake;
pub mod msg;
pub mod pic;
pub mod session;

pub use auth::Credentials;
pub use codec::ReceivedMessage;
pub use handshake::{SessionOptions, StreamRequest};
pub use pic::DsFrameData;
pub use session::Session;
