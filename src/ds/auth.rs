// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Challenge-response password digest.
//!
//! When a server rejects a login with [`super::msg::RejectReason::AuthRequired`],
//! the reject carries a timestamp and the server's MAC address. The client
//! resends the login with the password field set to
//!
//! ```text
//! HEX(MD5(HEX8(timestamp) + HEX(MD5(HEX(mac) + username + password))))
//! ```
//!
//! where `HEX` is uppercase hexadecimal.

use md5::{Digest, Md5};

/// Username and password for a Digital Sprite login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

pub fn password_digest(creds: &Credentials, timestamp: u32, mac: &[u8; 6]) -> String {
    let mut inner = Md5::new();
    inner.update(hex::encode_upper(mac).as_bytes());
    inner.update(creds.username.as_bytes());
    inner.update(creds.password.as_bytes());
    let inner = hex::encode_upper(inner.finalize());

    let mut outer = Md5::new();
    outer.update(format!("{timestamp:08X}").as_bytes());
    outer.update(inner.as_bytes());
    hex::encode_upper(outer.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest() {
        let creds = Credentials {
            username: "admin".to_owned(),
            password: "secret".to_owned(),
        };
        assert_eq!(
            password_digest(&creds, 0x5e6e_1a28, &[0x00, 0x0e, 0xa5, 0x01, 0x02, 0x03]),
            "225A5AC4DB5A34C2C47DFC5C98272FE0"
        );
    }

    #[test]
    fn debug_hides_password() {
        let creds = Credentials {
            username: "admin".to_owned(),
            password: "secret".to_owned(),
        };
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
