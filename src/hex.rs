// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quick wrapper around `pretty-hex` to limit output.
//!
//! Frames run to hundreds of kilobytes, and the interesting bytes are usually
//! at the edges (markers and headers at the front, the EOI marker at the back),
//! so long inputs are shown as a head and a tail.

use pretty_hex::PrettyHex;

pub struct LimitedHex<'a> {
    inner: &'a [u8],
    head: usize,
    tail: usize,
}

impl<'a> LimitedHex<'a> {
    /// Shows at most `max_bytes`, three quarters from the start and the rest
    /// from the end.
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        let head = max_bytes - max_bytes / 4;
        Self {
            inner,
            head,
            tail: max_bytes - head,
        }
    }
}

fn dump(f: &mut std::fmt::Formatter<'_>, data: &[u8]) -> std::fmt::Result {
    write!(
        f,
        "{:#?}",
        data.hex_conf(pretty_hex::HexConfig {
            title: false,
            ..Default::default()
        })
    )
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.len();
        writeln!(f, "Length: {0} (0x{0:x}) bytes", len)?;
        if len <= self.head + self.tail {
            return dump(f, self.inner);
        }
        dump(f, &self.inner[..self.head])?;
        let omitted = len - self.head - self.tail;
        write!(f, "\n...{0} (0x{0:x}) bytes not shown...", omitted)?;
        if self.tail > 0 {
            writeln!(f)?;
            dump(f, &self.inner[len - self.tail..])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn short_input_shown_whole() {
        let s = format!("{:?}", LimitedHex::new(b"\xff\xd8\xff\xd9", 64));
        assert!(s.starts_with("Length: 4 (0x4) bytes\n"));
        assert!(!s.contains("not shown"));
    }

    #[test]
    fn long_input_shows_both_ends() {
        let mut data = vec![0u8; 1000];
        data[0] = 0xff;
        data[1] = 0xd8;
        data[998] = 0xff;
        data[999] = 0xd9;
        let s = format!("{:?}", LimitedHex::new(&data, 64));
        assert!(s.contains("...936 (0x3a8) bytes not shown..."));
        assert!(s.contains("ff d8"));
        assert!(s.contains("ff d9"));
    }
}
