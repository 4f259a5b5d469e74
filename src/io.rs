// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Buffered blocking byte source shared by the demultiplexers.
//!
//! Live NetVu feeds are read from sockets that may time out or report
//! `WouldBlock` between frames; [`RetryPolicy`] bounds how long the reader
//! keeps trying before giving up.

use std::io::{ErrorKind as IoErrorKind, Read};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::trace;

const READ_CHUNK: usize = 16 * 1024;

/// Bounded retry for transient read failures (`WouldBlock`, `TimedOut`).
///
/// `Interrupted` is always retried immediately and doesn't count as an attempt.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Fails on the first transient error.
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn initial_backoff(self, initial_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            ..self
        }
    }

    pub fn max_backoff(self, max_backoff: Duration) -> Self {
        Self {
            max_backoff,
            ..self
        }
    }

    /// Returns the delay before retry number `attempt` (zero-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Decides whether `e` should be retried, sleeping first if so.
    fn wait(&self, e: &std::io::Error, attempt: &mut u32) -> bool {
        match e.kind() {
            IoErrorKind::Interrupted => true,
            IoErrorKind::WouldBlock | IoErrorKind::TimedOut if *attempt < self.max_attempts => {
                let delay = self.backoff(*attempt);
                *attempt += 1;
                trace!(
                    "read attempt {}/{} failed with {}; retrying in {:?}",
                    *attempt,
                    self.max_attempts,
                    e,
                    delay
                );
                std::thread::sleep(delay);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ReadError {
    /// The input ended after `got` of `wanted` bytes.
    Eof { wanted: usize, got: usize },

    Io(std::io::Error),

    OutOfMemory(usize),

    /// No terminator within `limit` bytes.
    TooLong { limit: usize },
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        ReadError::Io(e)
    }
}

/// A buffered reader which tracks its byte position.
pub struct Reader<R> {
    inner: R,
    buf: BytesMut,

    /// Number of bytes handed out (drained from `buf` or read directly).
    pos: u64,
    eof: bool,
    retry: RetryPolicy,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R, retry: RetryPolicy) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            pos: 0,
            eof: false,
            retry,
        }
    }

    /// Returns the number of bytes consumed so far.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Appends one read's worth of data to `buf`. Returns 0 at end of input.
    fn fill_once(&mut self) -> Result<usize, std::io::Error> {
        let mut attempt = 0;
        loop {
            let len = self.buf.len();
            self.buf.resize(len + READ_CHUNK, 0);
            match self.inner.read(&mut self.buf[len..]) {
                Ok(n) => {
                    self.buf.truncate(len + n);
                    if n == 0 {
                        self.eof = true;
                    }
                    return Ok(n);
                }
                Err(e) => {
                    self.buf.truncate(len);
                    if !self.retry.wait(&e, &mut attempt) {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn fill_to(&mut self, want: usize) -> Result<(), std::io::Error> {
        while self.buf.len() < want && !self.eof {
            self.fill_once()?;
        }
        Ok(())
    }

    /// Returns true if no bytes remain.
    pub(crate) fn at_eof(&mut self) -> Result<bool, std::io::Error> {
        self.fill_to(1)?;
        Ok(self.buf.is_empty())
    }

    /// Returns up to `n` upcoming bytes without consuming them. Fewer are
    /// returned only at end of input.
    pub(crate) fn peek(&mut self, n: usize) -> Result<&[u8], std::io::Error> {
        self.fill_to(n)?;
        let n = n.min(self.buf.len());
        Ok(&self.buf[..n])
    }

    /// Appends exactly `n` bytes to `dst`.
    ///
    /// The space is reserved up front so an absurd declared size is reported
    /// as [`ReadError::OutOfMemory`] rather than aborting. On a short read,
    /// `dst` keeps whatever was read.
    pub(crate) fn read_into(&mut self, dst: &mut Vec<u8>, n: usize) -> Result<(), ReadError> {
        dst.try_reserve_exact(n)
            .map_err(|_| ReadError::OutOfMemory(n))?;
        let from_buf = n.min(self.buf.len());
        dst.extend_from_slice(&self.buf[..from_buf]);
        self.buf.advance(from_buf);
        self.pos += crate::to_u64(from_buf);
        let mut remaining = n - from_buf;
        let mut attempt = 0;
        while remaining > 0 {
            if self.eof {
                return Err(ReadError::Eof {
                    wanted: n,
                    got: n - remaining,
                });
            }
            let start = dst.len();
            dst.resize(start + remaining, 0);
            match self.inner.read(&mut dst[start..]) {
                Ok(0) => {
                    dst.truncate(start);
                    self.eof = true;
                }
                Ok(k) => {
                    dst.truncate(start + k);
                    remaining -= k;
                    self.pos += crate::to_u64(k);
                    attempt = 0;
                }
                Err(e) => {
                    dst.truncate(start);
                    if !self.retry.wait(&e, &mut attempt) {
                        return Err(ReadError::Io(e));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn read_vec(&mut self, n: usize) -> Result<Vec<u8>, ReadError> {
        let mut v = Vec::new();
        self.read_into(&mut v, n)?;
        Ok(v)
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<Bytes, ReadError> {
        if n <= self.buf.len() {
            self.pos += crate::to_u64(n);
            return Ok(self.buf.split_to(n).freeze());
        }
        self.read_vec(n).map(Bytes::from)
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ReadError> {
        self.fill_to(N)?;
        if self.buf.len() < N {
            return Err(ReadError::Eof {
                wanted: N,
                got: self.buf.len(),
            });
        }
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        self.pos += crate::to_u64(N);
        Ok(out)
    }

    /// Discards exactly `n` bytes.
    pub(crate) fn skip(&mut self, n: usize) -> Result<(), ReadError> {
        let mut remaining = n;
        while remaining > 0 {
            self.fill_to(1)?;
            if self.buf.is_empty() {
                return Err(ReadError::Eof {
                    wanted: n,
                    got: n - remaining,
                });
            }
            let k = remaining.min(self.buf.len());
            self.buf.advance(k);
            self.pos += crate::to_u64(k);
            remaining -= k;
        }
        Ok(())
    }

    /// Reads through the next `\n`, returning the line with its terminator.
    ///
    /// At end of input, returns any unterminated remainder, then `None`.
    pub(crate) fn read_line(&mut self, max_len: usize) -> Result<Option<Bytes>, ReadError> {
        match self.read_until(b"\n", max_len) {
            Ok(line) => Ok(Some(line)),
            Err(ReadError::Eof { .. }) if self.buf.is_empty() => Ok(None),
            Err(ReadError::Eof { .. }) => {
                let n = self.buf.len();
                self.pos += crate::to_u64(n);
                Ok(Some(self.buf.split_to(n).freeze()))
            }
            Err(e) => Err(e),
        }
    }

    /// Reads through the first occurrence of `pattern`, returning everything
    /// consumed including the pattern.
    ///
    /// Fails with [`ReadError::TooLong`] if `pattern` doesn't appear within
    /// `limit` bytes; nothing is consumed in that case.
    pub(crate) fn read_until(&mut self, pattern: &[u8], limit: usize) -> Result<Bytes, ReadError> {
        debug_assert!(!pattern.is_empty());
        let mut scanned = 0;
        loop {
            let found = self.buf[scanned.min(self.buf.len())..]
                .windows(pattern.len())
                .position(|w| w == pattern);
            if let Some(i) = found {
                let end = scanned + i + pattern.len();
                if end > limit {
                    return Err(ReadError::TooLong { limit });
                }
                self.pos += crate::to_u64(end);
                return Ok(self.buf.split_to(end).freeze());
            }
            if self.buf.len() >= limit {
                return Err(ReadError::TooLong { limit });
            }
            scanned = (self.buf.len() + 1).saturating_sub(pattern.len());
            if self.eof || self.fill_once()? == 0 {
                return Err(ReadError::Eof {
                    wanted: self.buf.len() + 1,
                    got: self.buf.len(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;

    /// Hands out one scripted result per `read` call.
    struct Script(VecDeque<Result<&'static [u8], IoErrorKind>>);

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(Err(k)) => Err(std::io::Error::from(k)),
                Some(Ok(chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.0.push_front(Ok(&chunk[n..]));
                    }
                    Ok(n)
                }
            }
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default()
            .max_attempts(3)
            .initial_backoff(Duration::from_millis(1))
    }

    #[test]
    fn lines_split_across_reads() {
        let script = Script(
            vec![
                Ok(&b"Content-len"[..]),
                Ok(&b"gth: 4\r\n\r"[..]),
                Ok(&b"\nbody"[..]),
            ]
            .into(),
        );
        let mut r = Reader::new(script, RetryPolicy::never());
        assert_eq!(
            &r.read_line(100).unwrap().unwrap()[..],
            b"Content-length: 4\r\n"
        );
        assert_eq!(&r.read_line(100).unwrap().unwrap()[..], b"\r\n");
        assert_eq!(r.pos(), 21);
        assert_eq!(&r.read_line(100).unwrap().unwrap()[..], b"body");
        assert!(r.read_line(100).unwrap().is_none());
        assert_eq!(r.pos(), 25);
    }

    #[test]
    fn transient_errors_retried() {
        let script = Script(
            vec![
                Err(IoErrorKind::WouldBlock),
                Err(IoErrorKind::Interrupted),
                Err(IoErrorKind::TimedOut),
                Ok(&b"abcdef"[..]),
            ]
            .into(),
        );
        let mut r = Reader::new(script, fast_retry());
        assert_eq!(&r.read_bytes(6).unwrap()[..], b"abcdef");
        assert!(r.at_eof().unwrap());
    }

    #[test]
    fn retry_bound_exceeded() {
        let script = Script(vec![Err(IoErrorKind::WouldBlock); 4].into());
        let mut r = Reader::new(script, fast_retry());
        match r.read_array::<4>() {
            Err(ReadError::Io(e)) => assert_eq!(e.kind(), IoErrorKind::WouldBlock),
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn short_read_reports_progress() {
        let script = Script(vec![Ok(&b"abc"[..])].into());
        let mut r = Reader::new(script, RetryPolicy::never());
        match r.read_bytes(10) {
            Err(ReadError::Eof { wanted: 10, got: 3 }) => {}
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn absurd_size_is_out_of_memory() {
        let mut r = Reader::new(&b""[..], RetryPolicy::never());
        match r.read_vec(usize::MAX) {
            Err(ReadError::OutOfMemory(n)) => assert_eq!(n, usize::MAX),
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn read_until_marker() {
        let script = Script(vec![Ok(&b"\xff\xd8\x00\xff"[..]), Ok(&b"\xd9tail"[..])].into());
        let mut r = Reader::new(script, RetryPolicy::never());
        let jpeg = r.read_until(b"\xff\xd9", 64).unwrap();
        assert_eq!(&jpeg[..], b"\xff\xd8\x00\xff\xd9");
        assert_eq!(&r.peek(4).unwrap()[..], b"tail");
    }

    #[test]
    fn read_until_limit() {
        let mut r = Reader::new(&b"0123456789\xff\xd9"[..], RetryPolicy::never());
        assert!(matches!(
            r.read_until(b"\xff\xd9", 8),
            Err(ReadError::TooLong { limit: 8 })
        ));
        assert_eq!(r.pos(), 0);
    }
}
