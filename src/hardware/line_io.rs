//! Line-oriented I/O helpers shared by the serial, socket and bridge transports.
//!
//! Devices speak ASCII lines terminated by CRLF (a bare LF is accepted too).
//! [`LineBuffer`] assembles lines across partial reads and offers two ways to get
//! one:
//!
//! - [`LineBuffer::try_read_line`] never waits. It polls the transport exactly as far
//!   as it can complete immediately, which is what the poll loop needs.
//! - [`LineBuffer::read_line_until`] waits up to a deadline, which is what a
//!   handshake needs.
//!
//! The buffer does not own the transport, so the same port can be written to
//! between reads.

use crate::error::{AppResult, DaqError};
use futures::FutureExt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

const READ_CHUNK: usize = 1024;

/// Upper bound on bytes kept while waiting for a line terminator.
const MAX_PENDING: usize = 64 * 1024;

/// Result of a non-blocking line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line, terminator stripped
    Line(String),
    /// No complete line available right now
    Empty,
    /// The peer closed the transport
    Closed,
}

/// Accumulates bytes until a full line is available.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet returned as a line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget everything buffered so far.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Return the next line if one can be produced without waiting.
    ///
    /// Lines that are not ASCII are logged and skipped.
    pub fn try_read_line<R>(&mut self, io: &mut R) -> io::Result<ReadOutcome>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(line) = self.take_line() {
                match line {
                    Some(text) => return Ok(ReadOutcome::Line(text)),
                    None => continue,
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            match io.read(&mut chunk).now_or_never() {
                None => return Ok(ReadOutcome::Empty),
                Some(Ok(0)) => return Ok(ReadOutcome::Closed),
                Some(Ok(n)) => self.push(&chunk[..n]),
                Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Empty)
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Wait for the next line until `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes first. A closed transport is
    /// reported as `UnexpectedEof`.
    pub async fn read_line_until<R>(
        &mut self,
        io: &mut R,
        deadline: Instant,
    ) -> io::Result<Option<String>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(line) = self.take_line() {
                match line {
                    Some(text) => return Ok(Some(text)),
                    None => continue,
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            match tokio::time::timeout_at(deadline, io.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "transport closed while waiting for a line",
                    ))
                }
                Ok(Ok(n)) => self.push(&chunk[..n]),
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Read lines until one equals `expected` exactly, or the deadline passes.
    ///
    /// Non-matching lines are discarded. `budget_ms` only feeds the error message.
    pub async fn wait_for_line<R>(
        &mut self,
        io: &mut R,
        expected: &str,
        deadline: Instant,
        budget_ms: u64,
    ) -> AppResult<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            match self.read_line_until(io, deadline).await {
                Ok(Some(line)) if line == expected => return Ok(()),
                Ok(Some(line)) => {
                    tracing::trace!(expected, received = %line, "Skipping line during handshake");
                }
                Ok(None) => {
                    return Err(DaqError::HandshakeTimeout {
                        expected: expected.to_string(),
                        timeout_ms: budget_ms,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(DaqError::SerialUnexpectedEof)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Discard buffered bytes and everything the transport can deliver right now.
    ///
    /// Returns the number of bytes thrown away. Never waits.
    pub fn discard_pending<R>(&mut self, io: &mut R) -> usize
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut total = self.pending.len();
        self.pending.clear();

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match io.read(&mut chunk).now_or_never() {
                Some(Ok(0)) | None => break,
                Some(Ok(n)) => total += n,
                // Errors surface on the next real read
                Some(Err(_)) => break,
            }
        }
        total
    }

    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_PENDING && !self.pending.contains(&b'\n') {
            tracing::warn!(
                bytes = self.pending.len(),
                "No line terminator received, dropping buffered input"
            );
            self.pending.clear();
        }
    }

    /// `None`: no complete line. `Some(None)`: a line that could not be decoded.
    fn take_line(&mut self) -> Option<Option<String>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut raw: Vec<u8> = self.pending.drain(..=end).collect();
        while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
            raw.pop();
        }

        if !raw.is_ascii() {
            tracing::warn!(bytes = raw.len(), "Can't decode text, skipping line");
            return Some(None);
        }
        // ASCII is valid UTF-8
        Some(String::from_utf8(raw).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn try_read_line_never_waits() {
        let (mut host, mut device) = tokio::io::duplex(256);
        let mut lines = LineBuffer::new();

        assert_eq!(lines.try_read_line(&mut device).unwrap(), ReadOutcome::Empty);

        host.write_all(b"first\r\nsec").await.unwrap();
        assert_eq!(
            lines.try_read_line(&mut device).unwrap(),
            ReadOutcome::Line("first".into())
        );
        assert_eq!(lines.try_read_line(&mut device).unwrap(), ReadOutcome::Empty);
        assert_eq!(lines.pending_len(), 3);

        host.write_all(b"ond\n").await.unwrap();
        assert_eq!(
            lines.try_read_line(&mut device).unwrap(),
            ReadOutcome::Line("second".into())
        );
    }

    #[tokio::test]
    async fn closed_transport_is_reported() {
        let (host, mut device) = tokio::io::duplex(64);
        drop(host);

        let mut lines = LineBuffer::new();
        assert_eq!(lines.try_read_line(&mut device).unwrap(), ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn non_ascii_lines_are_skipped() {
        let (mut host, mut device) = tokio::io::duplex(256);
        host.write_all(b"\xff\xfe\r\nok\r\n").await.unwrap();

        let mut lines = LineBuffer::new();
        assert_eq!(
            lines.try_read_line(&mut device).unwrap(),
            ReadOutcome::Line("ok".into())
        );
    }

    #[tokio::test]
    async fn trailing_space_is_preserved() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"CONNECTED \r\n").await.unwrap();

        let mut lines = LineBuffer::new();
        assert_eq!(
            lines.try_read_line(&mut device).unwrap(),
            ReadOutcome::Line("CONNECTED ".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_line_skips_noise_then_times_out() {
        let (mut host, mut device) = tokio::io::duplex(256);
        host.write_all(b"noise\r\n>\r\n").await.unwrap();

        let mut lines = LineBuffer::new();
        let deadline = Instant::now() + Duration::from_millis(600);
        lines
            .wait_for_line(&mut device, ">", deadline, 600)
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_millis(600);
        let err = lines
            .wait_for_line(&mut device, "Start Measurements", deadline, 600)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::HandshakeTimeout { timeout_ms: 600, .. }
        ));
    }

    #[tokio::test]
    async fn read_line_until_waits_for_terminator() {
        use tokio_test::{assert_pending, assert_ready};

        let (mut host, mut device) = tokio::io::duplex(256);
        let mut lines = LineBuffer::new();
        let deadline = Instant::now() + Duration::from_secs(5);

        let mut read = tokio_test::task::spawn(lines.read_line_until(&mut device, deadline));
        assert_pending!(read.poll());

        host.write_all(b"CONNEC").await.unwrap();
        assert!(read.is_woken());
        assert_pending!(read.poll());

        host.write_all(b"TED \r\n").await.unwrap();
        let line = assert_ready!(read.poll()).unwrap();
        assert_eq!(line.as_deref(), Some("CONNECTED "));
    }

    #[tokio::test]
    async fn discard_pending_drops_buffered_and_available_bytes() {
        let (mut host, mut device) = tokio::io::duplex(256);
        host.write_all(b"partial").await.unwrap();

        let mut lines = LineBuffer::new();
        assert_eq!(lines.try_read_line(&mut device).unwrap(), ReadOutcome::Empty);

        host.write_all(b" stale 12345\r\n").await.unwrap();
        let discarded = lines.discard_pending(&mut device);

        assert_eq!(discarded, 21);
        assert_eq!(lines.pending_len(), 0);
        assert_eq!(lines.try_read_line(&mut device).unwrap(), ReadOutcome::Empty);
    }
}
