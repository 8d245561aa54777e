//! Socket-attached devices.
//!
//! These devices push tab-separated ASCII lines over plain TCP (port 80 unless the
//! address names another). There is no arm handshake: `start` and `stop` only
//! check the connection, and every field of a line is kept.

use crate::error::{AppResult, DaqError};
use crate::hardware::line_io::{LineBuffer, ReadOutcome};
use crate::hardware::{DeviceInterface, DeviceKind, PollOutcome, ReferenceClock, SampleMode};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Port used when the address does not carry one.
pub const DEFAULT_SOCKET_PORT: u16 = 80;

/// Budget for establishing a TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Split `host` or `host:port` into its parts, falling back to `default_port`.
pub fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = address.rsplit_once(':') {
        if !host.is_empty() && !host.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
    }
    (address.to_string(), default_port)
}

/// Connect with a hard time budget; an expired budget is a `TimedOut` I/O error.
pub async fn connect_with_timeout(host: &str, port: u16, budget: Duration) -> AppResult<TcpStream> {
    match tokio::time::timeout(budget, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(DaqError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connecting to {host}:{port} timed out"),
        ))),
    }
}

/// Line-oriented TCP device.
pub struct SocketInterface {
    stream: Option<TcpStream>,
    peer: Option<String>,
    lines: LineBuffer,
    mode: SampleMode,
    clock: ReferenceClock,
    connect_timeout: Duration,
}

impl SocketInterface {
    /// Disconnected interface.
    pub fn new(mode: SampleMode) -> Self {
        Self {
            stream: None,
            peer: None,
            lines: LineBuffer::new(),
            mode,
            clock: ReferenceClock::now(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the connect budget.
    pub fn with_connect_timeout(mut self, budget: Duration) -> Self {
        self.connect_timeout = budget;
        self
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.lines.clear();
    }
}

#[async_trait]
impl DeviceInterface for SocketInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Unknown
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn mode(&self) -> SampleMode {
        self.mode
    }

    async fn open(&mut self, port: &str) -> AppResult<()> {
        if self.stream.is_some() {
            self.close().await?;
        }

        let (host, tcp_port) = split_host_port(port, DEFAULT_SOCKET_PORT);
        tracing::debug!(host = %host, port = tcp_port, "Connecting socket device");
        let stream = connect_with_timeout(&host, tcp_port, self.connect_timeout).await?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        self.peer = Some(format!("{host}:{tcp_port}"));
        self.lines.clear();
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        self.lines.clear();
        tracing::debug!(peer = ?self.peer, "Closing socket device");
        // The peer may already be gone
        if let Err(e) = stream.shutdown().await {
            tracing::debug!(peer = ?self.peer, error = %e, "Socket shutdown failed");
        }
        Ok(())
    }

    async fn start(&mut self) -> AppResult<()> {
        if self.stream.is_none() {
            return Err(DaqError::Instrument("socket not connected".to_string()));
        }
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(DaqError::Instrument("socket not connected".to_string()));
        };
        self.lines.discard_pending(stream);
        Ok(())
    }

    async fn set_mode(&mut self, mode: u8) -> AppResult<()> {
        self.mode = SampleMode::try_from(mode)?;
        Ok(())
    }

    async fn poll(&mut self) -> PollOutcome {
        let Some(stream) = self.stream.as_mut() else {
            return PollOutcome::LostConnection;
        };

        match self.lines.try_read_line(stream) {
            Ok(ReadOutcome::Line(line)) if line.is_empty() => PollOutcome::NoData,
            Ok(ReadOutcome::Line(line)) => {
                let fields = line.split('\t').map(str::to_string).collect();
                PollOutcome::Samples(vec![self.clock.stamp(fields)])
            }
            Ok(ReadOutcome::Empty) => PollOutcome::NoData,
            Ok(ReadOutcome::Closed) => {
                tracing::warn!(peer = ?self.peer, "Socket closed by device");
                self.drop_stream();
                PollOutcome::LostConnection
            }
            Err(e) => {
                tracing::warn!(peer = ?self.peer, error = %e, "Socket read failed");
                self.drop_stream();
                PollOutcome::LostConnection
            }
        }
    }

    fn set_reference_time(&mut self, t0: Instant) {
        self.clock.rebase(t0);
    }
}
