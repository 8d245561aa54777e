//! Serial motion-sensor interface.
//!
//! The sensor board speaks tab-framed ASCII over a 115200 8N1 link:
//!
//! ```text
//! host -> STOP\r\n                      (no acknowledgement, input flushed)
//! host -> CONNECT\r\n
//! dev  -> CONNECTED \r\n                 \ both within 3000 ms
//! dev  -> >\r\n                          /
//! host -> START <mode>\r\n
//! dev  -> Start Measurements\r\n         within 600 ms
//! dev  -> <f0>\t<f1>\t...\t<f9>\r\n       one frame per sample
//! ```
//!
//! Frames carry exactly ten fields. The first and last are framing bytes and are
//! dropped; the remaining eight are raw distance, temperature, filtered distance,
//! velocity, presence bit, movement bit and two status fields, in device order.
//!
//! The transport is opened through a [`SerialOpener`], so tests can hand in one end
//! of a `tokio::io::duplex` pair instead of a real port.

use crate::error::{AppResult, DaqError};
use crate::hardware::line_io::{LineBuffer, ReadOutcome};
use crate::hardware::{DeviceInterface, DeviceKind, PollOutcome, ReferenceClock, SampleMode};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Baud rate of the sensor boards.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Fields in a well-formed frame, framing bytes included.
pub const FRAME_FIELDS: usize = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);
const START_ACK_TIMEOUT: Duration = Duration::from_millis(600);

/// Async serial port I/O.
///
/// Any `AsyncRead + AsyncWrite + Unpin + Send` type works: `tokio_serial::SerialStream`
/// for hardware, `tokio::io::DuplexStream` in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens serial transports by port path.
#[async_trait]
pub trait SerialOpener: Send + Sync {
    /// Open `port` at `baud_rate`, 8N1, no flow control.
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynSerial>;
}

/// Opens real ports through `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerialOpener;

#[async_trait]
impl SerialOpener for SystemSerialOpener {
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynSerial> {
        #[cfg(feature = "instrument_serial")]
        {
            let stream = open_serial_async(port, baud_rate).await?;
            Ok(Box::new(stream))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (port, baud_rate);
            Err(DaqError::SerialFeatureDisabled)
        }
    }
}

/// Open a serial port on the blocking pool with the sensor settings (8N1, no flow control).
#[cfg(feature = "instrument_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DaqError::Instrument(format!("Failed to open serial port {path}: {e}")))
    })
    .await
    .map_err(|e| DaqError::Instrument(format!("Serial open task failed: {e}")))?
}

/// Split a frame into its semantic fields.
///
/// Returns `None` unless the line has exactly [`FRAME_FIELDS`] tab-separated fields.
pub fn parse_frame(line: &str) -> Option<Vec<String>> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != FRAME_FIELDS {
        return None;
    }
    Some(
        fields[1..FRAME_FIELDS - 1]
            .iter()
            .map(|f| f.to_string())
            .collect(),
    )
}

/// Serial sensor board.
pub struct SerialInterface {
    opener: Box<dyn SerialOpener>,
    port: Option<DynSerial>,
    port_name: Option<String>,
    lines: LineBuffer,
    baud_rate: u32,
    mode: SampleMode,
    clock: ReferenceClock,
    connect_timeout: Duration,
    start_ack_timeout: Duration,
}

impl SerialInterface {
    /// Interface backed by real serial ports.
    pub fn new(mode: SampleMode) -> Self {
        Self::with_opener(Box::new(SystemSerialOpener), mode)
    }

    /// Interface using a custom transport opener.
    pub fn with_opener(opener: Box<dyn SerialOpener>, mode: SampleMode) -> Self {
        Self {
            opener,
            port: None,
            port_name: None,
            lines: LineBuffer::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            mode,
            clock: ReferenceClock::now(),
            connect_timeout: CONNECT_TIMEOUT,
            start_ack_timeout: START_ACK_TIMEOUT,
        }
    }

    /// Override the handshake budgets.
    pub fn with_handshake_timeouts(mut self, connect: Duration, start_ack: Duration) -> Self {
        self.connect_timeout = connect;
        self.start_ack_timeout = start_ack;
        self
    }

    /// Override the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Path of the open port, if any.
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn drop_port(&mut self) {
        self.port = None;
        self.lines.clear();
    }

    async fn write_command(&mut self, command: &str) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
        let result = async {
            port.write_all(command.as_bytes()).await?;
            port.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(port = ?self.port_name, error = %e, "Serial write failed");
            self.drop_port();
            return Err(e.into());
        }
        Ok(())
    }

    /// STOP followed by an input flush.
    async fn stop_device(&mut self) -> AppResult<()> {
        self.write_command("STOP\r\n").await?;
        if let Some(port) = self.port.as_mut() {
            let discarded = self.lines.discard_pending(port);
            if discarded > 0 {
                tracing::debug!(port = ?self.port_name, discarded, "Flushed stale input");
            }
        }
        Ok(())
    }

    async fn wait_for(&mut self, expected: &str, deadline: Instant, budget: Duration) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        let result = self
            .lines
            .wait_for_line(port, expected, deadline, budget_ms)
            .await;

        match result {
            Err(DaqError::SerialUnexpectedEof) | Err(DaqError::Io(_)) => {
                self.drop_port();
                result
            }
            other => other,
        }
    }
}

#[async_trait]
impl DeviceInterface for SerialInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Sensor
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn mode(&self) -> SampleMode {
        self.mode
    }

    async fn open(&mut self, port: &str) -> AppResult<()> {
        if self.port.is_some() {
            self.close().await?;
        }

        tracing::debug!(port, baud_rate = self.baud_rate, "Opening serial port");
        let stream = self.opener.open(port, self.baud_rate).await?;
        self.port = Some(stream);
        self.port_name = Some(port.to_string());
        self.lines.clear();

        // Stop anything a previous session left running
        self.stop_device().await
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(mut port) = self.port.take() else {
            return Ok(());
        };
        self.lines.clear();
        tracing::debug!(port = ?self.port_name, "Closing serial port");
        port.shutdown().await?;
        Ok(())
    }

    async fn start(&mut self) -> AppResult<()> {
        if self.port.is_none() {
            return Err(DaqError::SerialPortNotConnected);
        }

        tracing::debug!(port = ?self.port_name, "Stopping and resetting device");
        self.stop_device().await?;

        self.write_command("CONNECT\r\n").await?;
        let budget = self.connect_timeout;
        let deadline = Instant::now() + budget;
        self.wait_for("CONNECTED ", deadline, budget).await?;
        self.wait_for(">", deadline, budget).await?;

        let mode = self.mode.value();
        tracing::debug!(port = ?self.port_name, mode = ?self.mode, "Starting sensor reading");
        self.write_command(&format!("START {mode}\r\n")).await?;
        let budget = self.start_ack_timeout;
        self.wait_for("Start Measurements", Instant::now() + budget, budget)
            .await?;

        tracing::debug!(port = ?self.port_name, "Initialization complete");
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        if self.port.is_none() {
            return Err(DaqError::SerialPortNotConnected);
        }
        self.stop_device().await
    }

    async fn set_mode(&mut self, mode: u8) -> AppResult<()> {
        self.mode = SampleMode::try_from(mode)?;
        Ok(())
    }

    async fn poll(&mut self) -> PollOutcome {
        let Some(port) = self.port.as_mut() else {
            return PollOutcome::LostConnection;
        };

        match self.lines.try_read_line(port) {
            Ok(ReadOutcome::Line(line)) => match parse_frame(&line) {
                Some(fields) => PollOutcome::Samples(vec![self.clock.stamp(fields)]),
                None => {
                    tracing::debug!(port = ?self.port_name, frame = %line, "Wrong data received, skipping");
                    PollOutcome::NoData
                }
            },
            Ok(ReadOutcome::Empty) => PollOutcome::NoData,
            Ok(ReadOutcome::Closed) => {
                tracing::warn!(port = ?self.port_name, "Serial port closed by device");
                self.drop_port();
                PollOutcome::LostConnection
            }
            Err(e) => {
                tracing::warn!(port = ?self.port_name, error = %e, "Serial read failed");
                self.drop_port();
                PollOutcome::LostConnection
            }
        }
    }

    fn set_reference_time(&mut self, t0: Instant) {
        self.clock.rebase(t0);
    }
}
