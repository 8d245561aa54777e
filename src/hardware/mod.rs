//! Device Interfaces
//!
//! Every hardware backend implements [`DeviceInterface`], one uniform capability set
//! that a [`DeviceWorker`](crate::worker::DeviceWorker) drives through the same
//! connect/start/stop/reconfigure lifecycle:
//!
//! - [`SerialInterface`] - serial-attached motion sensors (tab-framed ASCII lines)
//! - [`MotionCaptureInterface`] - motion-capture bridge, many subjects per frame
//! - [`SocketInterface`] - line-oriented TCP devices
//! - [`MockInterface`] - scripted device for tests and dry runs
//!
//! # Contract
//!
//! - Expected failures (busy port, unreachable host, handshake timeout) are returned
//!   as `Err(DaqError)`; nothing panics and nothing blocks without a time budget.
//! - `close` is idempotent.
//! - `poll` is a single non-blocking read attempt. It never waits for bytes.
//!   Decode and framing errors are logged and reported as [`PollOutcome::NoData`];
//!   only a transport failure is [`PollOutcome::LostConnection`].
//! - Each interface stamps its samples with milliseconds elapsed since its
//!   reference time, which `set_reference_time` rebases.

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use tokio::time::Instant;

pub mod line_io;
pub mod mock;
pub mod motion_capture;
pub mod serial;
pub mod socket;

pub use mock::{MockInterface, MockProbe, MockScript, PollStep};
pub use motion_capture::{BridgeClient, MocapClient, MocapFrame, MotionCaptureInterface};
pub use serial::{SerialInterface, SerialOpener};
pub use socket::SocketInterface;

/// Device type code carried on the live-sink wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceKind {
    /// Anything without a dedicated decoder on the sink side
    Unknown = 0,
    /// Serial motion sensor
    Sensor = 1,
    /// Motion-capture system
    MotionCapture = 2,
}

impl DeviceKind {
    /// Integer code written on the sink pipe.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Sample-rate mode of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SampleMode {
    /// Low-rate sampling
    #[default]
    Slow = 0,
    /// High-rate sampling
    Fast = 1,
}

impl SampleMode {
    /// Integer value sent to the device.
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SampleMode {
    type Error = DaqError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SampleMode::Slow),
            1 => Ok(SampleMode::Fast),
            other => Err(DaqError::InvalidMode(other)),
        }
    }
}

/// One timestamped semantic record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Milliseconds since the interface's reference time
    pub elapsed_ms: u64,
    /// Device-specific ordered fields
    pub fields: Vec<String>,
}

impl Sample {
    /// Log line form: `<elapsed_ms>,<field_1>,...,<field_k>`.
    pub fn to_line(&self) -> String {
        let mut line = self.elapsed_ms.to_string();
        for field in &self.fields {
            line.push(',');
            line.push_str(field);
        }
        line
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// One or more records, in device order
    Samples(Vec<Sample>),
    /// Nothing available right now
    NoData,
    /// The transport is gone; the worker must stop
    LostConnection,
}

/// Monotonic origin for elapsed-time stamping.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceClock {
    t0: Instant,
}

impl ReferenceClock {
    /// Clock anchored at the current instant.
    pub fn now() -> Self {
        Self { t0: Instant::now() }
    }

    /// Move the origin.
    pub fn rebase(&mut self, t0: Instant) {
        self.t0 = t0;
    }

    /// Whole milliseconds since the origin (zero if the origin lies in the future).
    pub fn elapsed_ms(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.t0);
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    /// Stamp `fields` with the current elapsed time.
    pub fn stamp(&self, fields: Vec<String>) -> Sample {
        Sample {
            elapsed_ms: self.elapsed_ms(),
            fields,
        }
    }
}

impl Default for ReferenceClock {
    fn default() -> Self {
        Self::now()
    }
}

/// Uniform capability set of every hardware backend.
///
/// Instances live inside one worker and are only ever driven from that worker's
/// thread, so methods take `&mut self` and the trait only requires `Send`.
#[async_trait]
pub trait DeviceInterface: Send {
    /// Device type code for the live sink.
    fn kind(&self) -> DeviceKind;

    /// Whether a connection is currently open.
    fn is_open(&self) -> bool;

    /// Currently active sample mode.
    fn mode(&self) -> SampleMode;

    /// Open the connection on `port` (device path or host).
    async fn open(&mut self, port: &str) -> AppResult<()>;

    /// Close the connection. Closing a closed interface succeeds without side effects.
    async fn close(&mut self) -> AppResult<()>;

    /// Run the device's arm/handshake sequence within its time budget.
    async fn start(&mut self) -> AppResult<()>;

    /// Stop the device and discard pending input.
    async fn stop(&mut self) -> AppResult<()>;

    /// Validate and store a new sample mode. Invalid values leave the mode unchanged.
    async fn set_mode(&mut self, mode: u8) -> AppResult<()>;

    /// One non-blocking read attempt.
    async fn poll(&mut self) -> PollOutcome;

    /// Rebase elapsed-time stamping on `t0`.
    fn set_reference_time(&mut self, t0: Instant);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sample_mode_accepts_exactly_two_values() {
        assert_eq!(SampleMode::try_from(0).unwrap(), SampleMode::Slow);
        assert_eq!(SampleMode::try_from(1).unwrap(), SampleMode::Fast);
        assert!(matches!(
            SampleMode::try_from(2),
            Err(DaqError::InvalidMode(2))
        ));
    }

    #[test]
    fn device_kind_codes_match_sink_protocol() {
        assert_eq!(DeviceKind::Unknown.code(), 0);
        assert_eq!(DeviceKind::Sensor.code(), 1);
        assert_eq!(DeviceKind::MotionCapture.code(), 2);
    }

    #[test]
    fn sample_line_has_no_trailing_delimiter() {
        let sample = Sample {
            elapsed_ms: 20,
            fields: vec!["812".into(), "24.5".into()],
        };
        assert_eq!(sample.to_line(), "20,812,24.5");

        let empty = Sample {
            elapsed_ms: 5,
            fields: vec![],
        };
        assert_eq!(empty.to_line(), "5");
    }

    #[tokio::test(start_paused = true)]
    async fn reference_clock_rebases() {
        let mut clock = ReferenceClock::now();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.elapsed_ms(), 250);

        clock.rebase(Instant::now());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(clock.stamp(vec!["a".into()]).elapsed_ms, 30);

        clock.rebase(Instant::now() + Duration::from_secs(1));
        assert_eq!(clock.elapsed_ms(), 0);
    }
}
