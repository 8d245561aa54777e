//! Message types for worker communication.
//!
//! This module defines the command and response types exchanged between the
//! [`SessionCoordinator`](crate::coordinator::SessionCoordinator) and each
//! [`DeviceWorker`](crate::worker::DeviceWorker).
//!
//! # Message Flow
//!
//! ```text
//! Coordinator                        Worker thread
//! -----------                        -------------
//! 1. send(Command)           ------>
//!                                    2. Receive command (in send order)
//!                                    3. Drive the device interface
//!                                    4. Emit exactly one Response
//! 5. next_response()         <------
//! ```
//!
//! # Channel Types
//!
//! - **Commands**: unbounded mpsc, one per worker. Sending never blocks the
//!   coordinator, and a worker consumes commands strictly in send order.
//! - **Responses**: unbounded mpsc, one per worker, fanned in by the coordinator.
//!
//! Commands are fire-and-observe: there is no reply channel inside a command.
//! Callers learn outcomes from the response stream. Configuration toggles
//! (`SetConsole`, `SetReferenceTime`, `SetSinkForwarding`) produce no response.

use std::fmt;
use tokio::time::Instant;

/// Commands accepted by a device worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open the device on the given port path or host.
    Connect(String),
    /// Close the device. Always ends in [`WorkerState::Disconnected`].
    Disconnect,
    /// Arm the device and start polling.
    Start,
    /// Stop the device and disarm polling.
    Stop,
    /// Change the sample-rate mode.
    SetMode(u8),
    /// Rebind the data log to a new experiment name.
    SetHandler(String),
    /// Echo every logged record as [`Response::LogData`].
    SetConsole(bool),
    /// Rebase elapsed-time stamping on a shared session origin.
    SetReferenceTime(Instant),
    /// Enable or disable forwarding to the live sink.
    SetSinkForwarding(bool),
}

/// Responses emitted by a device worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Outcome of `Connect`.
    Connected(bool),
    /// Outcome of `Disconnect`.
    Disconnected(bool),
    /// Outcome of `Start`.
    Started(bool),
    /// Outcome of `Stop`.
    Stopped(bool),
    /// Outcome of `SetMode`; `detail` is `"[mode]"`.
    ModeChanged {
        /// Whether the mode was accepted
        ok: bool,
        /// Requested mode, bracketed
        detail: String,
    },
    /// Outcome of `SetHandler`; `detail` is the bracketed new path or `"Name unchanged"`.
    HandlerChanged {
        /// Whether the log file was rebound
        ok: bool,
        /// Path or reason
        detail: String,
    },
    /// One logged record (only while console logging is on).
    LogData(String),
    /// Unsolicited failure, such as a lost connection.
    Error(String),
}

impl Response {
    /// Success flag of the response; `LogData` counts as success, `Error` as failure.
    pub fn is_ok(&self) -> bool {
        match self {
            Response::Connected(ok)
            | Response::Disconnected(ok)
            | Response::Started(ok)
            | Response::Stopped(ok)
            | Response::ModeChanged { ok, .. }
            | Response::HandlerChanged { ok, .. } => *ok,
            Response::LogData(_) => true,
            Response::Error(_) => false,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Connected(ok) => write!(f, "connected ({ok})"),
            Response::Disconnected(ok) => write!(f, "disconnected ({ok})"),
            Response::Started(ok) => write!(f, "started ({ok})"),
            Response::Stopped(ok) => write!(f, "stopped ({ok})"),
            Response::ModeChanged { ok, detail } => write!(f, "mode changed ({ok}) {detail}"),
            Response::HandlerChanged { ok, detail } => {
                write!(f, "handler changed ({ok}) {detail}")
            }
            Response::LogData(line) => write!(f, "{line}"),
            Response::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

/// Lifecycle state of a device worker.
///
/// `Disconnected -> Connected -> Started`; the only backward edges are
/// `Started -> Connected` and `Connected -> Disconnected`. DISCONNECT from
/// `Started` passes through a stop first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// No open connection.
    #[default]
    Disconnected,
    /// Connection open, not polling.
    Connected,
    /// Connection open and the poll loop armed.
    Started,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Disconnected => "disconnected",
            WorkerState::Connected => "connected",
            WorkerState::Started => "started",
        };
        f.write_str(name)
    }
}
