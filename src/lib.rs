//! # Telemetry DAQ Core Library
//!
//! Multi-device telemetry acquisition: one worker per device, each on its own
//! thread, polling its hardware on a fixed interval and appending time-stamped
//! records to a per-device data log. A session coordinator fans commands out to
//! every worker and collects their responses; records can additionally be streamed
//! to a live-telemetry consumer over a pipe.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based session configuration (`config/acquisition.toml`
//!   plus `TELEMETRY_DAQ_` environment overrides).
//! - **`coordinator`**: `SessionCoordinator`, the device roster and broadcast operations.
//! - **`error`**: The `DaqError` enum shared by every module.
//! - **`hardware`**: The `DeviceInterface` trait and its serial, socket,
//!   motion-capture and mock backends.
//! - **`host`**: `WorkerHost`, which runs each worker on a dedicated thread.
//! - **`messages`**: Commands, responses and worker states exchanged with workers.
//! - **`ports`**: Serial port discovery.
//! - **`sink`**: Live-telemetry pipe protocol and forwarding.
//! - **`tracing_setup`**: Structured logging initialisation.
//! - **`worker`**: The per-device state machine and its data log.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod hardware;
pub mod host;
pub mod messages;
pub mod ports;
pub mod sink;
pub mod tracing_setup;
pub mod worker;

pub use coordinator::{build_session, SessionCoordinator};
pub use error::{AppResult, DaqError};
pub use host::{WorkerHandle, WorkerHost};
pub use messages::{Command, Response, WorkerState};
pub use worker::{DeviceWorker, WorkerSettings};
