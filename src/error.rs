//! Custom error types for the acquisition engine.
//!
//! `DaqError` is the single error type returned by device interfaces, workers, the
//! coordinator and the configuration layer. It is built with `thiserror` so that
//! underlying failures (I/O, configuration parsing) convert into it through `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps `figment` errors raised while reading the TOML file or
//!   environment overrides.
//! - **`Configuration`**: Semantic problems found by `AcquisitionConfig::validate`.
//! - **`Io`**: File, socket and serial I/O failures.
//! - **`Instrument`**: A device refused a request or answered unexpectedly.
//! - **`HandshakeTimeout`**: An expected acknowledgement line did not arrive in budget.
//! - **`InvalidMode`**: A sample-rate mode outside the supported set.
//! - **`UnknownDevice` / `WorkerUnavailable`**: Coordinator addressing problems.
//!
//! Device-facing errors never cross the worker boundary as errors. The worker turns
//! them into the boolean carried by a `Response` and logs the detail; see
//! [`DaqError::is_recoverable`] for how severity is chosen.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Timed out after {timeout_ms} ms waiting for '{expected}'")]
    HandshakeTimeout { expected: String, timeout_ms: u64 },

    #[error("Invalid sample mode {0}. Supported modes: 0 (slow), 1 (fast)")]
    InvalidMode(u8),

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Worker for '{0}' is no longer running")]
    WorkerUnavailable(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Whether the condition is an expected, transient device failure.
    ///
    /// Recoverable errors are the ones a user fixes by retrying (busy port,
    /// unplugged cable, slow handshake). Workers log them at `warn`; anything
    /// else is logged at `error`.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::Io(_)
            | DaqError::Instrument(_)
            | DaqError::SerialPortNotConnected
            | DaqError::SerialUnexpectedEof
            | DaqError::HandshakeTimeout { .. }
            | DaqError::InvalidMode(_) => true,
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::SerialFeatureDisabled
            | DaqError::UnknownDevice(_)
            | DaqError::WorkerUnavailable(_)
            | DaqError::ShutdownFailed(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_timeout_message_names_expected_text() {
        let err = DaqError::HandshakeTimeout {
            expected: "Start Measurements".into(),
            timeout_ms: 600,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 600 ms waiting for 'Start Measurements'"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn io_errors_convert_and_are_recoverable() {
        fn open() -> AppResult<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))?;
            Ok(())
        }

        let err = open().unwrap_err();
        assert!(matches!(err, DaqError::Io(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn addressing_errors_are_not_recoverable() {
        assert!(!DaqError::UnknownDevice("TMOS 9".into()).is_recoverable());
        assert!(!DaqError::SerialFeatureDisabled.is_recoverable());
        assert_eq!(
            DaqError::InvalidMode(2).to_string(),
            "Invalid sample mode 2. Supported modes: 0 (slow), 1 (fast)"
        );
    }
}
