//! Serial port discovery.
//!
//! The coordinator asks a [`PortLister`] for the serial ports present on the
//! machine and offers the list to devices that are not connected.

use crate::error::{AppResult, DaqError};

/// Source of available serial port names.
pub trait PortLister: Send + Sync {
    /// Port names currently present, e.g. `/dev/ttyUSB0` or `COM3`.
    fn available_ports(&self) -> AppResult<Vec<String>>;
}

/// Enumerates the ports of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortLister for SystemPorts {
    fn available_ports(&self) -> AppResult<Vec<String>> {
        #[cfg(feature = "instrument_serial")]
        {
            let mut names: Vec<String> = tokio_serial::available_ports()
                .map_err(|e| DaqError::Instrument(format!("Failed to enumerate serial ports: {e}")))?
                .into_iter()
                .map(|info| info.port_name)
                .collect();
            names.sort();
            Ok(names)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DaqError::SerialFeatureDisabled)
        }
    }
}

/// Fixed port list, for tests and machines without serial hardware.
#[derive(Debug, Default, Clone)]
pub struct StaticPorts {
    ports: Vec<String>,
}

impl StaticPorts {
    /// Lister that always reports `ports`.
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ports: ports.into_iter().map(Into::into).collect(),
        }
    }
}

impl PortLister for StaticPorts {
    fn available_ports(&self) -> AppResult<Vec<String>> {
        Ok(self.ports.clone())
    }
}
