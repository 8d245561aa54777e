//! Acquisition Session Coordinator
//!
//! Owns the device roster and fans commands out to the hosted workers:
//!
//! - `start_all` stamps one shared reference time on every worker before its START,
//!   so elapsed times in all data logs share an origin
//! - `stop_all`, `set_mode` and `rename_experiment` broadcast in roster order
//! - `refresh_ports` offers the current serial port list to serial devices that are
//!   not connected, leaving active sessions untouched
//! - per-device `connect`, `disconnect`, `set_console_logging`, `set_sink_forwarding`
//!
//! Every operation is fire-and-observe: it queues commands and returns. Outcomes
//! arrive through [`SessionCoordinator::next_response`], tagged with the device
//! title. Broadcasts are best effort; one failing device never prevents the others
//! from receiving the command.

use crate::config::{AcquisitionConfig, DeviceDefinition, DeviceType};
use crate::error::{AppResult, DaqError};
use crate::hardware::{
    DeviceInterface, DeviceKind, MockInterface, MockScript, MotionCaptureInterface, SampleMode,
    SerialInterface, SocketInterface,
};
use crate::host::{WorkerHandle, WorkerHost};
use crate::messages::{Command, Response, WorkerState};
use crate::ports::PortLister;
use crate::sink::SinkSender;
use crate::worker::{normalize, DeviceWorker, WorkerSettings};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};

/// One roster entry.
#[derive(Debug)]
pub struct DeviceSlot {
    device_type: DeviceType,
    handle: WorkerHandle,
    ports: Vec<String>,
}

impl DeviceSlot {
    /// Device title.
    pub fn title(&self) -> &str {
        self.handle.title()
    }

    /// Hardware backend.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }
}

/// Coordinator over all device workers of a session.
pub struct SessionCoordinator {
    roster: Vec<DeviceSlot>,
    responses: StreamMap<String, UnboundedReceiverStream<Response>>,
    port_lister: Box<dyn PortLister>,
    experiment: Option<String>,
}

impl SessionCoordinator {
    /// Empty roster.
    pub fn new(port_lister: Box<dyn PortLister>) -> Self {
        Self {
            roster: Vec::new(),
            responses: StreamMap::new(),
            port_lister,
            experiment: None,
        }
    }

    /// Append a hosted worker to the roster.
    pub fn add_device(&mut self, device_type: DeviceType, mut handle: WorkerHandle) -> AppResult<()> {
        let title = handle.title().to_string();
        let file_name = normalize(&title);
        if let Some(slot) = self.roster.iter().find(|slot| normalize(slot.title()) == file_name) {
            return Err(DaqError::Configuration(if slot.title() == title {
                format!("Duplicate device title: {title}")
            } else {
                format!("Device titles '{}' and '{title}' map to the same data log", slot.title())
            }));
        }

        if let Some(rx) = handle.take_responses() {
            self.responses
                .insert(title.clone(), UnboundedReceiverStream::new(rx));
        }
        tracing::debug!(device = %title, ?device_type, "Device added to roster");
        self.roster.push(DeviceSlot {
            device_type,
            handle,
            ports: Vec::new(),
        });
        Ok(())
    }

    /// Device titles in roster order.
    pub fn titles(&self) -> Vec<&str> {
        self.roster.iter().map(DeviceSlot::title).collect()
    }

    /// Set every worker's reference time to one shared instant, then START each.
    ///
    /// Returns the shared reference time.
    pub fn start_all(&self) -> Instant {
        let t0 = Instant::now();
        for slot in &self.roster {
            self.deliver(slot, Command::SetReferenceTime(t0));
            self.deliver(slot, Command::Start);
        }
        tracing::info!(devices = self.roster.len(), "Start issued to all devices");
        t0
    }

    /// STOP every worker.
    pub fn stop_all(&self) {
        for slot in &self.roster {
            self.deliver(slot, Command::Stop);
        }
        tracing::info!(devices = self.roster.len(), "Stop issued to all devices");
    }

    /// Broadcast a sample-rate mode change.
    pub fn set_mode(&self, mode: u8) {
        for slot in &self.roster {
            self.deliver(slot, Command::SetMode(mode));
        }
    }

    /// Rebind every worker's data log to `name`.
    ///
    /// Callers are expected to stop the session first.
    pub fn rename_experiment(&mut self, name: &str) {
        let running: Vec<&str> = self
            .roster
            .iter()
            .filter(|slot| slot.handle.state() == WorkerState::Started)
            .map(DeviceSlot::title)
            .collect();
        if !running.is_empty() {
            tracing::warn!(?running, experiment = name, "Renaming experiment while devices are acquiring");
        }

        for slot in &self.roster {
            self.deliver(slot, Command::SetHandler(name.to_string()));
        }
        self.experiment = Some(name.to_string());
    }

    /// Last experiment name requested through [`rename_experiment`](Self::rename_experiment).
    pub fn experiment(&self) -> Option<&str> {
        self.experiment.as_deref()
    }

    /// Query serial ports and publish them to disconnected serial devices.
    pub fn refresh_ports(&mut self) -> AppResult<Vec<String>> {
        let ports = self.port_lister.available_ports()?;
        for slot in &mut self.roster {
            if slot.device_type == DeviceType::Serial
                && slot.handle.state() == WorkerState::Disconnected
            {
                slot.ports = ports.clone();
            }
        }
        tracing::debug!(count = ports.len(), "Serial ports refreshed");
        Ok(ports)
    }

    /// Ports last offered to `title`.
    pub fn available_ports(&self, title: &str) -> AppResult<&[String]> {
        Ok(&self.slot(title)?.ports)
    }

    /// CONNECT one device.
    pub fn connect(&self, title: &str, port: &str) -> AppResult<()> {
        self.slot(title)?
            .handle
            .try_send(Command::Connect(port.to_string()))
    }

    /// DISCONNECT one device.
    pub fn disconnect(&self, title: &str) -> AppResult<()> {
        self.slot(title)?.handle.try_send(Command::Disconnect)
    }

    /// Toggle `LogData` echo for one device.
    pub fn set_console_logging(&self, title: &str, enabled: bool) -> AppResult<()> {
        self.slot(title)?
            .handle
            .try_send(Command::SetConsole(enabled))
    }

    /// Toggle live-sink forwarding for one device.
    pub fn set_sink_forwarding(&self, title: &str, enabled: bool) -> AppResult<()> {
        self.slot(title)?
            .handle
            .try_send(Command::SetSinkForwarding(enabled))
    }

    /// Lifecycle state last published by `title`.
    pub fn device_state(&self, title: &str) -> AppResult<WorkerState> {
        Ok(self.slot(title)?.handle.state())
    }

    /// Records logged by `title` so far.
    pub fn sample_count(&self, title: &str) -> AppResult<u64> {
        Ok(self.slot(title)?.handle.sample_count())
    }

    /// Next response from any worker, with the device title.
    ///
    /// `None` once every worker has exited (or the roster is empty).
    pub async fn next_response(&mut self) -> Option<(String, Response)> {
        self.responses.next().await
    }

    /// Shut down every worker, in roster order.
    pub async fn shutdown(self, timeout: Duration) -> AppResult<()> {
        let mut errors = Vec::new();
        for slot in self.roster {
            if let Err(e) = slot.handle.shutdown(timeout).await {
                tracing::error!(error = %e, "Worker shutdown failed");
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    fn slot(&self, title: &str) -> AppResult<&DeviceSlot> {
        self.roster
            .iter()
            .find(|slot| slot.title() == title)
            .ok_or_else(|| DaqError::UnknownDevice(title.to_string()))
    }

    fn deliver(&self, slot: &DeviceSlot, command: Command) {
        if !slot.handle.send(command) {
            tracing::warn!(device = %slot.title(), "Worker not running, command dropped");
        }
    }
}

/// Device interface for a configured backend.
pub fn build_interface(device_type: DeviceType, mode: SampleMode) -> Box<dyn DeviceInterface> {
    match device_type {
        DeviceType::Serial => Box::new(SerialInterface::new(mode)),
        DeviceType::Socket => Box::new(SocketInterface::new(mode)),
        DeviceType::MotionCapture => Box::new(MotionCaptureInterface::new(mode)),
        DeviceType::Mock => Box::new(MockInterface::new(
            DeviceKind::Unknown,
            MockScript::default().generating(),
        )),
    }
}

fn worker_settings(definition: &DeviceDefinition, experiment: &str, output_dir: &Path) -> WorkerSettings {
    WorkerSettings {
        title: definition.title.clone(),
        experiment: experiment.to_string(),
        output_dir: output_dir.to_path_buf(),
        interval_ms: definition.interval_ms,
        log_to_console: definition.log_to_console,
        log_to_sink: definition.log_to_sink,
    }
}

/// Build and host a worker for every enabled device in `config`.
pub fn build_session(
    config: &AcquisitionConfig,
    sink: Option<SinkSender>,
    port_lister: Box<dyn PortLister>,
) -> AppResult<SessionCoordinator> {
    config.validate()?;
    let mode = SampleMode::try_from(config.session.mode)?;
    let mut coordinator = SessionCoordinator::new(port_lister);

    for definition in config.enabled_devices() {
        let settings = worker_settings(definition, &config.session.experiment, &config.session.output_dir);
        let interface = build_interface(definition.r#type, mode);
        let worker = DeviceWorker::new(settings, interface, sink.clone())?;
        let handle = WorkerHost::spawn(worker)?;
        coordinator.add_device(definition.r#type, handle)?;
    }

    if config.session.refresh_ports {
        if let Err(e) = coordinator.refresh_ports() {
            tracing::warn!(error = %e, "Could not list serial ports");
        }
    }

    tracing::info!(
        devices = coordinator.roster.len(),
        experiment = %config.session.experiment,
        "Session ready"
    );
    Ok(coordinator)
}
