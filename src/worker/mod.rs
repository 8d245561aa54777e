//! Device Worker
//!
//! A [`DeviceWorker`] owns one [`DeviceInterface`] and drives it through the
//! acquisition lifecycle:
//!
//! ```text
//!                CONNECT ok              START ok
//! Disconnected ------------> Connected ------------> Started
//!      ^                       |   ^                    |
//!      +------ DISCONNECT -----+   +-- STOP / lost -----+
//! ```
//!
//! CONNECT is accepted in every state: a started device is stopped first and an
//! open one is re-opened, which is how a caller recovers after a lost connection.
//!
//! The worker is a single-consumer dispatch loop. Commands are handled one at a
//! time in send order, and every externally visible action yields exactly one
//! [`Response`]. Hardware errors are logged and folded into the response's success
//! flag; they never end the loop. Only closing the command channel does.
//!
//! While `Started`, a ticker local to the worker triggers one non-blocking poll per
//! interval (interval 0 polls back to back, yielding to the runtime in between).
//! Each polled record is appended to the data log, forwarded to the live sink when
//! enabled, and echoed as [`Response::LogData`] when console logging is on. The
//! data log is flushed after every poll batch, on stop, on rename and at exit.

pub mod data_log;

pub use data_log::{log_filename, normalize, DataLog};

use crate::error::{AppResult, DaqError};
use crate::hardware::{DeviceInterface, PollOutcome};
use crate::messages::{Command, Response, WorkerState};
use crate::sink::{SinkForwarder, SinkSender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Static settings of a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Stable device title; names the data log and the worker thread
    pub title: String,
    /// Initial experiment name
    pub experiment: String,
    /// Directory holding the data log
    pub output_dir: PathBuf,
    /// Poll interval in milliseconds; 0 polls as fast as the runtime allows
    pub interval_ms: u64,
    /// Echo records as `LogData` responses
    pub log_to_console: bool,
    /// Forward records to the live sink
    pub log_to_sink: bool,
}

impl WorkerSettings {
    /// Settings with a 10 ms interval, console logging off and sink forwarding on.
    pub fn new(title: impl Into<String>, experiment: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            experiment: experiment.into(),
            output_dir: output_dir.into(),
            interval_ms: 10,
            log_to_console: false,
            log_to_sink: true,
        }
    }

    /// Set the poll interval.
    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Set console logging.
    pub fn with_console_logging(mut self, enabled: bool) -> Self {
        self.log_to_console = enabled;
        self
    }
}

/// State machine around one device interface.
pub struct DeviceWorker {
    title: String,
    experiment: String,
    output_dir: PathBuf,
    interval: Duration,
    interface: Box<dyn DeviceInterface>,
    state: WorkerState,
    state_tx: watch::Sender<WorkerState>,
    samples: Arc<AtomicU64>,
    ticker: Option<Interval>,
    log: DataLog,
    log_write_failed: bool,
    log_to_console: bool,
    sink: SinkForwarder,
}

impl DeviceWorker {
    /// Build a worker and open its data log.
    pub fn new(
        settings: WorkerSettings,
        interface: Box<dyn DeviceInterface>,
        sink: Option<SinkSender>,
    ) -> AppResult<Self> {
        let log = DataLog::open(&settings.output_dir, &settings.experiment, &settings.title)?;
        let sink = SinkForwarder::new(sink, settings.title.clone(), interface.kind(), settings.log_to_sink);
        let (state_tx, _) = watch::channel(WorkerState::Disconnected);

        Ok(Self {
            title: settings.title,
            experiment: settings.experiment,
            output_dir: settings.output_dir,
            interval: Duration::from_millis(settings.interval_ms),
            interface,
            state: WorkerState::Disconnected,
            state_tx,
            samples: Arc::new(AtomicU64::new(0)),
            ticker: None,
            log,
            log_write_failed: false,
            log_to_console: settings.log_to_console,
            sink,
        })
    }

    /// Device title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Subscribe to lifecycle state changes.
    pub fn state_receiver(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Shared count of records written to the data log.
    pub fn sample_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.samples)
    }

    /// Path of the current data log.
    pub fn log_path(&self) -> PathBuf {
        self.log.path().to_path_buf()
    }

    /// Dispatch loop. Returns when `commands` is closed.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        responses: mpsc::UnboundedSender<Response>,
    ) {
        tracing::debug!(device = %self.title, "Worker running");

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &responses).await,
                    None => break,
                },

                _ = next_tick(&mut self.ticker), if self.state == WorkerState::Started => {
                    self.poll_once(&responses).await;
                }
            }
        }

        self.shutdown().await;
        tracing::debug!(device = %self.title, "Worker stopped");
    }

    async fn handle_command(&mut self, command: Command, responses: &mpsc::UnboundedSender<Response>) {
        tracing::trace!(device = %self.title, ?command, "Command received");
        match command {
            Command::Connect(port) => {
                let response = self.connect(&port).await;
                self.respond(responses, response);
            }
            Command::Disconnect => {
                let response = self.disconnect().await;
                self.respond(responses, response);
            }
            Command::Start => {
                let response = self.start().await;
                self.respond(responses, response);
            }
            Command::Stop => {
                let response = self.stop().await;
                self.respond(responses, response);
            }
            Command::SetMode(mode) => {
                let result = self.interface.set_mode(mode).await;
                let ok = self.check("set mode", result);
                self.respond(
                    responses,
                    Response::ModeChanged {
                        ok,
                        detail: format!("[{mode}]"),
                    },
                );
            }
            Command::SetHandler(experiment) => {
                let response = self.change_handler(experiment);
                self.respond(responses, response);
            }
            Command::SetConsole(enabled) => {
                tracing::debug!(device = %self.title, enabled, "Console logging");
                self.log_to_console = enabled;
            }
            Command::SetReferenceTime(t0) => {
                self.interface.set_reference_time(t0);
            }
            Command::SetSinkForwarding(enabled) => {
                self.sink.set_enabled(enabled);
            }
        }
    }

    /// Open `port` from any state. A started device is stopped first; an open
    /// transport is replaced by the interface's `open`.
    async fn connect(&mut self, port: &str) -> Response {
        if self.state == WorkerState::Started {
            self.disarm();
            let result = self.interface.stop().await;
            self.check("stop before reconnect", result);
            self.flush_log();
            self.set_state(WorkerState::Connected);
        }

        let result = self.interface.open(port).await;
        let ok = self.check("connect", result);
        if ok {
            tracing::info!(device = %self.title, port, "Connected");
            self.set_state(WorkerState::Connected);
        } else if self.state != WorkerState::Disconnected {
            if self.interface.is_open() {
                let result = self.interface.close().await;
                self.check("close after failed reconnect", result);
            }
            self.set_state(WorkerState::Disconnected);
        }
        Response::Connected(ok)
    }

    async fn disconnect(&mut self) -> Response {
        self.disarm();
        if self.state == WorkerState::Started {
            let result = self.interface.stop().await;
            self.check("stop before disconnect", result);
        }

        let result = self.interface.close().await;
        let ok = self.check("disconnect", result);
        self.flush_log();
        self.set_state(WorkerState::Disconnected);
        tracing::info!(device = %self.title, ok, "Disconnected");
        Response::Disconnected(ok)
    }

    async fn start(&mut self) -> Response {
        if self.state != WorkerState::Connected {
            tracing::warn!(device = %self.title, state = %self.state, "Start requires a connected device");
            return Response::Started(false);
        }

        let result = self.interface.start().await;
        let ok = self.check("start", result);
        if ok {
            self.set_state(WorkerState::Started);
            self.arm();
            tracing::info!(device = %self.title, interval_ms = self.interval.as_millis() as u64, "Started");
        }
        Response::Started(ok)
    }

    async fn stop(&mut self) -> Response {
        self.disarm();
        if self.state == WorkerState::Disconnected {
            tracing::warn!(device = %self.title, "Stop ignored, device not connected");
            return Response::Stopped(false);
        }

        let result = self.interface.stop().await;
        let ok = self.check("stop", result);
        self.flush_log();
        self.set_state(WorkerState::Connected);
        tracing::info!(device = %self.title, ok, "Stopped");
        Response::Stopped(ok)
    }

    fn change_handler(&mut self, experiment: String) -> Response {
        if experiment == self.experiment {
            return Response::HandlerChanged {
                ok: false,
                detail: "Name unchanged".to_string(),
            };
        }

        // Old records reach disk before the new file exists
        self.flush_log();
        match DataLog::open(&self.output_dir, &experiment, &self.title) {
            Ok(log) => {
                self.log = log;
                self.log_write_failed = false;
                self.experiment = experiment;
                let path = self.log.path().display().to_string();
                tracing::info!(device = %self.title, path = %path, "Data log rebound");
                Response::HandlerChanged {
                    ok: true,
                    detail: format!("[{path}]"),
                }
            }
            Err(e) => {
                tracing::error!(device = %self.title, error = %e, "Failed to open new data log, keeping the current one");
                Response::HandlerChanged {
                    ok: false,
                    detail: e.to_string(),
                }
            }
        }
    }

    async fn poll_once(&mut self, responses: &mpsc::UnboundedSender<Response>) {
        match self.interface.poll().await {
            PollOutcome::Samples(samples) => {
                for sample in samples {
                    let line = sample.to_line();
                    self.record(&line);
                    self.sink.forward(&line);
                    if self.log_to_console {
                        self.respond(responses, Response::LogData(line));
                    }
                }
                self.flush_log();
            }
            PollOutcome::NoData => {}
            PollOutcome::LostConnection => self.lost_connection(responses).await,
        }
    }

    async fn lost_connection(&mut self, responses: &mpsc::UnboundedSender<Response>) {
        tracing::error!(device = %self.title, "Lost connection, stopping");
        self.disarm();
        if let Err(e) = self.interface.stop().await {
            tracing::debug!(device = %self.title, error = %e, "Stop after lost connection failed");
        }
        self.flush_log();
        self.set_state(WorkerState::Connected);
        self.respond(
            responses,
            Response::Error(format!("Lost connection to {}. Stopping", self.title)),
        );
    }

    async fn shutdown(&mut self) {
        self.disarm();
        if self.state == WorkerState::Started {
            let result = self.interface.stop().await;
            self.check("stop on shutdown", result);
        }
        if self.state != WorkerState::Disconnected {
            let result = self.interface.close().await;
            self.check("close on shutdown", result);
        }
        self.flush_log();
        self.set_state(WorkerState::Disconnected);
    }

    fn record(&mut self, line: &str) {
        match self.log.write_line(line) {
            Ok(()) => {
                self.log_write_failed = false;
                self.samples.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if !self.log_write_failed {
                    tracing::error!(device = %self.title, path = %self.log.path().display(), error = %e, "Data log write failed");
                }
                self.log_write_failed = true;
            }
        }
    }

    fn flush_log(&mut self) {
        if let Err(e) = self.log.flush() {
            tracing::error!(device = %self.title, path = %self.log.path().display(), error = %e, "Data log flush failed");
        }
    }

    fn arm(&mut self) {
        self.ticker = if self.interval.is_zero() {
            None
        } else {
            let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        };
    }

    fn disarm(&mut self) {
        self.ticker = None;
    }

    fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Fold a device result into a success flag, logging failures.
    fn check(&self, action: &str, result: AppResult<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                log_device_error(&self.title, action, &e);
                false
            }
        }
    }

    fn respond(&self, responses: &mpsc::UnboundedSender<Response>, response: Response) {
        if responses.send(response).is_err() {
            tracing::trace!(device = %self.title, "Response receiver gone");
        }
    }
}

fn log_device_error(title: &str, action: &str, error: &DaqError) {
    if error.is_recoverable() {
        tracing::warn!(device = %title, action, error = %error, "Device operation failed");
    } else {
        tracing::error!(device = %title, action, error = %error, "Device operation failed");
    }
}

/// Wait for the next poll slot. Without a ticker (interval 0) just yield.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => tokio::task::yield_now().await,
    }
}
