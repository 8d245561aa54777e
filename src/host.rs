//! Worker Host
//!
//! Runs every [`DeviceWorker`] on its own OS thread with a private current-thread
//! tokio runtime. Device handshakes block for up to a few seconds; on a dedicated
//! thread that stall never touches another device or the coordinator.
//!
//! ```text
//! coordinator ── Command ──> [daq-TMOS 1] runtime ── DeviceWorker::run
//!             <─ Response ──
//! ```
//!
//! The returned [`WorkerHandle`] owns the command sender. Dropping it (or calling
//! [`WorkerHandle::shutdown`]) closes the channel, which ends the worker loop after
//! a best-effort stop, close and log flush.

use crate::error::{AppResult, DaqError};
use crate::messages::{Command, Response, WorkerState};
use crate::worker::DeviceWorker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Spawns workers onto dedicated threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerHost;

impl WorkerHost {
    /// Start `worker` on a thread named `daq-<title>`.
    pub fn spawn(worker: DeviceWorker) -> AppResult<WorkerHandle> {
        let title = worker.title().to_string();
        let state = worker.state_receiver();
        let samples = worker.sample_counter();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread_title = title.clone();
        let join = std::thread::Builder::new()
            .name(format!("daq-{title}"))
            .spawn(move || {
                runtime.block_on(worker.run(command_rx, response_tx));
                tracing::debug!(device = %thread_title, "Worker thread exiting");
            })?;

        tracing::debug!(device = %title, "Worker thread spawned");
        Ok(WorkerHandle {
            title,
            commands: Some(command_tx),
            responses: Some(response_rx),
            state,
            samples,
            join: Some(join),
        })
    }
}

/// Control side of a hosted worker.
#[derive(Debug)]
pub struct WorkerHandle {
    title: String,
    commands: Option<mpsc::UnboundedSender<Command>>,
    responses: Option<mpsc::UnboundedReceiver<Response>>,
    state: watch::Receiver<WorkerState>,
    samples: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Device title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Queue a command without waiting. `false` if the worker is gone.
    pub fn send(&self, command: Command) -> bool {
        match &self.commands {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Queue a command, reporting a missing worker as an error.
    pub fn try_send(&self, command: Command) -> AppResult<()> {
        if self.send(command) {
            Ok(())
        } else {
            Err(DaqError::WorkerUnavailable(self.title.clone()))
        }
    }

    /// Take the response stream. Only the first call returns it.
    pub fn take_responses(&mut self) -> Option<mpsc::UnboundedReceiver<Response>> {
        self.responses.take()
    }

    /// Last published lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn state_watch(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Records written to the data log so far.
    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Close the command channel and wait for the thread to exit.
    pub async fn shutdown(mut self, timeout: Duration) -> AppResult<()> {
        self.commands = None;
        let Some(join) = self.join.take() else {
            return Ok(());
        };

        let title = self.title.clone();
        let waited = tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || join.join())).await;
        match waited {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(device = %title, "Worker shut down");
                Ok(())
            }
            Ok(Ok(Err(_))) => Err(DaqError::Instrument(format!("worker thread for '{title}' panicked"))),
            Ok(Err(e)) => Err(DaqError::Instrument(format!("join task for '{title}' failed: {e}"))),
            Err(_) => {
                tracing::warn!(device = %title, timeout_ms = timeout.as_millis() as u64, "Worker shutdown timed out, detaching thread");
                Err(DaqError::WorkerUnavailable(title))
            }
        }
    }
}
