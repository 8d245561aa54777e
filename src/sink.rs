//! Live-telemetry sink.
//!
//! Workers forward every logged record to an external consumer (typically a live
//! plotter) over a single pipe. One text line per record:
//!
//! ```text
//! <device_title>\t<device_type_code>\t<elapsed_ms>,<field_1>,...,<field_k>\n
//! ```
//!
//! Type codes: `0` unknown, `1` sensor, `2` motion capture. Lines are flushed one by
//! one so the consumer sees them as they arrive.
//!
//! All workers share one writer task through a bounded channel. Forwarding never
//! blocks a worker: a full queue drops the record, and once the writer has died
//! (the consumer closed the pipe) each worker disables its own forwarding for good
//! and says so once in the log. File logging is not affected.

use crate::config::SinkConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::DeviceKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// One record on its way to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    /// Device title
    pub title: String,
    /// Device type
    pub kind: DeviceKind,
    /// Comma-joined log line, elapsed time first
    pub line: String,
}

impl SinkRecord {
    /// Wire form, newline included.
    pub fn to_wire(&self) -> String {
        format!("{}\t{}\t{}\n", self.title, self.kind.code(), self.line)
    }
}

/// Cloneable handle feeding the writer task.
#[derive(Debug, Clone)]
pub struct SinkSender {
    tx: mpsc::Sender<SinkRecord>,
}

/// Per-worker forwarding state.
#[derive(Debug)]
pub struct SinkForwarder {
    sender: Option<SinkSender>,
    title: String,
    kind: DeviceKind,
    enabled: bool,
    broken: bool,
    dropped: u64,
}

impl SinkForwarder {
    /// Forwarder for one device. Without a sender every record is ignored.
    pub fn new(sender: Option<SinkSender>, title: impl Into<String>, kind: DeviceKind, enabled: bool) -> Self {
        Self {
            sender,
            title: title.into(),
            kind,
            enabled,
            broken: false,
            dropped: 0,
        }
    }

    /// Turn forwarding on or off. A broken pipe stays broken.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether records are currently being forwarded.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.broken && self.sender.is_some()
    }

    /// Whether the pipe broke for this device.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue `line` without waiting.
    pub fn forward(&mut self, line: &str) {
        if !self.is_active() {
            return;
        }
        let Some(sender) = self.sender.as_ref() else {
            return;
        };

        let record = SinkRecord {
            title: self.title.clone(),
            kind: self.kind,
            line: line.to_string(),
        };
        match sender.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::debug!(device = %self.title, dropped = self.dropped, "Sink queue full, record dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.broken = true;
                self.sender = None;
                tracing::warn!(device = %self.title, "Live sink closed; forwarding disabled for this device");
            }
        }
    }
}

/// Running writer task plus the consumer process it feeds, if any.
#[derive(Debug)]
pub struct SinkHandle {
    task: JoinHandle<AppResult<u64>>,
    child: Option<Child>,
}

impl SinkHandle {
    /// Wait for the writer to drain and exit, then reap the consumer.
    ///
    /// The writer exits once every [`SinkSender`] is dropped. Returns the number of
    /// records written.
    pub async fn shutdown(mut self, timeout: Duration) -> AppResult<u64> {
        let written = match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(DaqError::Instrument(format!("sink writer panicked: {e}"))),
            Err(_) => {
                tracing::warn!("Sink writer did not finish in time, aborting");
                self.task.abort();
                Ok(0)
            }
        };

        if let Some(mut child) = self.child.take() {
            // The writer owned stdin; the consumer sees EOF and should exit
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "Sink consumer exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for sink consumer"),
                Err(_) => {
                    tracing::warn!("Sink consumer still running, killing it");
                    child.kill().await?;
                }
            }
        }

        written
    }
}

/// Spawn the writer task on `writer`.
///
/// `capacity` bounds the records queued between workers and the pipe.
pub fn spawn_sink_writer<W>(writer: W, capacity: usize) -> (SinkSender, JoinHandle<AppResult<u64>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<SinkRecord>(capacity.max(1));

    let task = tokio::spawn(async move {
        let mut writer = writer;
        let mut written = 0u64;

        while let Some(record) = rx.recv().await {
            let wire = record.to_wire();
            let result = async {
                writer.write_all(wire.as_bytes()).await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, written, "Live sink pipe broken");
                return Err(DaqError::Io(e));
            }
            written += 1;
        }

        tracing::debug!(written, "Live sink writer finished");
        Ok(written)
    });

    (SinkSender { tx }, task)
}

/// Start the sink described by `config`.
///
/// Returns `None` when the sink is disabled. An empty `command` writes to stdout;
/// otherwise the command is spawned and records go to its stdin.
pub fn open_sink(config: &SinkConfig) -> AppResult<Option<(SinkSender, SinkHandle)>> {
    if !config.enabled {
        return Ok(None);
    }

    let Some((program, args)) = config.command.split_first() else {
        tracing::info!("Live sink writing to stdout");
        let (sender, task) = spawn_sink_writer(tokio::io::stdout(), config.capacity);
        return Ok(Some((sender, SinkHandle { task, child: None })));
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| DaqError::Instrument(format!("sink consumer '{program}' has no stdin")))?;

    tracing::info!(program = %program, "Live sink consumer started");
    let (sender, task) = spawn_sink_writer(stdin, config.capacity);
    Ok(Some((
        sender,
        SinkHandle {
            task,
            child: Some(child),
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tracing_test::traced_test;

    #[test]
    fn wire_format_is_tab_separated_triple() {
        let record = SinkRecord {
            title: "TMOS 1".into(),
            kind: DeviceKind::Sensor,
            line: "10,812,24.5".into(),
        };
        assert_eq!(record.to_wire(), "TMOS 1\t1\t10,812,24.5\n");
    }

    #[tokio::test]
    async fn records_from_two_devices_share_one_pipe() {
        let (writer, reader) = tokio::io::duplex(1024);
        let (sender, task) = spawn_sink_writer(writer, 16);

        let mut sensor = SinkForwarder::new(Some(sender.clone()), "TMOS 1", DeviceKind::Sensor, true);
        let mut vicon = SinkForwarder::new(Some(sender), "Vicon", DeviceKind::MotionCapture, true);
        sensor.forward("10,1,2");
        vicon.forward("12,Wand,0,0,0");
        sensor.set_enabled(false);
        sensor.forward("20,3,4");
        drop(sensor);
        drop(vicon);

        let written = task.await.unwrap().unwrap();
        assert_eq!(written, 2);

        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "TMOS 1\t1\t10,1,2");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "Vicon\t2\t12,Wand,0,0,0");
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn broken_pipe_disables_forwarding_once() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);
        let (sender, task) = spawn_sink_writer(writer, 4);

        let mut forwarder = SinkForwarder::new(Some(sender), "TMOS 2", DeviceKind::Sensor, true);
        forwarder.forward("10,1");
        assert!(task.await.unwrap().is_err());

        forwarder.forward("20,2");
        forwarder.forward("30,3");
        assert!(forwarder.is_broken());
        assert!(!forwarder.is_active());

        // Re-enabling does not revive a broken pipe
        forwarder.set_enabled(true);
        assert!(!forwarder.is_active());
        assert!(logs_contain("forwarding disabled for this device"));
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (writer, _reader) = tokio::io::duplex(1);
        let (sender, _task) = spawn_sink_writer(writer, 1);

        let mut forwarder = SinkForwarder::new(Some(sender), "TMOS 3", DeviceKind::Sensor, true);
        for i in 0..50 {
            forwarder.forward(&format!("{i},0"));
        }
        assert!(forwarder.dropped() > 0);
        assert!(forwarder.is_active());
    }

    #[test]
    fn disabled_config_opens_nothing() {
        let config = SinkConfig::default();
        assert!(open_sink(&config).unwrap().is_none());
    }
}
