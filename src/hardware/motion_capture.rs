//! Motion-capture interface.
//!
//! The motion-capture system is reached through a [`MocapClient`]. Opening first
//! probes the data port (801) with a short TCP connect so an absent system fails in
//! 100 ms instead of hanging inside the client. Every new frame produces one sample
//! per tracked subject, in frame order:
//!
//! ```text
//! <name>,<x>,<y>,<z>     position resolved (two decimals)
//! <name>,0,0,0           subject occluded
//! ```
//!
//! [`BridgeClient`] is the shipped client. It reads newline-delimited JSON frames
//! from a bridge process that republishes the vendor stream:
//!
//! ```text
//! {"frame": 1042, "subjects": [{"name": "Wand", "position": [12.5, -3.0, 990.25]}]}
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::line_io::{LineBuffer, ReadOutcome};
use crate::hardware::socket::{connect_with_timeout, split_host_port};
use crate::hardware::{DeviceInterface, DeviceKind, PollOutcome, ReferenceClock, SampleMode};
use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Data port of the motion-capture system.
pub const MOCAP_PORT: u16 = 801;

const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
const BRIDGE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_millis(1000);
const FIRST_FRAME_RETRY: Duration = Duration::from_millis(10);

/// One tracked subject in a frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MocapSubject {
    /// Subject name as configured in the motion-capture system
    pub name: String,
    /// Global translation in millimetres, `None` when occluded
    #[serde(default)]
    pub position: Option<[f64; 3]>,
}

/// One motion-capture frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MocapFrame {
    /// Frame counter
    #[serde(rename = "frame")]
    pub number: u64,
    /// Subjects, in system order
    #[serde(default)]
    pub subjects: Vec<MocapSubject>,
}

impl MocapSubject {
    fn fields(&self) -> Vec<String> {
        match self.position {
            Some([x, y, z]) => vec![
                self.name.clone(),
                format!("{x:.2}"),
                format!("{y:.2}"),
                format!("{z:.2}"),
            ],
            None => vec![
                self.name.clone(),
                "0".to_string(),
                "0".to_string(),
                "0".to_string(),
            ],
        }
    }
}

/// Access to a motion-capture data stream.
#[async_trait]
pub trait MocapClient: Send {
    /// Connect to the system at `host`.
    async fn connect(&mut self, host: &str) -> AppResult<()>;

    /// Drop the connection. Succeeds when already disconnected.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Whether the client holds a connection.
    fn is_connected(&self) -> bool;

    /// Newest frame received since the last call, without waiting.
    ///
    /// `Ok(None)` means no new frame. An error means the stream is gone.
    async fn fetch_frame(&mut self) -> AppResult<Option<MocapFrame>>;
}

/// Client for the JSON-lines frame bridge.
#[derive(Debug, Default)]
pub struct BridgeClient {
    stream: Option<TcpStream>,
    lines: LineBuffer,
}

impl BridgeClient {
    /// Disconnected client.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MocapClient for BridgeClient {
    async fn connect(&mut self, host: &str) -> AppResult<()> {
        let (host, port) = split_host_port(host, MOCAP_PORT);
        let stream = connect_with_timeout(&host, port, BRIDGE_CONNECT_TIMEOUT).await?;
        self.stream = Some(stream);
        self.lines.clear();
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.lines.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "Bridge shutdown failed");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn fetch_frame(&mut self) -> AppResult<Option<MocapFrame>> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            DaqError::Instrument("motion-capture bridge not connected".to_string())
        })?;

        let mut newest: Option<MocapFrame> = None;
        loop {
            match self.lines.try_read_line(stream) {
                Ok(ReadOutcome::Line(line)) if line.trim().is_empty() => {}
                Ok(ReadOutcome::Line(line)) => match serde_json::from_str::<MocapFrame>(&line) {
                    Ok(frame) => newest = Some(frame),
                    Err(e) => tracing::warn!(error = %e, "Malformed motion-capture frame"),
                },
                Ok(ReadOutcome::Empty) => return Ok(newest),
                Ok(ReadOutcome::Closed) => {
                    self.stream = None;
                    return Err(DaqError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "motion-capture bridge closed the stream",
                    )));
                }
                Err(e) => {
                    self.stream = None;
                    return Err(e.into());
                }
            }
        }
    }
}

/// Motion-capture system driven through a [`MocapClient`].
pub struct MotionCaptureInterface {
    client: Box<dyn MocapClient>,
    host: Option<String>,
    mode: SampleMode,
    clock: ReferenceClock,
    probe_timeout: Duration,
    first_frame_timeout: Duration,
}

impl MotionCaptureInterface {
    /// Interface using the JSON-lines bridge.
    pub fn new(mode: SampleMode) -> Self {
        Self::with_client(Box::new(BridgeClient::new()), mode)
    }

    /// Interface using a custom client.
    pub fn with_client(client: Box<dyn MocapClient>, mode: SampleMode) -> Self {
        Self {
            client,
            host: None,
            mode,
            clock: ReferenceClock::now(),
            probe_timeout: PROBE_TIMEOUT,
            first_frame_timeout: FIRST_FRAME_TIMEOUT,
        }
    }
}

/// Cheap reachability check on the data port.
async fn probe(host: &str, budget: Duration) -> AppResult<()> {
    let (host, port) = split_host_port(host, MOCAP_PORT);
    let stream = connect_with_timeout(&host, port, budget).await?;
    drop(stream);
    Ok(())
}

#[async_trait]
impl DeviceInterface for MotionCaptureInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::MotionCapture
    }

    fn is_open(&self) -> bool {
        self.client.is_connected()
    }

    fn mode(&self) -> SampleMode {
        self.mode
    }

    async fn open(&mut self, port: &str) -> AppResult<()> {
        if self.client.is_connected() {
            self.client.disconnect().await?;
        }

        if let Err(e) = probe(port, self.probe_timeout).await {
            tracing::debug!(host = port, error = %e, "Motion-capture system unreachable");
            return Err(e);
        }

        self.client.connect(port).await?;
        self.host = Some(port.to_string());
        tracing::debug!(host = port, "Motion-capture client connected");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if !self.client.is_connected() {
            return Ok(());
        }
        tracing::debug!(host = ?self.host, "Disconnecting motion-capture client");
        self.client.disconnect().await
    }

    async fn start(&mut self) -> AppResult<()> {
        if !self.client.is_connected() {
            return Err(DaqError::Instrument(
                "motion-capture client not connected".to_string(),
            ));
        }

        // Started once the system delivers a frame
        let deadline = Instant::now() + self.first_frame_timeout;
        loop {
            if self.client.fetch_frame().await?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaqError::HandshakeTimeout {
                    expected: "motion-capture frame".to_string(),
                    timeout_ms: u64::try_from(self.first_frame_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(FIRST_FRAME_RETRY).await;
        }
    }

    async fn stop(&mut self) -> AppResult<()> {
        if !self.client.is_connected() {
            return Err(DaqError::Instrument(
                "motion-capture client not connected".to_string(),
            ));
        }
        // Drop whatever queued up so the next start sees fresh frames
        let _ = self.client.fetch_frame().await?;
        Ok(())
    }

    async fn set_mode(&mut self, mode: u8) -> AppResult<()> {
        self.mode = SampleMode::try_from(mode)?;
        Ok(())
    }

    async fn poll(&mut self) -> PollOutcome {
        match self.client.fetch_frame().await {
            Ok(Some(frame)) if frame.subjects.is_empty() => PollOutcome::NoData,
            Ok(Some(frame)) => {
                let elapsed_ms = self.clock.elapsed_ms();
                let samples = frame
                    .subjects
                    .iter()
                    .map(|subject| crate::hardware::Sample {
                        elapsed_ms,
                        fields: subject.fields(),
                    })
                    .collect();
                PollOutcome::Samples(samples)
            }
            Ok(None) => PollOutcome::NoData,
            Err(e) => {
                tracing::warn!(host = ?self.host, error = %e, "Motion-capture frame fetch failed");
                PollOutcome::LostConnection
            }
        }
    }

    fn set_reference_time(&mut self, t0: Instant) {
        self.clock.rebase(t0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::net::TcpListener;

    /// Client fed from a script of fetch results.
    struct ScriptedClient {
        connected: bool,
        fetches: VecDeque<AppResult<Option<MocapFrame>>>,
    }

    #[async_trait]
    impl MocapClient for ScriptedClient {
        async fn connect(&mut self, _host: &str) -> AppResult<()> {
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> AppResult<()> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn fetch_frame(&mut self) -> AppResult<Option<MocapFrame>> {
            self.fetches.pop_front().unwrap_or(Ok(None))
        }
    }

    fn frame(number: u64, subjects: &[(&str, Option<[f64; 3]>)]) -> MocapFrame {
        MocapFrame {
            number,
            subjects: subjects
                .iter()
                .map(|(name, position)| MocapSubject {
                    name: name.to_string(),
                    position: *position,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn one_poll_yields_one_sample_per_subject() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let client = ScriptedClient {
            connected: false,
            fetches: VecDeque::from(vec![
                Ok(Some(frame(1, &[]))),
                Ok(Some(frame(
                    2,
                    &[("Wand", Some([12.5, -3.0, 990.257])), ("Hat", None)],
                ))),
                Ok(None),
                Err(DaqError::Instrument("stream lost".into())),
            ]),
        };
        let mut device = MotionCaptureInterface::with_client(Box::new(client), SampleMode::Slow);

        device.open(&address).await.unwrap();
        device.start().await.unwrap();

        match device.poll().await {
            PollOutcome::Samples(samples) => {
                assert_eq!(samples.len(), 2);
                assert_eq!(samples[0].fields, vec!["Wand", "12.50", "-3.00", "990.26"]);
                assert_eq!(samples[1].fields, vec!["Hat", "0", "0", "0"]);
                assert_eq!(samples[0].elapsed_ms, samples[1].elapsed_ms);
            }
            other => panic!("expected samples, got {other:?}"),
        }
        assert_eq!(device.poll().await, PollOutcome::NoData);
        assert_eq!(device.poll().await, PollOutcome::LostConnection);
    }

    #[tokio::test]
    async fn unreachable_system_fails_probe_without_connecting_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = ScriptedClient {
            connected: false,
            fetches: VecDeque::new(),
        };
        let mut device = MotionCaptureInterface::with_client(Box::new(client), SampleMode::Slow);

        assert!(device.open(&address).await.is_err());
        assert!(!device.is_open());
        assert!(device.close().await.is_ok());
    }

    #[tokio::test]
    async fn bridge_client_keeps_newest_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let mut client = BridgeClient::new();
        client.connect(&address).await.unwrap();
        let (mut bridge, _) = listener.accept().await.unwrap();

        bridge
            .write_all(
                b"{\"frame\":1,\"subjects\":[]}\n\
                  not json\n\
                  {\"frame\":2,\"subjects\":[{\"name\":\"Wand\",\"position\":null}]}\n",
            )
            .await
            .unwrap();
        bridge.flush().await.unwrap();

        let mut newest = None;
        for _ in 0..200 {
            if let Some(frame) = client.fetch_frame().await.unwrap() {
                newest = Some(frame);
                if newest.as_ref().map(|f| f.number) == Some(2) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let newest = newest.unwrap();
        assert_eq!(newest.number, 2);
        assert_eq!(newest.subjects[0].position, None);

        drop(bridge);
        let mut result = client.fetch_frame().await;
        for _ in 0..200 {
            if result.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            result = client.fetch_frame().await;
        }
        assert!(result.is_err());
        assert!(!client.is_connected());
    }
}
