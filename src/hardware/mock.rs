//! Mock Device Interface
//!
//! Scripted device for tests and hardware-free dry runs. No I/O is performed;
//! every lifecycle call succeeds unless the script says otherwise.
//!
//! # Script
//!
//! - `fail_open` / `fail_start` / `fail_stop` / `fail_close` - make that call return an error
//! - `then(PollStep)` - queue the outcome of the next poll
//! - `lose_connection_on_poll(n)` - poll `n` (1-based) and every later poll report
//!   `LostConnection`
//! - `generating()` - once the queue is empty, every poll yields one sample whose only
//!   field is the poll number
//!
//! A [`MockProbe`] taken before the interface is boxed observes it from the test:
//! poll count and the ordered list of lifecycle calls.
//!
//! # Example
//!
//! ```rust
//! use telemetry_daq::hardware::{DeviceKind, MockInterface, MockScript};
//!
//! let mock = MockInterface::new(
//!     DeviceKind::Sensor,
//!     MockScript::default().generating().lose_connection_on_poll(5),
//! );
//! let probe = mock.probe();
//! assert_eq!(probe.poll_count(), 0);
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::serial::parse_frame;
use crate::hardware::{DeviceInterface, DeviceKind, PollOutcome, ReferenceClock, SampleMode};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Outcome of one scripted poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    /// A raw serial frame, parsed with the serial framing rules
    Frame(String),
    /// Records delivered as-is (several records model one motion-capture frame)
    Records(Vec<Vec<String>>),
    /// No data on this poll
    Nothing,
    /// Transport loss on this poll
    Lost,
}

/// Behaviour of a [`MockInterface`].
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    fail_open: bool,
    fail_start: bool,
    fail_stop: bool,
    fail_close: bool,
    generate: bool,
    lose_on_poll: Option<usize>,
    steps: VecDeque<PollStep>,
}

impl MockScript {
    /// Make `open` fail.
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Make `start` fail.
    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Make `stop` fail.
    pub fn fail_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    /// Make `close` fail.
    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Produce a sample on every poll once the queue is exhausted.
    pub fn generating(mut self) -> Self {
        self.generate = true;
        self
    }

    /// Report `LostConnection` from poll `n` onwards.
    pub fn lose_connection_on_poll(mut self, n: usize) -> Self {
        self.lose_on_poll = Some(n);
        self
    }

    /// Queue one poll outcome.
    pub fn then(mut self, step: PollStep) -> Self {
        self.steps.push_back(step);
        self
    }

    /// Queue one raw frame per line.
    pub fn frames<I, S>(mut self, frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps
            .extend(frames.into_iter().map(|f| PollStep::Frame(f.into())));
        self
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    polls: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

/// Observer of a [`MockInterface`].
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    state: Arc<ProbeState>,
}

impl MockProbe {
    /// Number of `poll` calls so far.
    pub fn poll_count(&self) -> usize {
        self.state.polls.load(Ordering::SeqCst)
    }

    /// Lifecycle calls so far, e.g. `["open /dev/ttyX", "start", "stop"]`.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.state.calls.lock() {
            calls.push(call);
        }
    }
}

/// Scripted device interface.
pub struct MockInterface {
    kind: DeviceKind,
    script: MockScript,
    open: bool,
    mode: SampleMode,
    clock: ReferenceClock,
    probe: MockProbe,
}

impl MockInterface {
    /// Closed mock of the given kind.
    pub fn new(kind: DeviceKind, script: MockScript) -> Self {
        Self {
            kind,
            script,
            open: false,
            mode: SampleMode::default(),
            clock: ReferenceClock::now(),
            probe: MockProbe::default(),
        }
    }

    /// Observer sharing this mock's counters.
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    fn scripted(&self, fail: bool, call: &str) -> AppResult<()> {
        if fail {
            Err(DaqError::Instrument(format!("mock {call} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceInterface for MockInterface {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn mode(&self) -> SampleMode {
        self.mode
    }

    async fn open(&mut self, port: &str) -> AppResult<()> {
        self.probe.record(format!("open {port}"));
        // A reopen replaces the stale transport
        self.open = false;
        self.scripted(self.script.fail_open, "open")?;
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.probe.record("close".to_string());
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.scripted(self.script.fail_close, "close")
    }

    async fn start(&mut self) -> AppResult<()> {
        self.probe.record("start".to_string());
        if !self.open {
            return Err(DaqError::Instrument("mock not open".to_string()));
        }
        self.scripted(self.script.fail_start, "start")
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.probe.record("stop".to_string());
        self.scripted(self.script.fail_stop, "stop")
    }

    async fn set_mode(&mut self, mode: u8) -> AppResult<()> {
        self.mode = SampleMode::try_from(mode)?;
        Ok(())
    }

    async fn poll(&mut self) -> PollOutcome {
        let n = self.probe.state.polls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.script.lose_on_poll.is_some_and(|lost| n >= lost) {
            self.open = false;
            return PollOutcome::LostConnection;
        }

        match self.script.steps.pop_front() {
            Some(PollStep::Frame(line)) => match parse_frame(&line) {
                Some(fields) => PollOutcome::Samples(vec![self.clock.stamp(fields)]),
                None => {
                    tracing::debug!(frame = %line, "Wrong data received, skipping");
                    PollOutcome::NoData
                }
            },
            Some(PollStep::Records(records)) => {
                let elapsed_ms = self.clock.elapsed_ms();
                PollOutcome::Samples(
                    records
                        .into_iter()
                        .map(|fields| crate::hardware::Sample { elapsed_ms, fields })
                        .collect(),
                )
            }
            Some(PollStep::Nothing) => PollOutcome::NoData,
            Some(PollStep::Lost) => {
                self.open = false;
                PollOutcome::LostConnection
            }
            None if self.script.generate => {
                PollOutcome::Samples(vec![self.clock.stamp(vec![n.to_string()])])
            }
            None => PollOutcome::NoData,
        }
    }

    fn set_reference_time(&mut self, t0: Instant) {
        self.clock.rebase(t0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_twice_succeeds_both_times() {
        let mut mock = MockInterface::new(DeviceKind::Sensor, MockScript::default());
        let probe = mock.probe();

        mock.open("/dev/ttyX").await.unwrap();
        assert!(mock.close().await.is_ok());
        assert!(mock.close().await.is_ok());
        assert_eq!(probe.calls(), vec!["open /dev/ttyX", "close", "close"]);
    }

    #[tokio::test]
    async fn scripted_polls_then_loss() {
        let mut mock = MockInterface::new(
            DeviceKind::Sensor,
            MockScript::default()
                .frames(["a\t1\t2\t3\t4\t5\t6\t7\t8\tz", "short\tline"])
                .generating()
                .lose_connection_on_poll(4),
        );
        mock.open("/dev/ttyX").await.unwrap();

        match mock.poll().await {
            PollOutcome::Samples(samples) => {
                assert_eq!(samples[0].fields, vec!["1", "2", "3", "4", "5", "6", "7", "8"])
            }
            other => panic!("expected a sample, got {other:?}"),
        }
        assert_eq!(mock.poll().await, PollOutcome::NoData);
        assert!(matches!(mock.poll().await, PollOutcome::Samples(_)));
        assert_eq!(mock.poll().await, PollOutcome::LostConnection);
        assert_eq!(mock.poll().await, PollOutcome::LostConnection);
        assert_eq!(mock.probe().poll_count(), 5);
    }

    #[tokio::test]
    async fn invalid_mode_keeps_previous_mode() {
        let mut mock = MockInterface::new(DeviceKind::Sensor, MockScript::default());
        mock.set_mode(1).await.unwrap();
        assert!(mock.set_mode(2).await.is_err());
        assert_eq!(mock.mode(), SampleMode::Fast);
    }
}
