//! Aggregating exit and stream events into one outcome

use crate::error::Error;
use crate::process::ExitStatus;
use crate::stdio::StdStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::debug;

/// What happened on one observed stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamReport {
    /// The child's stream this report covers
    pub stream: StdStream,
    /// Byte count of every data event, in arrival order
    pub chunks: Vec<usize>,
    /// Total bytes received
    pub bytes: usize,
    /// Whether end-of-stream was observed
    pub closed: bool,
    /// The read error that ended the stream, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The received bytes, when capturing is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured: Option<Vec<u8>>,
}

impl StreamReport {
    fn new(stream: StdStream, capture: bool) -> Self {
        Self {
            stream,
            chunks: Vec::new(),
            bytes: 0,
            closed: false,
            error: None,
            captured: capture.then(Vec::new),
        }
    }

    /// Returns true once EOF or a read error has been seen
    pub fn is_terminal(&self) -> bool {
        self.closed || self.error.is_some()
    }

    /// The captured bytes as text, if capturing was enabled
    pub fn captured_text(&self) -> Option<Cow<'_, str>> {
        self.captured.as_deref().map(String::from_utf8_lossy)
    }
}

/// Terminal result of one supervised run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnOutcome {
    /// The child's pid
    pub pid: u32,
    /// How the child ended; absent when the OS could not report it
    pub status: Option<ExitStatus>,
    /// Why the exit status is missing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_error: Option<String>,
    /// One report per stream piped to the supervisor
    pub streams: Vec<StreamReport>,
    /// Whether the deadline expired and the child was signalled
    pub timed_out: bool,
    /// When the child was spawned
    pub started_at: DateTime<Utc>,
    /// When the last terminal event arrived
    pub finished_at: DateTime<Utc>,
}

impl SpawnOutcome {
    /// True when every observed stream ended with EOF rather than an error
    pub fn captured_stream_closed(&self) -> bool {
        self.streams.iter().all(|report| report.closed)
    }

    /// The report for `stream`, if it was observed
    pub fn stream(&self, stream: StdStream) -> Option<&StreamReport> {
        self.streams.iter().find(|report| report.stream == stream)
    }

    /// `(exit_code, signal, captured_stream_closed)`, if the exit status is known
    pub fn as_tuple(&self) -> Option<(i64, i32, bool)> {
        let (code, signal) = self.status?.as_pair();
        Some((code, signal, self.captured_stream_closed()))
    }
}

/// Records terminal events as they arrive, in any order
///
/// The outcome is available once the exit and a terminal event for every
/// observed stream have been recorded. Each terminal event counts once;
/// repeats are ignored.
#[derive(Debug, Clone)]
pub struct OutcomeCollector {
    pid: Option<u32>,
    exit: Option<std::result::Result<ExitStatus, String>>,
    streams: Vec<StreamReport>,
    timed_out: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl OutcomeCollector {
    /// Expect terminal events for `observed`; keep the bytes when `capture` is set
    pub fn new(observed: impl IntoIterator<Item = StdStream>, capture: bool) -> Self {
        Self {
            pid: None,
            exit: None,
            streams: observed
                .into_iter()
                .map(|stream| StreamReport::new(stream, capture))
                .collect(),
            timed_out: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Note the spawned child
    pub fn record_spawn(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.started_at = Utc::now();
    }

    /// Note a data event
    pub fn record_chunk(&mut self, stream: StdStream, data: &[u8]) {
        if let Some(report) = self.open_report(stream) {
            report.chunks.push(data.len());
            report.bytes += data.len();
            if let Some(captured) = &mut report.captured {
                captured.extend_from_slice(data);
            }
        }
    }

    /// Note end-of-stream
    pub fn record_eof(&mut self, stream: StdStream) {
        if let Some(report) = self.open_report(stream) {
            report.closed = true;
            self.touch();
        }
    }

    /// Note a read failure that ended the stream
    pub fn record_read_error(&mut self, stream: StdStream, error: &Error) {
        if let Some(report) = self.open_report(stream) {
            report.error = Some(error.to_string());
            self.touch();
        }
    }

    /// Note the child's exit
    pub fn record_exit(&mut self, status: ExitStatus) {
        self.settle_exit(Ok(status));
    }

    /// Note that the child ended but its exit status could not be collected
    pub fn record_wait_failure(&mut self, error: &Error) {
        self.settle_exit(Err(error.to_string()));
    }

    fn settle_exit(&mut self, exit: std::result::Result<ExitStatus, String>) {
        if self.exit.is_none() {
            self.exit = Some(exit);
            self.touch();
        }
    }

    /// Note that the deadline fired
    pub fn record_timeout(&mut self) {
        self.timed_out = true;
    }

    /// Returns true once every expected terminal event has arrived
    pub fn is_complete(&self) -> bool {
        self.exit.is_some() && self.streams.iter().all(StreamReport::is_terminal)
    }

    /// The aggregated outcome, once complete
    pub fn outcome(&self) -> Option<SpawnOutcome> {
        if !self.is_complete() {
            return None;
        }
        let (status, wait_error) = match self.exit.clone()? {
            Ok(status) => (Some(status), None),
            Err(reason) => (None, Some(reason)),
        };
        Some(SpawnOutcome {
            pid: self.pid.unwrap_or_default(),
            status,
            wait_error,
            streams: self.streams.clone(),
            timed_out: self.timed_out,
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or(self.started_at),
        })
    }

    fn open_report(&mut self, stream: StdStream) -> Option<&mut StreamReport> {
        let report = self.streams.iter_mut().find(|report| report.stream == stream);
        match report {
            Some(report) if !report.is_terminal() => Some(report),
            Some(_) => {
                debug!(%stream, "ignoring event after terminal event");
                None
            }
            None => None,
        }
    }

    fn touch(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
