//! Consumers of supervision events

use crate::error::Error;
use crate::process::ExitStatus;
use crate::stdio::StdStream;
use nix::sys::signal::Signal;

/// Receives everything a supervision observes, as it happens
///
/// All methods run on the reactor thread. Data slices are only valid for the
/// duration of the call; copy what you need to keep.
pub trait OutputSink {
    /// The child is running
    fn on_spawn(&mut self, _pid: u32) {}

    /// Bytes arrived on `stream`
    fn on_chunk(&mut self, _stream: StdStream, _data: &[u8]) {}

    /// `stream` reached end-of-stream
    fn on_eof(&mut self, _stream: StdStream) {}

    /// Reading `stream` failed; nothing more arrives on it
    fn on_read_error(&mut self, _stream: StdStream, _error: &Error) {}

    /// The deadline expired and `signal` was sent to the child
    fn on_timeout(&mut self, _signal: Signal) {}

    /// The child exited
    fn on_exit(&mut self, _status: ExitStatus) {}

    /// The child ended but its exit status could not be collected
    fn on_wait_error(&mut self, _error: &Error) {}
}

/// A sink that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl OutputSink for NoOpSink {}
