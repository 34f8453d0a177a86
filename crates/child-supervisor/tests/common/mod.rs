//! Shared helpers for supervision tests

#![allow(dead_code)]

use child_supervisor::{Error, ExitStatus, OutputSink, Signal, StdStream};
use std::cell::RefCell;
use std::rc::Rc;

/// One event as seen by a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Spawn(u32),
    Chunk(StdStream, Vec<u8>),
    Eof(StdStream),
    ReadError(StdStream),
    Timeout(Signal),
    Exit(ExitStatus),
    WaitError,
}

/// Sink that keeps every event in arrival order
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Rc<RefCell<Vec<Recorded>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.borrow().clone()
    }

    pub fn chunks(&self, stream: StdStream) -> Vec<Vec<u8>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Recorded::Chunk(s, data) if *s == stream => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn exits(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|event| matches!(event, Recorded::Exit(_)))
            .count()
    }

    fn push(&self, event: Recorded) {
        self.events.borrow_mut().push(event);
    }
}

impl OutputSink for RecordingSink {
    fn on_spawn(&mut self, pid: u32) {
        self.push(Recorded::Spawn(pid));
    }

    fn on_chunk(&mut self, stream: StdStream, data: &[u8]) {
        self.push(Recorded::Chunk(stream, data.to_vec()));
    }

    fn on_eof(&mut self, stream: StdStream) {
        self.push(Recorded::Eof(stream));
    }

    fn on_read_error(&mut self, stream: StdStream, _error: &Error) {
        self.push(Recorded::ReadError(stream));
    }

    fn on_timeout(&mut self, signal: Signal) {
        self.push(Recorded::Timeout(signal));
    }

    fn on_exit(&mut self, status: ExitStatus) {
        self.push(Recorded::Exit(status));
    }

    fn on_wait_error(&mut self, _error: &Error) {
        self.push(Recorded::WaitError);
    }
}

/// Returns true while `pid` names a process we could signal
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}
