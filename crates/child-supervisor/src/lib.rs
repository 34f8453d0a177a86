//! Event-driven supervision of a single child process
//!
//! This crate spawns one child with a configurable stdio layout, reads the
//! child's piped output in bounded chunks on a single-threaded reactor, and
//! correlates the child's exit with end-of-stream on every piped stream.
//! Exit and EOF may arrive in either order; the outcome is only reported
//! once both have been observed.

#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!("child-supervisor only supports Unix platforms");

pub mod channel;
pub mod config;
pub mod error;
pub mod outcome;
pub mod process;
pub mod reactor;
pub mod sink;
pub mod stdio;
pub mod supervisor;

pub use channel::{
    ChannelEvent, ChannelState, DEFAULT_READ_BUFFER_SIZE, PipeChannel, PipeDirection, ReadBuffer,
};
pub use config::{SlotConfig, StdioConfig, SupervisorConfig};
pub use error::{ConfigError, Error, Result};
pub use outcome::{OutcomeCollector, SpawnOutcome, StreamReport};
pub use process::{ExitStatus, ProcessHandle, ProcessOptions, ProcessState};
pub use reactor::{HandleId, HandleKind, Reactor};
pub use sink::{NoOpSink, OutputSink};
pub use stdio::{StdStream, StdioSlot, StdioSpec};
pub use supervisor::{Supervision, Supervisor};

pub use nix::sys::signal::Signal;
