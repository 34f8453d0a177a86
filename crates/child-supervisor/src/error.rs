//! Error types for process supervision

use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::io;
use thiserror::Error;

/// Unified error type for supervision
#[derive(Error, Debug)]
pub enum Error {
    /// The OS could not allocate or register a pipe endpoint
    #[error("failed to create pipe channel: {source}")]
    ChannelInit {
        /// The underlying OS error, unchanged
        source: io::Error,
    },

    /// The OS rejected process creation
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        /// The program that could not be started
        program: String,
        /// The underlying OS error, unchanged
        source: io::Error,
    },

    /// A read on a pipe channel failed with something other than end-of-stream
    #[error("failed to read from pipe channel: {source}")]
    ChannelRead {
        /// The underlying OS error
        source: io::Error,
    },

    /// The spawn request itself was malformed
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request
        reason: String,
    },

    /// A stdio slot could not be turned into a child descriptor
    #[error("invalid stdio configuration for {stream}: {reason}")]
    InvalidStdio {
        /// The slot name (stdin, stdout or stderr)
        stream: &'static str,
        /// What was wrong with the slot
        reason: String,
    },

    /// Reads were requested on a channel the child reads from
    #[error("pipe channel is not readable by the supervisor")]
    ChannelNotReadable,

    /// Reads were requested on a channel that is already reading
    #[error("pipe channel is already reading")]
    ChannelBusy,

    /// The channel has been closed
    #[error("pipe channel is closed")]
    ChannelClosed,

    /// A signal was requested for a process that already exited
    #[error("process {pid} has already exited")]
    ProcessExited {
        /// The pid the process had while running
        pid: u32,
    },

    /// The OS could not report how a running child ended
    #[error("failed to wait for process {pid}: {source}")]
    WaitFailed {
        /// The child that was being waited on
        pid: u32,
        /// The underlying OS error, unchanged
        source: io::Error,
    },

    /// Failed to send signal to process
    #[error("failed to send {signal}: {errno}")]
    SignalFailed {
        /// The signal that could not be delivered
        signal: Signal,
        /// The errno reported by `kill(2)`
        #[source]
        errno: Errno,
    },

    /// The reactor drained before every terminal event was recorded
    #[error("supervision ended before the child and its streams finished")]
    Incomplete,

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid stdio error for the named slot
    pub fn invalid_stdio(stream: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidStdio {
            stream,
            reason: reason.into(),
        }
    }

    /// The raw OS error code behind this error, if there is one
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::ChannelInit { source }
            | Error::SpawnFailed { source, .. }
            | Error::ChannelRead { source }
            | Error::WaitFailed { source, .. } => source.raw_os_error(),
            Error::SignalFailed { errno, .. } => Some(*errno as i32),
            _ => None,
        }
    }

    /// Returns true for errors raised before any process existed
    pub fn is_init_error(&self) -> bool {
        matches!(
            self,
            Error::ChannelInit { .. }
                | Error::SpawnFailed { .. }
                | Error::InvalidArgument { .. }
                | Error::InvalidStdio { .. }
                | Error::Config(_)
        )
    }
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),

    /// Failed to parse YAML
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
