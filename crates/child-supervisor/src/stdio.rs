//! The child's stdio redirection table

use crate::channel::PipeChannel;
use crate::error::{Error, Result};
use nix::fcntl::{FcntlArg, fcntl};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;

/// One of the child's three standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    /// Descriptor 0
    Stdin,
    /// Descriptor 1
    Stdout,
    /// Descriptor 2
    Stderr,
}

impl StdStream {
    /// All streams in descriptor order
    pub const ALL: [StdStream; 3] = [StdStream::Stdin, StdStream::Stdout, StdStream::Stderr];

    /// The descriptor number this stream has in the child
    pub fn fd(self) -> RawFd {
        self.index() as RawFd
    }

    /// Lowercase name of the stream
    pub fn name(self) -> &'static str {
        match self {
            StdStream::Stdin => "stdin",
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }

    fn index(self) -> usize {
        match self {
            StdStream::Stdin => 0,
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How one of the child's streams is connected
#[derive(Debug, Clone, Default)]
pub enum StdioSlot {
    /// The child gets the null device
    #[default]
    Ignore,
    /// The child shares the supervisor's descriptor `n`
    InheritFd(RawFd),
    /// The child gets one end of the channel's pipe
    CreatePipe(PipeChannel),
}

impl StdioSlot {
    /// The channel behind a `CreatePipe` slot
    pub fn pipe(&self) -> Option<&PipeChannel> {
        match self {
            StdioSlot::CreatePipe(channel) => Some(channel),
            _ => None,
        }
    }
}

/// Redirection table for stdin, stdout and stderr, in that order
#[derive(Debug, Clone, Default)]
pub struct StdioSpec {
    slots: [StdioSlot; 3],
}

impl StdioSpec {
    /// Build a table from its three slots
    pub fn new(stdin: StdioSlot, stdout: StdioSlot, stderr: StdioSlot) -> Self {
        Self {
            slots: [stdin, stdout, stderr],
        }
    }

    /// A table where the child shares all three of the supervisor's streams
    pub fn inherit_all() -> Self {
        Self::new(
            StdioSlot::InheritFd(0),
            StdioSlot::InheritFd(1),
            StdioSlot::InheritFd(2),
        )
    }

    /// Replace one slot
    pub fn set(&mut self, stream: StdStream, slot: StdioSlot) -> &mut Self {
        self.slots[stream.index()] = slot;
        self
    }

    /// The slot for `stream`
    pub fn slot(&self, stream: StdStream) -> &StdioSlot {
        &self.slots[stream.index()]
    }

    /// Every piped slot with its channel, in descriptor order
    pub fn channels(&self) -> impl Iterator<Item = (StdStream, &PipeChannel)> + '_ {
        StdStream::ALL
            .into_iter()
            .filter_map(|stream| self.slot(stream).pipe().map(|channel| (stream, channel)))
    }

    /// Turn the table into the descriptors the child will receive
    ///
    /// Piped slots give up their child end here, so a channel can back at
    /// most one spawn.
    pub(crate) fn to_child_stdio(&self) -> Result<[Stdio; 3]> {
        Ok([
            child_stdio(StdStream::Stdin, self.slot(StdStream::Stdin))?,
            child_stdio(StdStream::Stdout, self.slot(StdStream::Stdout))?,
            child_stdio(StdStream::Stderr, self.slot(StdStream::Stderr))?,
        ])
    }
}

fn child_stdio(stream: StdStream, slot: &StdioSlot) -> Result<Stdio> {
    match slot {
        StdioSlot::Ignore => Ok(Stdio::null()),
        StdioSlot::InheritFd(fd) if *fd < 0 => Err(Error::invalid_stdio(
            stream.name(),
            format!("descriptor {fd} is negative"),
        )),
        StdioSlot::InheritFd(fd) if *fd == stream.fd() => Ok(Stdio::inherit()),
        StdioSlot::InheritFd(fd) => duplicate_fd(stream, *fd).map(Stdio::from),
        StdioSlot::CreatePipe(channel) => channel.take_child_end().map(Stdio::from).ok_or_else(|| {
            Error::invalid_stdio(stream.name(), "pipe is closed or already attached to a child")
        }),
    }
}

/// Duplicate `fd` with close-on-exec so the copy only reaches the child through
/// its stdio slot
#[allow(unsafe_code)]
fn duplicate_fd(stream: StdStream, fd: RawFd) -> Result<OwnedFd> {
    let duplicate = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(3)).map_err(|errno| {
        Error::invalid_stdio(stream.name(), format!("cannot duplicate descriptor {fd}: {errno}"))
    })?;
    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}
