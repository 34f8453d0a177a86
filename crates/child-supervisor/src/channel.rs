//! Pipe channels between the supervisor and a child
//!
//! A [`PipeChannel`] owns both ends of a freshly created stream pair. The
//! child's end is handed over at spawn time; the supervisor's end is
//! registered with the reactor's readiness poller and drained by
//! [`PipeChannel::start_reading`].

use crate::error::{Error, Result};
use crate::reactor::{HandleKind, Reactor};
use futures::channel::oneshot;
use futures_lite::{AsyncReadExt, future};
use smol::Async;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use tracing::{debug, trace};

/// Size of the read buffer used when none is configured
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Which side of the pipe the child uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// The child writes, the supervisor reads
    FromChild,
    /// The child reads; the supervisor never writes and only closes its end
    ToChild,
}

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open, no read armed yet
    Idle,
    /// A read is armed with the reactor
    Reading,
    /// Terminal; the supervisor's end has been released
    Closed,
}

/// Fixed-size buffer reused for every read on one channel
///
/// Its contents are only meaningful for the duration of a single
/// [`ChannelEvent::Data`] callback.
#[derive(Debug, Clone)]
pub struct ReadBuffer {
    buf: Vec<u8>,
}

impl ReadBuffer {
    /// Create a buffer holding at most `capacity` bytes per read
    ///
    /// A zero capacity is rounded up to one byte, since an empty read buffer
    /// would be indistinguishable from end-of-stream.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
        }
    }

    /// Maximum number of bytes delivered per data event
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_READ_BUFFER_SIZE)
    }
}

/// An event delivered to a channel consumer
#[derive(Debug)]
pub enum ChannelEvent<'a> {
    /// Bytes read from the pipe; the slice length is authoritative
    Data(&'a [u8]),
    /// The writer closed the pipe
    Eof,
    /// The read failed; the channel is closed
    Failed(Error),
}

impl ChannelEvent<'_> {
    /// Returns true for the events after which nothing else is delivered
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChannelEvent::Data(_))
    }
}

enum ReadStep {
    Read(io::Result<usize>),
    Stopped,
}

struct ChannelInner {
    direction: PipeDirection,
    state: Rc<Cell<ChannelState>>,
    reactor: Reactor,
    local: RefCell<Option<Async<UnixStream>>>,
    remote: RefCell<Option<OwnedFd>>,
    stop: RefCell<Option<oneshot::Sender<()>>>,
}

/// One supervisor-owned pipe bound to a reactor
///
/// Clones refer to the same channel, so a consumer callback can hold one and
/// call [`PipeChannel::stop`] from inside the callback.
#[derive(Clone)]
pub struct PipeChannel {
    inner: Rc<ChannelInner>,
}

impl PipeChannel {
    /// Create a pipe and register the supervisor's end with `reactor`
    pub fn open(reactor: &Reactor, direction: PipeDirection) -> Result<Self> {
        let (local, remote) = UnixStream::pair().map_err(|source| Error::ChannelInit { source })?;
        let local = Async::new(local).map_err(|source| Error::ChannelInit { source })?;

        debug!(?direction, "pipe channel opened");

        Ok(Self {
            inner: Rc::new(ChannelInner {
                direction,
                state: Rc::new(Cell::new(ChannelState::Idle)),
                reactor: reactor.clone(),
                local: RefCell::new(Some(local)),
                remote: RefCell::new(Some(OwnedFd::from(remote))),
                stop: RefCell::new(None),
            }),
        })
    }

    /// Which side of the pipe the child uses
    pub fn direction(&self) -> PipeDirection {
        self.inner.direction
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    /// Arm asynchronous reads
    ///
    /// `on_chunk` receives zero or more [`ChannelEvent::Data`] events followed
    /// by exactly one terminal event, unless [`PipeChannel::stop`] is called
    /// first, in which case nothing further is delivered.
    pub fn start_reading<F>(&self, mut buffer: ReadBuffer, mut on_chunk: F) -> Result<()>
    where
        F: FnMut(ChannelEvent<'_>) + 'static,
    {
        if self.inner.direction == PipeDirection::ToChild {
            return Err(Error::ChannelNotReadable);
        }
        match self.inner.state.get() {
            ChannelState::Idle => {}
            ChannelState::Reading => return Err(Error::ChannelBusy),
            ChannelState::Closed => return Err(Error::ChannelClosed),
        }

        let mut stream = self
            .inner
            .local
            .borrow_mut()
            .take()
            .ok_or(Error::ChannelClosed)?;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        *self.inner.stop.borrow_mut() = Some(stop_tx);

        let state = self.inner.state.clone();
        state.set(ChannelState::Reading);

        self.inner.reactor.register(HandleKind::Pipe, async move {
            loop {
                if state.get() == ChannelState::Closed {
                    break;
                }

                let step = future::or(
                    async { ReadStep::Read(stream.read(&mut buffer.buf).await) },
                    async {
                        match (&mut stop_rx).await {
                            Ok(()) => ReadStep::Stopped,
                            // Every channel handle is gone; keep draining.
                            Err(_) => future::pending().await,
                        }
                    },
                )
                .await;

                if state.get() == ChannelState::Closed {
                    break;
                }

                match step {
                    ReadStep::Read(Ok(0)) => {
                        state.set(ChannelState::Closed);
                        trace!("pipe channel reached end of stream");
                        on_chunk(ChannelEvent::Eof);
                        break;
                    }
                    ReadStep::Read(Ok(n)) => {
                        trace!(bytes = n, "pipe channel read");
                        on_chunk(ChannelEvent::Data(&buffer.buf[..n]));
                    }
                    ReadStep::Read(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    ReadStep::Read(Err(source)) => {
                        state.set(ChannelState::Closed);
                        on_chunk(ChannelEvent::Failed(Error::ChannelRead { source }));
                        break;
                    }
                    ReadStep::Stopped => break,
                }
            }
            drop(stream);
        });

        Ok(())
    }

    /// Cancel reading and release the channel
    ///
    /// Idempotent, and safe to call from inside a consumer callback.
    pub fn stop(&self) {
        if self.inner.state.replace(ChannelState::Closed) == ChannelState::Closed {
            return;
        }
        if let Some(stop) = self.inner.stop.borrow_mut().take() {
            let _ = stop.send(());
        }
        self.inner.local.borrow_mut().take();
        self.inner.remote.borrow_mut().take();
        debug!(direction = ?self.inner.direction, "pipe channel stopped");
    }

    /// Hand the child's end over to a spawn request
    pub(crate) fn take_child_end(&self) -> Option<OwnedFd> {
        self.inner.remote.borrow_mut().take()
    }

    /// Queue bytes for the child's end to read, before reading starts
    #[cfg(test)]
    pub(crate) fn write_to_child_end(&self, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;

        let local = self.inner.local.borrow();
        let stream = local.as_ref().ok_or(io::ErrorKind::NotConnected)?;
        stream.get_ref().write_all(bytes)
    }
}

impl fmt::Debug for PipeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeChannel")
            .field("direction", &self.inner.direction)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Data(Vec<u8>),
        Eof,
        Failed,
    }

    fn recorder() -> (Rc<RefCell<Vec<Seen>>>, impl FnMut(ChannelEvent<'_>) + 'static) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let callback = move |event: ChannelEvent<'_>| {
            sink.borrow_mut().push(match event {
                ChannelEvent::Data(bytes) => Seen::Data(bytes.to_vec()),
                ChannelEvent::Eof => Seen::Eof,
                ChannelEvent::Failed(_) => Seen::Failed,
            });
        };
        (seen, callback)
    }

    fn child_writer(channel: &PipeChannel) -> UnixStream {
        UnixStream::from(channel.take_child_end().unwrap())
    }

    #[test]
    fn test_data_then_eof() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::FromChild).unwrap();
        let mut writer = child_writer(&channel);
        writer.write_all(b"hello\n").unwrap();
        drop(writer);

        let (seen, callback) = recorder();
        channel.start_reading(ReadBuffer::default(), callback).unwrap();
        assert_eq!(channel.state(), ChannelState::Reading);

        assert_eq!(reactor.run(), 1);
        assert_eq!(
            *seen.borrow(),
            vec![Seen::Data(b"hello\n".to_vec()), Seen::Eof]
        );
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_small_buffer_splits_reads() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::FromChild).unwrap();
        let mut writer = child_writer(&channel);
        writer.write_all(&[b'x'; 2000]).unwrap();
        drop(writer);

        let (seen, callback) = recorder();
        channel
            .start_reading(ReadBuffer::with_capacity(1024), callback)
            .unwrap();
        reactor.run();

        let seen = seen.borrow();
        let sizes: Vec<usize> = seen
            .iter()
            .filter_map(|s| match s {
                Seen::Data(bytes) => Some(bytes.len()),
                _ => None,
            })
            .collect();
        assert!(sizes.len() >= 2);
        assert!(sizes.iter().all(|&n| n <= 1024));
        assert_eq!(sizes.iter().sum::<usize>(), 2000);
        assert_eq!(seen.last(), Some(&Seen::Eof));
    }

    #[test]
    fn test_immediate_eof() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::FromChild).unwrap();
        drop(child_writer(&channel));

        let (seen, callback) = recorder();
        channel.start_reading(ReadBuffer::default(), callback).unwrap();
        reactor.run();

        assert_eq!(*seen.borrow(), vec![Seen::Eof]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::FromChild).unwrap();

        channel.stop();
        channel.stop();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.take_child_end().is_none());

        let (_seen, callback) = recorder();
        assert!(matches!(
            channel.start_reading(ReadBuffer::default(), callback),
            Err(Error::ChannelClosed)
        ));
        assert_eq!(reactor.run(), 0);
    }

    #[test]
    fn test_stop_inside_callback_ends_delivery() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::FromChild).unwrap();
        // The writer stays open, so only stop() can end the read.
        let mut writer = child_writer(&channel);
        writer.write_all(b"first").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let handle = channel.clone();
        channel
            .start_reading(ReadBuffer::default(), move |event| {
                if let ChannelEvent::Data(bytes) = event {
                    sink.borrow_mut().push(bytes.to_vec());
                }
                handle.stop();
            })
            .unwrap();

        assert_eq!(reactor.run(), 1);
        assert_eq!(*seen.borrow(), vec![b"first".to_vec()]);
        assert_eq!(channel.state(), ChannelState::Closed);
        drop(writer);
    }

    #[test]
    fn test_stop_outside_callback_cancels_pending_read() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::FromChild).unwrap();
        let _writer = child_writer(&channel);

        let (seen, callback) = recorder();
        channel.start_reading(ReadBuffer::default(), callback).unwrap();

        let stopper = channel.clone();
        reactor.register(HandleKind::Timer, async move {
            smol::Timer::after(std::time::Duration::from_millis(10)).await;
            stopper.stop();
        });

        assert_eq!(reactor.run(), 2);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_reset_by_peer_is_terminal_error() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::FromChild).unwrap();
        let mut writer = child_writer(&channel);
        writer.write_all(b"abc").unwrap();
        // Closing the child's end with unread bytes resets the connection.
        channel.write_to_child_end(b"x").unwrap();
        drop(writer);

        let (seen, callback) = recorder();
        channel.start_reading(ReadBuffer::default(), callback).unwrap();
        assert_eq!(reactor.run(), 1);

        assert_eq!(
            *seen.borrow(),
            vec![Seen::Data(b"abc".to_vec()), Seen::Failed]
        );
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_to_child_is_not_readable() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::ToChild).unwrap();
        let (_seen, callback) = recorder();
        assert!(matches!(
            channel.start_reading(ReadBuffer::default(), callback),
            Err(Error::ChannelNotReadable)
        ));
        channel.stop();
    }

    #[test]
    fn test_double_start_is_rejected() {
        let reactor = Reactor::new();
        let channel = PipeChannel::open(&reactor, PipeDirection::FromChild).unwrap();
        drop(child_writer(&channel));

        let (_seen, first) = recorder();
        let (_other, second) = recorder();
        channel.start_reading(ReadBuffer::default(), first).unwrap();
        assert!(matches!(
            channel.start_reading(ReadBuffer::default(), second),
            Err(Error::ChannelBusy)
        ));
        reactor.run();
    }

    #[test]
    fn test_zero_capacity_rounds_up() {
        assert_eq!(ReadBuffer::with_capacity(0).capacity(), 1);
        assert_eq!(ReadBuffer::default().capacity(), DEFAULT_READ_BUFFER_SIZE);
    }
}
