//! Supervising one child from spawn to its final outcome

use crate::channel::{ChannelEvent, PipeChannel, PipeDirection, ReadBuffer};
use crate::config::{SlotConfig, SupervisorConfig};
use crate::error::{Error, Result};
use crate::outcome::{OutcomeCollector, SpawnOutcome};
use crate::process::{ExitStatus, ProcessHandle};
use crate::reactor::{HandleKind, Reactor};
use crate::sink::{NoOpSink, OutputSink};
use crate::stdio::{StdStream, StdioSlot, StdioSpec};
use futures::channel::oneshot;
use futures_lite::future;
use nix::sys::signal::Signal;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

type SharedSink = Rc<RefCell<Box<dyn OutputSink>>>;

/// State shared by the exit watcher, the stream readers and the deadline
struct Progress {
    collector: RefCell<OutcomeCollector>,
    sink: SharedSink,
    /// Dropped once the outcome is complete, which disarms the deadline
    deadline: RefCell<Option<oneshot::Sender<()>>>,
}

impl Progress {
    fn exited(&self, report: Result<ExitStatus>) {
        match report {
            Ok(status) => {
                self.collector.borrow_mut().record_exit(status);
                self.sink.borrow_mut().on_exit(status);
            }
            Err(e) => {
                self.collector.borrow_mut().record_wait_failure(&e);
                self.sink.borrow_mut().on_wait_error(&e);
            }
        }
        self.settle();
    }

    fn stream_event(&self, stream: StdStream, event: ChannelEvent<'_>) {
        match event {
            ChannelEvent::Data(bytes) => {
                self.collector.borrow_mut().record_chunk(stream, bytes);
                self.sink.borrow_mut().on_chunk(stream, bytes);
            }
            ChannelEvent::Eof => {
                self.collector.borrow_mut().record_eof(stream);
                self.sink.borrow_mut().on_eof(stream);
                self.settle();
            }
            ChannelEvent::Failed(error) => {
                warn!(%stream, error = %error, "reading child stream failed");
                self.collector.borrow_mut().record_read_error(stream, &error);
                self.sink.borrow_mut().on_read_error(stream, &error);
                self.settle();
            }
        }
    }

    fn settle(&self) {
        if self.collector.borrow().is_complete() {
            self.deadline.borrow_mut().take();
        }
    }
}

/// Runs one child and correlates its exit with its piped streams
pub struct Supervisor {
    config: SupervisorConfig,
    sink: SharedSink,
}

impl Supervisor {
    /// Create a supervisor for `config`
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            sink: Rc::new(RefCell::new(Box::new(NoOpSink))),
        }
    }

    /// Deliver events to `sink` as they happen
    pub fn with_sink<S: OutputSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Rc::new(RefCell::new(Box::new(sink)));
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn the child on its own reactor and wait for the outcome
    ///
    /// Spawn and pipe setup failures are returned before the reactor runs.
    pub fn run(&self) -> Result<SpawnOutcome> {
        let reactor = Reactor::new();
        let supervision = self.start(&reactor)?;
        let handles = reactor.run();
        debug!(handles, "reactor drained");
        supervision.outcome().ok_or(Error::Incomplete)
    }

    /// Spawn the child and register its handles with `reactor`
    ///
    /// Nothing is read until the caller runs the reactor. Several
    /// supervisions may share one reactor. With a deadline configured the
    /// child leads its own process group, so the deadline signal also
    /// reaches descendants holding its pipes.
    pub fn start(&self, reactor: &Reactor) -> Result<Supervision> {
        self.config.validate()?;
        let timeout_signal = self.config.timeout_signal()?;

        let stdio = self.open_stdio(reactor)?;
        let channels: Vec<(StdStream, PipeChannel)> = stdio
            .channels()
            .map(|(stream, channel)| (stream, channel.clone()))
            .collect();
        let observed: Vec<StdStream> = channels
            .iter()
            .filter(|(_, channel)| channel.direction() == PipeDirection::FromChild)
            .map(|(stream, _)| *stream)
            .collect();
        if observed.is_empty() {
            warn!(program = %self.config.program, "no output stream is piped; only the exit will be observed");
        }

        let (cancel_deadline, deadline) = match self.config.timeout() {
            Some(timeout) => {
                let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
                (Some(cancel_tx), Some((timeout, cancel_rx)))
            }
            None => (None, None),
        };
        let progress = Rc::new(Progress {
            collector: RefCell::new(OutcomeCollector::new(observed, self.config.capture)),
            sink: self.sink.clone(),
            deadline: RefCell::new(cancel_deadline),
        });

        let on_exit = {
            let progress = progress.clone();
            move |report: Result<ExitStatus>| progress.exited(report)
        };

        let options = self
            .config
            .process_options()
            .process_group(deadline.is_some());
        let process = match ProcessHandle::spawn(reactor, &options, &stdio, on_exit) {
            Ok(process) => process,
            Err(e) => {
                for (_, channel) in &channels {
                    channel.stop();
                }
                return Err(e);
            }
        };
        drop(stdio);

        info!(pid = process.pid(), program = %self.config.program, "supervising child");
        progress.collector.borrow_mut().record_spawn(process.pid());
        self.sink.borrow_mut().on_spawn(process.pid());

        for (stream, channel) in channels {
            match channel.direction() {
                PipeDirection::FromChild => {
                    let buffer = ReadBuffer::with_capacity(self.config.read_buffer_size);
                    let progress = progress.clone();
                    channel.start_reading(buffer, move |event: ChannelEvent<'_>| {
                        progress.stream_event(stream, event)
                    })?;
                }
                PipeDirection::ToChild => channel.stop(),
            }
        }

        if let Some((timeout, cancel_rx)) = deadline {
            arm_deadline(reactor, &process, &progress, timeout, timeout_signal, cancel_rx);
        }

        Ok(Supervision { process, progress })
    }

    fn open_stdio(&self, reactor: &Reactor) -> Result<StdioSpec> {
        let mut stdio = StdioSpec::default();
        for stream in StdStream::ALL {
            let slot = match self.config.stdio.slot(stream) {
                SlotConfig::Ignore => StdioSlot::Ignore,
                SlotConfig::Inherit => StdioSlot::InheritFd(stream.fd()),
                SlotConfig::Fd(fd) => StdioSlot::InheritFd(fd),
                SlotConfig::Pipe => {
                    let direction = match stream {
                        StdStream::Stdin => PipeDirection::ToChild,
                        StdStream::Stdout | StdStream::Stderr => PipeDirection::FromChild,
                    };
                    match PipeChannel::open(reactor, direction) {
                        Ok(channel) => StdioSlot::CreatePipe(channel),
                        Err(e) => {
                            for (_, channel) in stdio.channels() {
                                channel.stop();
                            }
                            return Err(e);
                        }
                    }
                }
            };
            stdio.set(stream, slot);
        }
        Ok(stdio)
    }
}

/// Signal the child's process group if the outcome is still open after `timeout`
///
/// The group is signalled even when the child already exited: a descendant
/// holding an observed pipe keeps the outcome open until it dies.
fn arm_deadline(
    reactor: &Reactor,
    process: &ProcessHandle,
    progress: &Rc<Progress>,
    timeout: Duration,
    signal: Signal,
    cancel: oneshot::Receiver<()>,
) {
    let process = process.clone();
    let progress = progress.clone();

    reactor.register(HandleKind::Timer, async move {
        let expired = future::or(
            async {
                smol::Timer::after(timeout).await;
                true
            },
            async {
                let _ = cancel.await;
                false
            },
        )
        .await;

        if !expired || progress.collector.borrow().is_complete() {
            return;
        }
        warn!(pgid = process.pid(), ?signal, ?timeout, "deadline expired, signalling process group");
        match process.kill_group(signal) {
            Ok(()) => {
                progress.collector.borrow_mut().record_timeout();
                progress.sink.borrow_mut().on_timeout(signal);
            }
            Err(e) => warn!(pgid = process.pid(), error = %e, "failed to signal process group"),
        }
    });
}

/// A child started by [`Supervisor::start`]
pub struct Supervision {
    process: ProcessHandle,
    progress: Rc<Progress>,
}

impl Supervision {
    /// The child's process id
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// The child's handle, e.g. to signal it
    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Returns true once the exit and every observed stream are terminal
    pub fn is_complete(&self) -> bool {
        self.progress.collector.borrow().is_complete()
    }

    /// The aggregated outcome, once complete
    pub fn outcome(&self) -> Option<SpawnOutcome> {
        self.progress.collector.borrow().outcome()
    }
}
