//! Spawning a child and observing its termination

use crate::error::{Error, Result};
use crate::reactor::{HandleKind, Reactor};
use crate::stdio::StdioSpec;
use async_process::Command as AsyncCommand;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// What to run: program, arguments, environment and working directory
///
/// Every setter consumes and returns the options, so they chain:
///
/// ```
/// use child_supervisor::ProcessOptions;
///
/// let options = ProcessOptions::new("sh").arg("-c").arg("echo $GREETING").env("GREETING", "hi");
/// assert_eq!(options.args_list().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    env_clear: bool,
    current_dir: Option<PathBuf>,
    process_group: bool,
}

impl ProcessOptions {
    /// Options for running `program` with no arguments
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            ..Self::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Set one environment variable for the child
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .insert(key.as_ref().to_owned(), value.as_ref().to_owned());
        self
    }

    /// Start from an empty environment; variables set with `env` still apply
    pub fn env_clear(mut self, clear: bool) -> Self {
        self.env_clear = clear;
        self
    }

    /// Run the child in `dir`
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Make the child the leader of a new process group
    ///
    /// Required for [`ProcessHandle::kill_group`].
    pub fn process_group(mut self, own_group: bool) -> Self {
        self.process_group = own_group;
        self
    }

    /// The program to execute
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments after argv[0]
    pub fn args_list(&self) -> &[OsString] {
        &self.args
    }

    /// The full argument vector, program first
    pub fn argv(&self) -> Vec<OsString> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// The working directory, if one is set
    pub fn dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    fn command(&self) -> AsyncCommand {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        if self.env_clear {
            cmd.env_clear();
        }
        cmd.envs(&self.env);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        if self.process_group {
            cmd.process_group(0);
        }
        AsyncCommand::from(cmd)
    }
}

/// Process exit status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }

    /// The `(exit_code, signal)` pair, with 0 standing in for an absent member
    ///
    /// A child killed by a signal therefore reports exit code 0.
    pub fn as_pair(&self) -> (i64, i32) {
        (
            self.code.map(i64::from).unwrap_or(0),
            self.signal.unwrap_or(0),
        )
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (_, Some(signal)) => write!(f, "terminated by signal {signal}"),
            (Some(code), None) => write!(f, "exit code {code}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Lifecycle of a spawned child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The OS confirmed creation and no exit was reported yet
    Running,
    /// The exit callback has fired and the native handle is released
    Exited,
}

/// Turn the result of waiting on `pid` into the report handed to `on_exit`
fn exit_report(pid: u32, waited: io::Result<std::process::ExitStatus>) -> Result<ExitStatus> {
    waited
        .map(ExitStatus::from)
        .map_err(|source| Error::WaitFailed { pid, source })
}

/// A handle to a spawned child
///
/// The native child handle is owned by the exit watcher registered with the
/// reactor; it is released right after the exit callback returns.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    program: String,
    own_group: bool,
    state: Rc<Cell<ProcessState>>,
}

impl ProcessHandle {
    /// Start `options` with the given stdio table
    ///
    /// On success the child is already running and `on_exit` will be called
    /// exactly once from the reactor, with the exit status or with
    /// [`Error::WaitFailed`] if the OS could not report one. On failure no
    /// process exists and `on_exit` is dropped without being called.
    pub fn spawn<F>(
        reactor: &Reactor,
        options: &ProcessOptions,
        stdio: &StdioSpec,
        on_exit: F,
    ) -> Result<Self>
    where
        F: FnOnce(Result<ExitStatus>) + 'static,
    {
        if options.program().is_empty() {
            return Err(Error::invalid_argument("program must not be empty"));
        }
        let program = options.program().to_string_lossy().into_owned();

        let [stdin, stdout, stderr] = stdio.to_child_stdio()?;
        let mut cmd = options.command();
        cmd.stdin(stdin).stdout(stdout).stderr(stderr);

        let mut child = cmd.spawn().map_err(|source| Error::SpawnFailed {
            program: program.clone(),
            source,
        })?;
        // The command still holds the child's pipe ends; the writers must be
        // closed here or the supervisor never sees end-of-stream.
        drop(cmd);

        let pid = child.id();
        debug!(pid, program = %program, own_group = options.process_group, "process spawned");

        let state = Rc::new(Cell::new(ProcessState::Running));
        let watcher_state = state.clone();
        reactor.register(HandleKind::Process, async move {
            let report = exit_report(pid, child.status().await);
            watcher_state.set(ProcessState::Exited);
            match &report {
                Ok(status) => debug!(pid, %status, "process exited"),
                Err(e) => warn!(pid, error = %e, "exit status unavailable"),
            }
            on_exit(report);
            drop(child);
        });

        Ok(Self {
            pid,
            program,
            own_group: options.process_group,
            state,
        })
    }

    /// The child's process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The program that was started
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    /// Send `signal` to the child
    ///
    /// Refused once the exit has been reported, so a recycled pid is never
    /// signalled.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        if self.state.get() == ProcessState::Exited {
            return Err(Error::ProcessExited { pid: self.pid });
        }
        debug!(pid = self.pid, ?signal, "signalling process");
        signal::kill(Pid::from_raw(self.pid as i32), signal)
            .map_err(|errno| Error::SignalFailed { signal, errno })
    }

    /// Send `signal` to every process in the child's process group
    ///
    /// Reaches descendants that still hold the child's pipes. Allowed after
    /// the child itself exited: the group id stays reserved while any member
    /// lives, and an empty group yields `ESRCH`.
    pub fn kill_group(&self, signal: Signal) -> Result<()> {
        if !self.own_group {
            return Err(Error::invalid_argument(format!(
                "process {} was not started in its own process group",
                self.pid
            )));
        }
        debug!(pgid = self.pid, ?signal, "signalling process group");
        signal::killpg(Pid::from_raw(self.pid as i32), signal)
            .map_err(|errno| Error::SignalFailed { signal, errno })
    }

    /// Send SIGTERM for graceful shutdown
    pub fn terminate(&self) -> Result<()> {
        self.kill(Signal::SIGTERM)
    }

    /// Send SIGINT to interrupt the process
    pub fn interrupt(&self) -> Result<()> {
        self.kill(Signal::SIGINT)
    }

    /// Send SIGHUP, which daemons commonly treat as a reload request
    pub fn reload(&self) -> Result<()> {
        self.kill(Signal::SIGHUP)
    }
}
