//! Supervisor configuration
//!
//! A configuration names the program to run and decides, per stdio slot,
//! whether the supervisor observes that stream. It can be built in code or
//! loaded from YAML:
//!
//! ```yaml
//! program: /bin/sh
//! args: ["-c", "echo hello; echo oops >&2"]
//! stdio:
//!   stdin: ignore
//!   stdout: pipe
//!   stderr: inherit
//! read_buffer_size: 1024
//! timeout_ms: 5000
//! timeout_signal: SIGTERM
//! ```

use crate::channel::DEFAULT_READ_BUFFER_SIZE;
use crate::error::ConfigError;
use crate::process::ProcessOptions;
use crate::stdio::StdStream;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// How one stdio slot is wired
///
/// Written as `ignore`, `inherit`, `pipe` or `fd:N` both in YAML and on the
/// command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SlotConfig {
    /// The child gets the null device
    Ignore,
    /// The child shares the supervisor's descriptor of the same number
    Inherit,
    /// The supervisor creates a pipe; output slots are observed
    Pipe,
    /// The child shares the supervisor's descriptor `N`
    Fd(RawFd),
}

impl FromStr for SlotConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" | "null" => Ok(SlotConfig::Ignore),
            "inherit" => Ok(SlotConfig::Inherit),
            "pipe" => Ok(SlotConfig::Pipe),
            other => other
                .strip_prefix("fd:")
                .and_then(|n| n.parse::<RawFd>().ok())
                .map(SlotConfig::Fd)
                .ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "unknown stdio mode '{s}', expected ignore, inherit, pipe or fd:N"
                    ))
                }),
        }
    }
}

impl TryFrom<String> for SlotConfig {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SlotConfig> for String {
    fn from(slot: SlotConfig) -> Self {
        slot.to_string()
    }
}

impl fmt::Display for SlotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotConfig::Ignore => f.write_str("ignore"),
            SlotConfig::Inherit => f.write_str("inherit"),
            SlotConfig::Pipe => f.write_str("pipe"),
            SlotConfig::Fd(fd) => write!(f, "fd:{fd}"),
        }
    }
}

/// Wiring of all three slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StdioConfig {
    /// The child's stdin
    pub stdin: SlotConfig,
    /// The child's stdout
    pub stdout: SlotConfig,
    /// The child's stderr
    pub stderr: SlotConfig,
}

impl StdioConfig {
    /// The setting for `stream`
    pub fn slot(&self, stream: StdStream) -> SlotConfig {
        match stream {
            StdStream::Stdin => self.stdin,
            StdStream::Stdout => self.stdout,
            StdStream::Stderr => self.stderr,
        }
    }

    /// Change the setting for `stream`
    pub fn set(&mut self, stream: StdStream, slot: SlotConfig) {
        match stream {
            StdStream::Stdin => self.stdin = slot,
            StdStream::Stdout => self.stdout = slot,
            StdStream::Stderr => self.stderr = slot,
        }
    }
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            stdin: SlotConfig::Ignore,
            stdout: SlotConfig::Pipe,
            stderr: SlotConfig::Pipe,
        }
    }
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_timeout_signal() -> String {
    "SIGKILL".to_string()
}

/// Everything a [`Supervisor`](crate::Supervisor) needs to run one child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// The program to execute
    pub program: String,

    /// Arguments after argv[0]
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Start the child with an empty environment (plus `env`)
    #[serde(default)]
    pub env_clear: bool,

    /// Working directory for the child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Per-slot wiring
    #[serde(default)]
    pub stdio: StdioConfig,

    /// Bytes read per data event at most
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Keep the observed bytes in the outcome
    #[serde(default)]
    pub capture: bool,

    /// Signal the child if it is still running after this many milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Signal sent when the deadline expires
    #[serde(default = "default_timeout_signal")]
    pub timeout_signal: String,
}

impl SupervisorConfig {
    /// A configuration for `program` with default settings
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            env_clear: false,
            working_dir: None,
            stdio: StdioConfig::default(),
            read_buffer_size: default_read_buffer_size(),
            capture: false,
            timeout_ms: None,
            timeout_signal: default_timeout_signal(),
        }
    }

    /// Add arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Wire one slot
    pub fn with_slot(mut self, stream: StdStream, slot: SlotConfig) -> Self {
        self.stdio.set(stream, slot);
        self
    }

    /// Set the per-read buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Keep observed bytes in the outcome
    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Signal the child with `signal` if it outlives `timeout`
    pub fn with_timeout(mut self, timeout: Duration, signal: Signal) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self.timeout_signal = signal.as_str().to_string();
        self
    }

    /// Check the configuration for errors
    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(ConfigError::Validation("program must not be empty".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "read_buffer_size must be greater than zero".into(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::Validation(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        for stream in StdStream::ALL {
            if let SlotConfig::Fd(fd) = self.stdio.slot(stream) {
                if fd < 0 {
                    return Err(ConfigError::Validation(format!(
                        "{stream} descriptor {fd} is negative"
                    )));
                }
            }
        }
        self.timeout_signal()?;
        Ok(())
    }

    /// The deadline, if one is configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// The signal sent when the deadline expires
    ///
    /// Accepts `SIGTERM`, `TERM` or `term`.
    pub fn timeout_signal(&self) -> Result<Signal> {
        parse_signal(&self.timeout_signal)
    }

    /// Output streams the supervisor will read
    pub fn observed_streams(&self) -> Vec<StdStream> {
        [StdStream::Stdout, StdStream::Stderr]
            .into_iter()
            .filter(|stream| self.stdio.slot(*stream) == SlotConfig::Pipe)
            .collect()
    }

    /// The program, arguments and environment as spawn options
    pub fn process_options(&self) -> ProcessOptions {
        let options = ProcessOptions::new(&self.program)
            .args(&self.args)
            .env_clear(self.env_clear);
        let options = self
            .env
            .iter()
            .fold(options, |options, (key, value)| options.env(key, value));
        match &self.working_dir {
            Some(dir) => options.current_dir(dir),
            None => options,
        }
    }
}

/// Parse a signal name such as `SIGKILL`, `KILL` or `kill`
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full)
        .map_err(|_| ConfigError::Validation(format!("unknown signal '{name}'")))
}

/// Load and validate a YAML configuration file
pub fn parse_file(path: impl AsRef<Path>) -> Result<SupervisorConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse and validate YAML configuration from a string
pub fn parse_str(content: &str) -> Result<SupervisorConfig> {
    let config: SupervisorConfig = serde_yaml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_str("program: /bin/echo\n").unwrap();
        assert_eq!(config.program, "/bin/echo");
        assert!(config.args.is_empty());
        assert_eq!(config.stdio, StdioConfig::default());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.timeout_signal().unwrap(), Signal::SIGKILL);
        assert_eq!(
            config.observed_streams(),
            vec![StdStream::Stdout, StdStream::Stderr]
        );
    }

    #[test]
    fn test_full_config_parsing() {
        let yaml = r#"
program: /bin/sh
args: ["-c", "echo hi"]
env:
  GREETING: hello
env_clear: true
working_dir: /tmp
stdio:
  stdin: ignore
  stdout: pipe
  stderr: fd:1
read_buffer_size: 512
capture: true
timeout_ms: 2500
timeout_signal: term
"#;
        let config = parse_str(yaml).unwrap();
        assert_eq!(config.args, vec!["-c", "echo hi"]);
        assert_eq!(config.env.get("GREETING").map(String::as_str), Some("hello"));
        assert!(config.env_clear);
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.stdio.stderr, SlotConfig::Fd(1));
        assert_eq!(config.read_buffer_size, 512);
        assert!(config.capture);
        assert_eq!(config.timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.timeout_signal().unwrap(), Signal::SIGTERM);
        assert_eq!(config.observed_streams(), vec![StdStream::Stdout]);

        let options = config.process_options();
        assert_eq!(options.args_list().len(), 2);
        assert_eq!(options.dir(), Some(Path::new("/tmp")));
    }

    #[test]
    fn test_slot_modes_round_trip_through_strings() {
        for slot in [
            SlotConfig::Ignore,
            SlotConfig::Inherit,
            SlotConfig::Pipe,
            SlotConfig::Fd(7),
        ] {
            assert_eq!(slot.to_string().parse::<SlotConfig>().unwrap(), slot);
        }
        assert_eq!("NULL".parse::<SlotConfig>().unwrap(), SlotConfig::Ignore);
        assert!("socket".parse::<SlotConfig>().is_err());
        assert!("fd:x".parse::<SlotConfig>().is_err());
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            "program: ''\n",
            "program: /bin/true\nread_buffer_size: 0\n",
            "program: /bin/true\ntimeout_ms: 0\n",
            "program: /bin/true\ntimeout_signal: SIGNOPE\n",
            "program: /bin/true\nstdio:\n  stdout: fd:-3\n",
        ];
        for yaml in cases {
            assert!(
                matches!(parse_str(yaml), Err(ConfigError::Validation(_))),
                "expected validation error for {yaml:?}"
            );
        }
    }

    #[test]
    fn test_unknown_mode_is_a_yaml_error() {
        let err = parse_str("program: /bin/true\nstdio:\n  stdout: socket\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "program: /bin/echo\nargs: [hello]").unwrap();

        let config = parse_file(file.path()).unwrap();
        assert_eq!(config.args, vec!["hello"]);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = parse_file("/nonexistent/supervise.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }

    #[test]
    fn test_builder_helpers() {
        let config = SupervisorConfig::new("/bin/echo")
            .with_args(["a", "b"])
            .with_env("K", "V")
            .with_slot(StdStream::Stderr, SlotConfig::Ignore)
            .with_read_buffer_size(64)
            .with_capture(true)
            .with_timeout(Duration::from_secs(1), Signal::SIGINT);

        assert!(config.validate().is_ok());
        assert_eq!(config.observed_streams(), vec![StdStream::Stdout]);
        assert_eq!(config.timeout_signal().unwrap(), Signal::SIGINT);
        assert_eq!(config.timeout_ms, Some(1000));
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let config =
            SupervisorConfig::new("/bin/true").with_timeout(Duration::MAX, Signal::SIGKILL);
        assert_eq!(config.timeout_ms, Some(u64::MAX));

        let just_over = Duration::from_millis(u64::MAX) + Duration::from_secs(1);
        let config = SupervisorConfig::new("/bin/true").with_timeout(just_over, Signal::SIGKILL);
        assert_eq!(config.timeout_ms, Some(u64::MAX));
    }
}
