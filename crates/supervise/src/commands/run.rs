use anyhow::{Context, Result, bail};
use child_supervisor::config;
use child_supervisor::{NoOpSink, StdStream, Supervisor, SupervisorConfig};
use std::process::ExitCode;
use tracing::debug;

use crate::RunArgs;
use crate::console::{self, ConsoleSink};

pub fn run(args: RunArgs) -> Result<ExitCode> {
    let config = build_config(args.config.as_deref(), &args)?;
    config.validate().context("Invalid configuration")?;
    debug!(?config, "starting supervision");

    let supervisor = if args.json {
        Supervisor::new(config).with_sink(NoOpSink)
    } else {
        Supervisor::new(config).with_sink(ConsoleSink)
    };

    let outcome = match supervisor.run() {
        Ok(outcome) => outcome,
        Err(e) if e.is_init_error() => {
            console::print_error(&e);
            return Ok(ExitCode::from(127));
        }
        Err(e) => return Err(e).context("Supervision failed"),
    };

    if args.json {
        let json = serde_json::to_string_pretty(&outcome).context("Failed to encode outcome")?;
        println!("{json}");
    } else {
        console::print_outcome(&outcome);
    }

    Ok(ExitCode::from(console::exit_code(outcome.status.as_ref())))
}

/// Load the file, if any, then apply command-line overrides
fn build_config(path: Option<&std::path::Path>, args: &RunArgs) -> Result<SupervisorConfig> {
    let mut config = match (path, args.command.split_first()) {
        (Some(path), _) => config::parse_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        (None, Some((program, _))) => SupervisorConfig::new(program),
        (None, None) => bail!("no program given; pass --config FILE or -- PROGRAM [ARGS...]"),
    };

    if let Some((program, rest)) = args.command.split_first() {
        config.program = program.clone();
        config.args = rest.to_vec();
    }

    for (stream, slot) in [
        (StdStream::Stdin, args.stdin),
        (StdStream::Stdout, args.stdout),
        (StdStream::Stderr, args.stderr),
    ] {
        if let Some(slot) = slot {
            config.stdio.set(stream, slot);
        }
    }
    if let Some(size) = args.buffer_size {
        config.read_buffer_size = size;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = Some(timeout_ms);
    }
    if let Some(signal) = &args.timeout_signal {
        config.timeout_signal = signal.clone();
    }
    if args.capture {
        config.capture = true;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use child_supervisor::SlotConfig;
    use std::io::Write;

    #[test]
    fn test_trailing_command_builds_config() {
        let args = RunArgs {
            command: vec!["echo".into(), "hello".into()],
            stderr: Some(SlotConfig::Inherit),
            buffer_size: Some(64),
            ..Default::default()
        };
        let config = build_config(None, &args).unwrap();
        assert_eq!(config.program, "echo");
        assert_eq!(config.args, vec!["hello"]);
        assert_eq!(config.stdio.stderr, SlotConfig::Inherit);
        assert_eq!(config.stdio.stdout, SlotConfig::Pipe);
        assert_eq!(config.read_buffer_size, 64);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "program: cat\nstdio:\n  stdin: pipe\ntimeout_ms: 100").unwrap();

        let args = RunArgs {
            timeout_ms: Some(5000),
            capture: true,
            ..Default::default()
        };
        let config = build_config(Some(file.path()), &args).unwrap();
        assert_eq!(config.program, "cat");
        assert_eq!(config.stdio.stdin, SlotConfig::Pipe);
        assert_eq!(config.timeout_ms, Some(5000));
        assert!(config.capture);
    }

    #[test]
    fn test_no_program_is_an_error() {
        assert!(build_config(None, &RunArgs::default()).is_err());
    }
}
