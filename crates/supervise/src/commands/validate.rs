use anyhow::{Context, Result};
use child_supervisor::config;
use child_supervisor::{SlotConfig, StdStream};
use std::path::Path;

pub fn run(config_path: &Path) -> Result<()> {
    println!("Validating {}...", config_path.display());

    let config = config::parse_file(config_path).context("Failed to parse configuration")?;

    println!("✓ Configuration valid");
    println!("  Program: {}", config.program);
    if !config.args.is_empty() {
        println!("  Args: {}", config.args.join(" "));
    }
    for stream in StdStream::ALL {
        println!("  {}: {}", stream, config.stdio.slot(stream));
    }
    println!("  Read buffer: {} bytes", config.read_buffer_size);
    if let Some(timeout) = config.timeout() {
        println!("  Deadline: {:?} then {}", timeout, config.timeout_signal);
    }

    if config.observed_streams().is_empty() {
        println!("  ⚠ No output stream is piped; only the exit will be reported");
    }
    if config.stdio.stdin == SlotConfig::Pipe {
        println!("  ⚠ A piped stdin is closed right after spawn");
    }

    Ok(())
}
