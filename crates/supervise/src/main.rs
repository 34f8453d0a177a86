//! Command-line front end for child-supervisor

use anyhow::Result;
use child_supervisor::SlotConfig;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod console;
mod logging;

#[derive(Parser)]
#[command(name = "supervise")]
#[command(about = "Run a child process and observe its output and exit")]
#[command(version)]
struct Cli {
    /// Log level (falls back to SUPERVISE_LOG, then info)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a child and report its streams and exit status
    Run(RunArgs),

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Options for `supervise run`; flags override the configuration file
#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Wiring for the child's stdin (ignore, inherit, pipe or fd:N)
    #[arg(long, value_name = "MODE")]
    pub stdin: Option<SlotConfig>,

    /// Wiring for the child's stdout
    #[arg(long, value_name = "MODE")]
    pub stdout: Option<SlotConfig>,

    /// Wiring for the child's stderr
    #[arg(long, value_name = "MODE")]
    pub stderr: Option<SlotConfig>,

    /// Bytes read per chunk at most
    #[arg(long, value_name = "N")]
    pub buffer_size: Option<usize>,

    /// Signal the child if it runs longer than this many milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Signal sent when the deadline expires
    #[arg(long, value_name = "SIG")]
    pub timeout_signal: Option<String>,

    /// Keep and print the child's output
    #[arg(long)]
    pub capture: bool,

    /// Print the outcome as JSON instead of the event log
    #[arg(long)]
    pub json: bool,

    /// Program and arguments
    #[arg(last = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

/// Log verbosity accepted by `--log-level`
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Validate { config } => {
            commands::validate::run(&config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
