//! Human-readable event log on stdout

use child_supervisor::{Error, ExitStatus, OutputSink, Signal, SpawnOutcome, StdStream};

/// Prints one line per supervision event
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn on_spawn(&mut self, pid: u32) {
        println!("spawned pid {pid}");
    }

    fn on_chunk(&mut self, stream: StdStream, data: &[u8]) {
        println!("{stream}: read {} bytes", data.len());
    }

    fn on_eof(&mut self, stream: StdStream) {
        println!("{stream}: EOF");
    }

    fn on_read_error(&mut self, stream: StdStream, error: &Error) {
        println!("{stream}: read error: {error}");
    }

    fn on_timeout(&mut self, signal: Signal) {
        println!("deadline expired, sent {signal}");
    }

    fn on_exit(&mut self, status: ExitStatus) {
        println!("process exited: {status}");
    }

    fn on_wait_error(&mut self, error: &Error) {
        println!("process exit unknown: {error}");
    }
}

/// Print the final `(exit_status, signal)` pair and any captured output
pub fn print_outcome(outcome: &SpawnOutcome) {
    for report in &outcome.streams {
        if let Some(text) = report.captured_text() {
            println!("--- captured {} ({} bytes) ---", report.stream, report.bytes);
            print!("{text}");
            if !text.is_empty() && !text.ends_with('\n') {
                println!();
            }
        }
    }
    match (outcome.status, &outcome.wait_error) {
        (Some(status), _) => {
            let (code, signal) = status.as_pair();
            println!("({code}, {signal})");
        }
        (None, Some(error)) => println!("exit status unknown: {error}"),
        (None, None) => println!("exit status unknown"),
    }
}

/// Print a spawn or setup failure with its OS error code
pub fn print_error(error: &Error) {
    match error.os_code() {
        Some(code) => eprintln!("error {code}: {error}"),
        None => eprintln!("error: {error}"),
    }
}

/// The exit code `supervise` itself returns for `status`
///
/// Mirrors the child: its exit code, or 128 plus the signal number. An
/// unknown status is reported as 1.
pub fn exit_code(status: Option<&ExitStatus>) -> u8 {
    let Some(status) = status else {
        return 1;
    };
    match (status.code, status.signal) {
        (_, Some(signal)) => (128 + signal).clamp(0, 255) as u8,
        (Some(code), None) => (code & 0xff) as u8,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mirrors_child() {
        let clean = ExitStatus {
            code: Some(0),
            signal: None,
        };
        let failed = ExitStatus {
            code: Some(3),
            signal: None,
        };
        let killed = ExitStatus {
            code: None,
            signal: Some(9),
        };
        assert_eq!(exit_code(Some(&clean)), 0);
        assert_eq!(exit_code(Some(&failed)), 3);
        assert_eq!(exit_code(Some(&killed)), 137);
        assert_eq!(exit_code(Some(&ExitStatus::default())), 1);
    }

    #[test]
    fn test_unknown_status_is_not_success() {
        assert_eq!(exit_code(None), 1);
    }
}
