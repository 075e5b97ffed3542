//! Execution of external HSM commands
//!
//! Implementations:
//! - `ProcessRunner`: spawns the command as a child process
//! - `SimulatedRunner`: scripted exit codes for tests and DST

use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Runs one external command line and reports its exit code
pub trait CommandRunner: Send + Sync + 'static {
    fn run<'a>(
        &'a self,
        command: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<i32>> + Send + 'a>>;
}

// ============================================================================
// ProcessRunner
// ============================================================================

/// Runs commands as child processes.
///
/// The command line is split on whitespace; the first word is the program.
/// Dropping the returned future kills the child.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        command: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<i32>> + Send + 'a>> {
        Box::pin(async move {
            let mut words = command.split_whitespace();
            let program = words
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
            let output = Command::new(program)
                .args(words)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await?;
            // Killed by a signal: no exit code
            let code = output.status.code().unwrap_or(-1);
            if code != 0 {
                debug!(
                    "{} exited with {}: {}",
                    program,
                    code,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(code)
        })
    }
}

// ============================================================================
// SimulatedRunner
// ============================================================================

/// Scripted runner: every command exits 0 unless it contains a configured
/// marker, in which case it exits with the marker's code
#[derive(Debug, Default)]
pub struct SimulatedRunner {
    outcomes: Vec<(String, i32)>,
    delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
}

impl SimulatedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `marker` exit with `code`
    pub fn fail_matching(mut self, marker: impl Into<String>, code: i32) -> Self {
        self.outcomes.push((marker.into(), code));
        self
    }

    /// Every command takes `delay` to complete
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Commands run so far, in start order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

impl CommandRunner for SimulatedRunner {
    fn run<'a>(
        &'a self,
        command: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<i32>> + Send + 'a>> {
        Box::pin(async move {
            self.executed.lock().push(command.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let code = self
                .outcomes
                .iter()
                .find(|(marker, _)| command.contains(marker.as_str()))
                .map(|(_, code)| *code)
                .unwrap_or(0);
            Ok(code)
        })
    }
}
