//! Interactive prompt auto-responder
//!
//! Some SDK tools stop on yes/no questions (license acceptance, custom
//! hardware profiles). The responder keeps writing a fixed answer to stdin
//! until the tool exits. There is no prompt detection; answers written when
//! no prompt is pending are simply read by nobody.

use std::time::Duration;

use tracing::trace;

use crate::process::{ProcessError, ProcessOutput, ProcessSpec, RunningProcess};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoResponder {
    response: String,
    interval: Duration,
}

impl AutoResponder {
    pub fn new(response: impl Into<String>, interval: Duration) -> Self {
        Self {
            response: response.into(),
            interval,
        }
    }

    /// Answers `y`, used for license prompts
    pub fn affirmative() -> Self {
        Self::new("y", DEFAULT_INTERVAL)
    }

    /// Answers with an empty line, taking whatever default the prompt offers
    pub fn accept_default() -> Self {
        Self::new("", DEFAULT_INTERVAL)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Answer until the process exits. Returns how many answers were written.
    pub async fn drive(&self, process: &mut RunningProcess) -> usize {
        let mut exit = process.exit_watch();
        let mut written = 0;

        loop {
            if exit.has_exited() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = exit.wait() => break,
            }

            // Stdin may already be closed on a dying process
            match process.write_line(&self.response).await {
                Ok(()) => written += 1,
                Err(e) => trace!("Auto-response to {} not delivered: {}", process.program(), e),
            }
        }

        written
    }

    /// Launch `spec` interactively, answer until it exits and apply the exit policy
    pub async fn run(&self, spec: ProcessSpec) -> Result<ProcessOutput, ProcessError> {
        let mut process = spec.interactive(true).launch()?;
        self.drive(&mut process).await;
        process.wait_for_exit().await
    }
}

impl Default for AutoResponder {
    fn default() -> Self {
        Self::affirmative()
    }
}
