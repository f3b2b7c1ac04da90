//! Readiness gating on log output.

use std::time::Duration;

use futures::{Stream, StreamExt as _};
use tracing::info;

use crate::runtime::RuntimeError;

/// Result of waiting for a readiness phrase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// A line containing the phrase was seen.
    Found,

    /// The log stream ended first.
    StreamEnded,

    /// The timeout elapsed first.
    TimedOut,
}

/// Waits for a phrase to show up in a log stream.
#[derive(Clone, Debug)]
pub struct ReadinessGate {
    phrase: String,
    timeout: Duration,
    echo: bool,
}

impl ReadinessGate {
    /// Creates a new `ReadinessGate` for the given phrase and timeout.
    pub fn new(phrase: impl Into<String>, timeout: Duration) -> Self {
        Self {
            phrase: phrase.into(),
            timeout,
            echo: false,
        }
    }

    /// Logs every line seen while waiting.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Returns the phrase being waited for.
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// Returns the timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Consumes `lines` until one contains the phrase, the stream ends, or the timeout elapses.
    ///
    /// The phrase is matched as an exact substring.
    ///
    /// # Errors
    ///
    /// If the stream yields an error before the phrase is found, it will be returned.
    pub async fn wait<S>(&self, lines: S) -> Result<GateOutcome, RuntimeError>
    where
        S: Stream<Item = Result<String, RuntimeError>> + Unpin,
    {
        self.scan(lines, |_| {}).await
    }

    /// Like [`wait`][Self::wait], but hands every line seen (including the matching one) to `observe`.
    ///
    /// # Errors
    ///
    /// If the stream yields an error before the phrase is found, it will be returned.
    pub async fn scan<S, F>(&self, mut lines: S, mut observe: F) -> Result<GateOutcome, RuntimeError>
    where
        S: Stream<Item = Result<String, RuntimeError>> + Unpin,
        F: FnMut(&str),
    {
        let search = async {
            while let Some(line) = lines.next().await {
                let line = line?;
                if self.echo {
                    info!("{}", line);
                }
                observe(&line);
                if line.contains(&self.phrase) {
                    return Ok(GateOutcome::Found);
                }
            }
            Ok::<_, RuntimeError>(GateOutcome::StreamEnded)
        };

        tokio::time::timeout(self.timeout, search)
            .await
            .unwrap_or(Ok(GateOutcome::TimedOut))
    }
}
