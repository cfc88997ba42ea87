//! Per-execution output accumulators.

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Push-based capture of the two standard streams for a single execution.
///
/// Every chunk is appended in arrival order with a `\n` between successive
/// chunks of the same stream. The streams never interleave with each other.
#[derive(Debug, Default)]
pub struct OutputCapture {
    stdout: Option<String>,
    stderr: Option<String>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stream: Stream, chunk: &str) {
        let slot = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        match slot {
            Some(acc) => {
                acc.push('\n');
                acc.push_str(chunk);
            }
            None => *slot = Some(chunk.to_string()),
        }
    }

    /// Record a failure description on stderr.
    pub fn fail(&mut self, error: impl Display) {
        self.push(Stream::Stderr, &error.to_string());
    }

    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    /// Consume into `(stdout, stderr)`; blank streams come back absent.
    pub fn finish(self) -> (Option<String>, Option<String>) {
        (settle(self.stdout), settle(self.stderr))
    }
}

fn settle(stream: Option<String>) -> Option<String> {
    let mut text = stream?;
    let kept = text.trim_end().len();
    text.truncate(kept);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
