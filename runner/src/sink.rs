use crate::job::{JobOutcome, JobState};
use parking_lot::FairMutex;
use std::io::{self, Write};
use tracing::warn;

/// Console shared by all cluster threads. A job and its result are written
/// under one lock so blocks of different clusters never interleave.
pub struct Console {
    out: FairMutex<Box<dyn Write + Send>>,
}

impl Console {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            out: FairMutex::new(writer),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn report(&self, cluster: &str, outcome: &JobOutcome) {
        let mut block = format!("[{cluster}] {}", outcome.command);

        if outcome.state == JobState::CacheHit {
            block.push_str(" (cached)");
        }
        block.push('\n');

        match (&outcome.result, &outcome.error) {
            (Some(result), _) => {
                block.push_str(result.trim_end());
                block.push('\n');
            }
            (None, Some(error)) => {
                block.push_str(&format!("   failed: {error}\n"));
            }
            (None, None) => {}
        }
        block.push('\n');

        self.write(&block);
    }

    /// free form line, e.g. a per cluster summary
    pub fn line(&self, line: &str) {
        self.write(&format!("{line}\n"));
    }

    fn write(&self, block: &str) {
        let mut out = self.out.lock();

        if let Err(error) = out.write_all(block.as_bytes()).and_then(|_| out.flush()) {
            warn!(error = ?error, "Failed to write to the console");
        }
    }

    pub fn flush(&self) {
        if let Err(error) = self.out.lock().flush() {
            warn!(error = ?error, "Failed to flush the console");
        }
    }
}
