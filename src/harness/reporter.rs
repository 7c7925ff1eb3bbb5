//! Failure reporting
//!
//! Harness failures never bubble up as `Result`s: a cluster that cannot be
//! built or torn down leaves the test nothing sensible to do. They go to an
//! injected reporter instead.

use crate::logging::test_logger;
use slog::{error, info, Logger};
use std::sync::Arc;

/// Sink for harness failures and progress messages
pub trait TestReporter: Send + Sync {
    /// Record a failure and abort the current test
    fn fatal(&self, message: &str) -> !;

    /// Record a progress message
    fn log(&self, message: &str);
}

/// Reporter that logs and then panics, failing the running `#[test]`
pub struct PanicReporter {
    logger: Logger,
}

impl PanicReporter {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    /// Reporter over the test logger, ready to hand to `cluster`
    pub fn shared() -> Arc<dyn TestReporter> {
        Arc::new(Self::new(test_logger()))
    }
}

impl TestReporter for PanicReporter {
    fn fatal(&self, message: &str) -> ! {
        error!(self.logger, "{}", message);
        panic!("{}", message);
    }

    fn log(&self, message: &str) {
        info!(self.logger, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "cluster exploded")]
    fn test_fatal_panics_with_message() {
        PanicReporter::shared().fatal("cluster exploded");
    }

    #[test]
    fn test_log_does_not_panic() {
        PanicReporter::shared().log("all good");
    }
}
