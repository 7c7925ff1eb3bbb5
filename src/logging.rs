//! Test logging

use slog::{o, Drain, Logger};

/// Logger whose output is captured per test by the test runner
pub fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}
