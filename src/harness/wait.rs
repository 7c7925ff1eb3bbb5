//! Bounded waits
//!
//! Every wait in the harness has a deadline; expiry is reported as a fatal
//! failure so a broken cluster fails the test instead of hanging it.

use crate::engine::{NodeState, Raft};
use crate::harness::reporter::TestReporter;
use std::time::Duration;
use tokio::time::{self, Instant};

/// Poll interval used by the leadership waits
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Wait until `condition` holds.
///
/// The condition is checked immediately and then every `poll_interval`
/// until `timeout` has elapsed since the call, at which point the failure is
/// reported with `description` and the elapsed time.
pub async fn wait_until<F>(
    reporter: &dyn TestReporter,
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
    description: &str,
) where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let deadline = start + timeout;
    loop {
        if condition() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            reporter.fatal(&format!(
                "{} within {:?} (waited {:?})",
                description,
                timeout,
                now - start
            ));
        }
        time::sleep(poll_interval.min(deadline - now)).await;
    }
}

/// Wait until `raft` considers itself the leader
pub async fn wait_leader(reporter: &dyn TestReporter, raft: &Raft, timeout: Duration) {
    wait_until(
        reporter,
        || raft.state() == NodeState::Leader,
        timeout,
        POLL_INTERVAL,
        "node did not become leader",
    )
    .await;
}
