//! Bounded thread joins shared by the connection and processor shutdown paths.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::warn;

/// Default bound on every owned-thread join at shutdown.
pub(crate) const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Joins a thread, giving up after `timeout`. A thread that fails to stop in
/// time is logged as a warning and detached, never escalated.
pub(crate) fn join_with_timeout(owner: &str, handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                "[{owner}] thread {:?} did not stop within {timeout:?}, detaching",
                handle.thread().name().unwrap_or("<unnamed>")
            );
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        warn!("[{owner}] thread terminated by panic");
    }
}
