//! Wakeup primitive shared by the worker threads.
//!
//! The reader and each decoder block on "any of several conditions changed"
//! (packet arrived, frame slot freed, stop requested, resume requested).
//! Instead of one semaphore per condition, every producer pokes the
//! consumer's `Notifier`; the consumer snapshots a token, re-checks its
//! work, and only then waits. A poke between snapshot and wait makes the
//! wait return immediately, so wakeups cannot be lost.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Generation token taken before checking for work. See [`Notifier::wait`].
#[derive(Debug, Clone, Copy)]
pub struct WaitToken(u64);

/// A condition-variable wakeup channel with timed waits.
#[derive(Debug, Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every thread currently (or about to be) waiting on this notifier.
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    /// Snapshots the current generation. Take the token *before* checking
    /// for work so a notify racing with the check is not missed.
    pub fn token(&self) -> WaitToken {
        WaitToken(*self.generation.lock())
    }

    /// Blocks until notified after `token` was taken, or until `timeout`
    /// elapses. Returns `true` if a notification arrived.
    pub fn wait(&self, token: WaitToken, timeout: Duration) -> bool {
        let mut generation = self.generation.lock();
        if *generation != token.0 {
            return true;
        }
        self.condvar.wait_for(&mut generation, timeout);
        *generation != token.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_notify_before_wait_returns_immediately() {
        let notifier = Notifier::new();
        let token = notifier.token();
        notifier.notify();
        let start = Instant::now();
        assert!(notifier.wait(token, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out_without_notify() {
        let notifier = Notifier::new();
        let token = notifier.token();
        assert!(!notifier.wait(token, Duration::from_millis(20)));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let notifier = Arc::new(Notifier::new());
        let token = notifier.token();
        let remote = Arc::clone(&notifier);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.notify();
        });
        assert!(notifier.wait(token, Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
