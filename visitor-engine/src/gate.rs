//! Countdown gate with force-drain.
//!
//! A gate starts at a count and opens once the count reaches zero, either by
//! repeated [`Gate::signal_one`] calls or by a single [`Gate::drain_all`].
//! Once open it stays open. Blocking waiters park on a condvar; async
//! waiters park on a tokio `Notify`.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// Outcome of a bounded wait on a [`Gate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateWait {
    /// The gate was open when the wait returned.
    pub completed: bool,
    /// The wait gave up because the timeout elapsed.
    pub expired: bool,
}

impl GateWait {
    fn from_open(open: bool) -> Self {
        Self {
            completed: open,
            expired: !open,
        }
    }
}

#[derive(Debug)]
pub struct Gate {
    count: Mutex<u32>,
    opened: Condvar,
    notify: Notify,
}

impl Gate {
    pub fn new(count: u32) -> Self {
        Self {
            count: Mutex::new(count),
            opened: Condvar::new(),
            notify: Notify::new(),
        }
    }

    // The count is a plain integer, so a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, u32> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signals still needed before the gate opens.
    pub fn count(&self) -> u32 {
        *self.lock()
    }

    pub fn is_open(&self) -> bool {
        self.count() == 0
    }

    /// Count down by one. No-op once open.
    pub fn signal_one(&self) {
        let mut count = self.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.release();
            }
        }
    }

    /// Open the gate immediately. Idempotent.
    pub fn drain_all(&self) {
        let mut count = self.lock();
        *count = 0;
        self.release();
    }

    fn release(&self) {
        self.opened.notify_all();
        self.notify.notify_waiters();
    }

    /// Block the calling thread until the gate opens or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> GateWait {
        let guard = self.lock();
        let (guard, _) = self
            .opened
            .wait_timeout_while(guard, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        GateWait::from_open(*guard == 0)
    }

    /// Async counterpart of [`Gate::wait`]; never blocks a runtime worker.
    pub async fn wait_async(&self, timeout: Duration) -> GateWait {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the count so a release between the check
        // and the await is not lost.
        notified.as_mut().enable();

        if self.is_open() {
            return GateWait::from_open(true);
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        GateWait::from_open(self.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_signal_one_counts_down() {
        let gate = Gate::new(2);
        gate.signal_one();
        assert_eq!(gate.count(), 1);
        assert!(!gate.is_open());
        gate.signal_one();
        assert!(gate.is_open());
        gate.signal_one();
        assert_eq!(gate.count(), 0);
    }

    #[test]
    fn test_drain_all_is_idempotent() {
        let gate = Gate::new(5);
        gate.drain_all();
        gate.drain_all();
        assert!(gate.is_open());
        assert_eq!(gate.wait(Duration::ZERO), GateWait { completed: true, expired: false });
    }

    #[test]
    fn test_wait_expires_on_closed_gate() {
        let gate = Gate::new(1);
        let start = Instant::now();
        let result = gate.wait(Duration::from_millis(50));
        assert_eq!(result, GateWait { completed: false, expired: true });
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_drain_wakes_blocked_waiters() {
        let gate = Arc::new(Gate::new(3));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait(Duration::from_secs(10)))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        gate.drain_all();

        for waiter in waiters {
            assert!(waiter.join().unwrap().completed);
        }
    }

    #[test]
    fn test_zero_sized_gate_starts_open() {
        assert!(Gate::new(0).wait(Duration::ZERO).completed);
    }

    #[tokio::test]
    async fn test_wait_async_completes_on_signal() {
        let gate = Arc::new(Gate::new(1));
        let signaller = Arc::clone(&gate);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signaller.signal_one();
        });

        let result = gate.wait_async(Duration::from_secs(5)).await;
        assert!(result.completed);
    }

    #[tokio::test]
    async fn test_wait_async_expires() {
        let gate = Gate::new(1);
        let result = gate.wait_async(Duration::from_millis(20)).await;
        assert!(result.expired);
        assert!(!result.completed);
    }
}
