use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Countdown latch joining one round's device completions.
///
/// The dispatching thread holds one count from creation until [`wait`], so a
/// device that finishes before the others are dispatched cannot release the
/// waiter early. Every registered completion adds a count before its callback
/// is installed; whichever decrement reaches zero performs the single wake-up.
///
/// [`wait`]: CompletionLatch::wait
pub struct CompletionLatch {
    count: AtomicUsize,
    signaled: Mutex<bool>,
    cv: Condvar,
    signals: AtomicUsize,
}

impl CompletionLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(1),
            signaled: Mutex::new(false),
            cv: Condvar::new(),
            signals: AtomicUsize::new(0),
        })
    }

    /// Adds one outstanding completion. Call before registering the callback
    /// that will `count_down`.
    pub fn register(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn count_down(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "latch counted below zero");
        if prev == 1 {
            let mut s = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
            *s = true;
            self.signals.fetch_add(1, Ordering::AcqRel);
            self.cv.notify_all();
        }
    }

    /// Releases the dispatcher's hold and blocks until every registered
    /// completion has fired.
    pub fn wait(&self) {
        self.count_down();
        let mut s = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
        while !*s {
            s = self.cv.wait(s).unwrap_or_else(|p| p.into_inner());
        }
    }

    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Number of times the latch reached zero; 1 after a completed round.
    pub fn signal_count(&self) -> usize {
        self.signals.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_without_registrations_returns_immediately() {
        let latch = CompletionLatch::new();
        latch.wait();
        assert_eq!(latch.signal_count(), 1);
        assert_eq!(latch.pending(), 0);
    }

    #[test]
    fn early_completion_does_not_release_dispatcher() {
        let latch = CompletionLatch::new();
        latch.register();
        latch.count_down();
        assert_eq!(latch.signal_count(), 0);
        latch.register();
        let l = latch.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            l.count_down();
        });
        latch.wait();
        t.join().unwrap();
        assert_eq!(latch.signal_count(), 1);
    }
}
