use crate::{CompletionEvent, DeviceError, EventCallback, EventStatus};
use std::sync::{Condvar, Mutex, MutexGuard};

struct Inner {
    status: EventStatus,
    output: Option<Vec<u8>>,
    callbacks: Vec<EventCallback>,
}

/// Event completed by host code rather than by a device driver.
///
/// Runtimes hand these out from `enqueue` and complete them from their worker
/// threads; tests use them to fire completions in any order they like.
pub struct UserEvent {
    inner: Mutex<Inner>,
    done: Condvar,
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl UserEvent {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: EventStatus::Queued,
                output: None,
                callbacks: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_running(&self) {
        let mut inner = self.lock();
        if !inner.status.is_terminal() {
            inner.status = EventStatus::Running;
        }
    }

    pub fn complete(&self, output: Vec<u8>) {
        self.finish(EventStatus::Complete, Some(output));
    }

    pub fn fail(&self, code: i32) {
        self.finish(EventStatus::Failed(code), None);
    }

    fn finish(&self, status: EventStatus, output: Option<Vec<u8>>) {
        let callbacks = {
            let mut inner = self.lock();
            if inner.status.is_terminal() {
                return;
            }
            inner.status = status;
            inner.output = output;
            std::mem::take(&mut inner.callbacks)
        };
        self.done.notify_all();
        for cb in callbacks {
            cb(status);
        }
    }
}

impl CompletionEvent for UserEvent {
    fn status(&self) -> EventStatus {
        self.lock().status
    }

    fn set_callback(&self, cb: EventCallback) -> Result<(), DeviceError> {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            let status = inner.status;
            drop(inner);
            cb(status);
        } else {
            inner.callbacks.push(cb);
        }
        Ok(())
    }

    fn wait(&self) -> EventStatus {
        let mut inner = self.lock();
        while !inner.status.is_terminal() {
            inner = self.done.wait(inner).unwrap_or_else(|p| p.into_inner());
        }
        inner.status
    }

    fn take_output(&self) -> Option<Vec<u8>> {
        self.lock().output.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn callback_fires_once_on_completion() {
        let ev = UserEvent::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ev.set_callback(Box::new(move |st: EventStatus| {
            assert_eq!(st, EventStatus::Complete);
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        ev.complete(b"abc".to_vec());
        ev.complete(b"ignored".to_vec());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ev.take_output().as_deref(), Some(&b"abc"[..]));
        assert_eq!(ev.take_output(), None);
    }

    #[test]
    fn late_callback_runs_immediately() {
        let ev = UserEvent::new();
        ev.fail(-4);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ev.set_callback(Box::new(move |st: EventStatus| {
            assert_eq!(st, EventStatus::Failed(-4));
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_blocks_until_other_thread_completes() {
        let ev = Arc::new(UserEvent::new());
        let remote = ev.clone();
        let t = std::thread::spawn(move || {
            remote.set_running();
            std::thread::sleep(std::time::Duration::from_millis(20));
            remote.complete(Vec::new());
        });
        assert_eq!(ev.wait(), EventStatus::Complete);
        t.join().unwrap();
    }
}
