//! Counter of in-flight server tasks that `stop` can wait on.

use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct Inner {
    count: Mutex<usize>,
    zero: Condvar,
}

/// Tracks running tasks; each [`Ticket`] keeps the count raised until dropped.
#[derive(Clone, Default)]
pub(crate) struct WaitGroup {
    inner: Arc<Inner>,
}

/// Released on drop, including during unwinding.
pub(crate) struct Ticket {
    inner: Arc<Inner>,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&self) -> Ticket {
        *self.count() += 1;
        Ticket {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Block until every ticket has been dropped.
    pub(crate) fn wait(&self) {
        let mut count = self.count();
        while *count > 0 {
            count = self
                .inner
                .zero
                .wait(count)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        *self.count()
    }

    fn count(&self) -> std::sync::MutexGuard<'_, usize> {
        self.inner
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut count = self
            .inner
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *count -= 1;
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_when_tickets_dropped() {
        let group = WaitGroup::new();
        let a = group.enter();
        let b = group.enter();
        assert_eq!(group.active(), 2);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(a);
            drop(b);
        });

        group.wait();
        assert_eq!(group.active(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_with_no_tickets() {
        WaitGroup::new().wait();
    }
}
