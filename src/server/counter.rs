//! Outstanding-work counter.

use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::error;

/// Counts units of work in progress; [`wait`](Self::wait) resolves when the
/// count is zero.
///
/// Every [`add`](Self::add) must be matched by exactly one
/// [`done`](Self::done). An unmatched `done` is logged and ignored, so the
/// count never goes negative.
#[derive(Debug, Default)]
pub struct WorkCounter {
    count: AtomicUsize,
    zero: Notify,
}

impl WorkCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn done(&self) {
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.zero.notify_waiters(),
            Ok(_) => {}
            Err(_) => error!("outstanding-work counter decremented below zero, ignoring"),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until the count is zero.
    pub async fn wait(&self) {
        loop {
            let mut notified = pin!(self.zero.notified());
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_wait_on_zero_returns_immediately() {
        let counter = WorkCounter::new();
        tokio::time::timeout(Duration::from_secs(1), counter.wait())
            .await
            .expect("wait on empty counter should not block");
    }

    #[test]
    fn test_wait_blocks_until_done() {
        let counter = WorkCounter::new();
        counter.add();
        counter.add();

        let mut wait = task::spawn(counter.wait());
        assert_pending!(wait.poll());

        counter.done();
        assert!(!wait.is_woken());
        assert_pending!(wait.poll());

        counter.done();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[test]
    fn test_unmatched_done_is_ignored() {
        let counter = WorkCounter::new();
        counter.done();
        assert_eq!(counter.count(), 0);

        counter.add();
        assert_eq!(counter.count(), 1);
    }

    #[tokio::test]
    async fn test_wait_survives_reuse() {
        let counter = Arc::new(WorkCounter::new());
        counter.add();
        counter.done();
        counter.add();

        let waiter = {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        counter.done();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
