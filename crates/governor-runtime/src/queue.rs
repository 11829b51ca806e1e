//! FIFO intake queue for cascades.
//!
//! `push` never blocks. `dequeue` waits for a submission or a timeout,
//! whichever comes first, so the processor wakes immediately on new work
//! but still gets a chance to re-check health while idle.

use governor_core::Cascade;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct CascadeQueue {
    items: Mutex<VecDeque<Cascade>>,
    notify: Notify,
}

impl CascadeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail and wake a waiting consumer.
    pub fn push(&self, cascade: Cascade) {
        self.items.lock().push_back(cascade);
        self.notify.notify_one();
    }

    /// Take the head of the queue, waiting up to `wait` for one to arrive.
    ///
    /// Cancel-safe: a cascade is only removed when it is returned.
    pub async fn dequeue(&self, wait: Duration) -> Option<Cascade> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            let next = self.items.lock().pop_front();
            if next.is_some() {
                return next;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.items.lock().pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
