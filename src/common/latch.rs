use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A one-shot async event.
///
/// Slots use a pair of these for their read turn and completion; the pool
/// uses one per waiter. `fire` is idempotent and `wait` resolves
/// immediately once fired, so the firing and waiting sides need no
/// ordering protocol between them.
#[derive(Debug, Default)]
pub(crate) struct Latch {
    fired: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        if !self.fired.swap(true, Ordering::Release) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        while !self.is_fired() {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before the re-check, or a fire in between is lost
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}
