use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// One-shot latch shared between tasks. Once set it stays set, and every
/// current and future waiter is released. Clones observe the same latch.
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

struct TriggerInner {
    set: AtomicBool,
    notify: Notify,
}

impl Trigger {
    pub fn new() -> Self {
        Trigger {
            inner: Arc::new(TriggerInner {
                set: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn set(&self) {
        if !self.inner.set.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    pub async fn async_wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering, set() may have raced us
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::new()
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger").field("set", &self.is_set()).finish()
    }
}
