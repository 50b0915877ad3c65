use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot broadcast flag governing the run. Fired by signal handlers, the
/// engine, or tests; observed by the executor, every VU worker, the API
/// server and the collector loop.
#[derive(Debug, Default)]
pub struct Shutdown {
    fired: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        while !self.is_fired() {
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}
