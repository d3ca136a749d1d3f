// Process-scoped cancellation. The engine hand-rolls stop signals per
// bridge (`static STOP_SIGNAL: OnceLock<Arc<AtomicBool>>` in
// engine/irc.rs, engine/webhook.rs, ...); this generalizes that pattern
// into one reusable, clonable token shared by every background task
// instead of re-declaring a static per subsystem.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits for
    /// the next `cancel()` call. Intended to be raced in `tokio::select!`
    /// against whatever I/O a task is otherwise blocked on.
    ///
    /// `notify_waiters()` only wakes futures already registered as
    /// waiters, and a `Notified` future doesn't register until its first
    /// poll — so a naive "check flag, then `.await`" still has a window
    /// where a `cancel()` landing in between is lost. `enable()` forces
    /// registration up front, closing it (this is `Notify`'s documented
    /// pattern for exactly this race).
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("cancellation should wake the waiter")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn already_cancelled_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), token.cancelled())
            .await
            .expect("should return immediately when already cancelled");
    }
}
