use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shared wake/shutdown plumbing between the store, the controller and
/// the workers. A work notification is level-triggered: notifications
/// arriving while nobody waits are latched in `work_pending`.
#[derive(Default)]
pub struct WorkContext {
    notify: Notify,
    work_pending: AtomicBool,
    found_work: AtomicU64,
    wakes: AtomicU64,
    cancel: CancellationToken,
}

impl WorkContext {
    pub fn new() -> Self {
        WorkContext::default()
    }

    /// Signal that local data changed and replication may have something
    /// to do.
    pub fn notify_about_work(&self) {
        self.work_pending.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// A worker replicated something; wake idle loops so follow-up work
    /// is picked up promptly.
    pub fn update_found_work(&self) {
        self.found_work.fetch_add(1, Ordering::SeqCst);
        self.notify_about_work();
    }

    pub fn found_work_count(&self) -> u64 {
        self.found_work.load(Ordering::SeqCst)
    }

    /// Wait until work is signalled, the timeout elapses, or shutdown.
    /// Returns true only for a work-triggered wake.
    pub async fn wait_for_work(&self, timeout: Duration, name: &str) -> bool {
        self.wakes.fetch_add(1, Ordering::Relaxed);
        if self.work_pending.swap(false, Ordering::SeqCst) {
            return true;
        }
        // Register the waiter before re-checking the latch so a notify
        // between the swap above and the select below is not lost.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.work_pending.swap(false, Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = &mut notified => {
                self.work_pending.store(false, Ordering::SeqCst);
                tracing::debug!(name, "woken by work notification");
                true
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!(name, timeout_s = timeout.as_secs(), "woken by timer");
                false
            }
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notification_before_wait_is_not_lost() {
        let work = WorkContext::new();
        work.notify_about_work();
        assert!(work.wait_for_work(Duration::from_millis(10), "test").await);
    }

    #[tokio::test]
    async fn timeout_wake_is_not_work_triggered() {
        let work = WorkContext::new();
        assert!(!work.wait_for_work(Duration::from_millis(10), "test").await);
    }

    #[tokio::test]
    async fn concurrent_notification_wakes_the_waiter() {
        let work = std::sync::Arc::new(WorkContext::new());
        let waiter = {
            let work = work.clone();
            tokio::spawn(async move { work.wait_for_work(Duration::from_secs(5), "test").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        work.notify_about_work();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiters() {
        let work = std::sync::Arc::new(WorkContext::new());
        let waiter = {
            let work = work.clone();
            tokio::spawn(async move { work.wait_for_work(Duration::from_secs(30), "test").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        work.shutdown();
        assert!(!waiter.await.unwrap());
        assert!(work.is_cancelled());
    }
}
