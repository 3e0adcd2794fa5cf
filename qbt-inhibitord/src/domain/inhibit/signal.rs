use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Single-slot, level-triggered wakeup.
///
/// Any number of [`ChangeEvent::set`] calls made before a waiter observes the
/// flag collapse into one wakeup. The flag stays raised until a consumer
/// clears it, so a `set` that lands while nobody is waiting is never lost.
#[derive(Debug, Default)]
pub struct ChangeEvent {
    flag: AtomicBool,
    notify: Notify,
}

impl ChangeEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Lowers the flag and reports whether it was raised.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    /// Resolves once the flag is raised. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the flag so a concurrent `set`
            // between the check and the await still wakes us.
            notified.as_mut().enable();
            if self.is_set() {
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

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let event = ChangeEvent::new();
        event.set();
        tokio::time::timeout(Duration::from_millis(50), event.wait())
            .await
            .expect("raised event should not block");
    }

    #[tokio::test]
    async fn multiple_sets_coalesce_into_one_wakeup() {
        let event = ChangeEvent::new();
        event.set();
        event.set();
        event.set();
        event.wait().await;
        assert!(event.take());
        assert!(!event.is_set());
        let pending = tokio::time::timeout(Duration::from_millis(30), event.wait()).await;
        assert!(pending.is_err(), "coalesced sets must not leave extra wakeups");
    }

    #[tokio::test]
    async fn waiter_is_woken_by_later_set() {
        let event = Arc::new(ChangeEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            tokio::spawn(async move { event.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.set();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter timed out")
            .expect("waiter panicked");
    }
}
