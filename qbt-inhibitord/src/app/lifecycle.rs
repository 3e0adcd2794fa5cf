use crate::domain::inhibit::{ArbiterPhase, InhibitHolder, StateUpdate};
use crate::ports::ServiceHooks;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const UPDATE_COUNTDOWN: Duration = Duration::from_secs(60);
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Daemon-side handling of `restart`, `pref_update` and `deny_update`.
///
/// A restart publishes a message and then stops the daemon; bringing the
/// binary back up (possibly a newer one) is left to the process manager.
#[derive(Clone)]
pub struct DaemonHooks {
    shared: Arc<Shared>,
}

struct Shared {
    holder: Arc<InhibitHolder>,
    stop: CancellationToken,
    phase: watch::Receiver<ArbiterPhase>,
    countdown: Duration,
    restart_delay: Duration,
    restart_requested: AtomicBool,
    pending_update: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonHooks {
    pub fn new(
        holder: Arc<InhibitHolder>,
        stop: CancellationToken,
        phase: watch::Receiver<ArbiterPhase>,
    ) -> Self {
        Self::with_timing(holder, stop, phase, UPDATE_COUNTDOWN, RESTART_DELAY)
    }

    pub fn with_timing(
        holder: Arc<InhibitHolder>,
        stop: CancellationToken,
        phase: watch::Receiver<ArbiterPhase>,
        countdown: Duration,
        restart_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                holder,
                stop,
                phase,
                countdown,
                restart_delay,
                restart_requested: AtomicBool::new(false),
                pending_update: Mutex::new(None),
            }),
        }
    }

    pub fn restart_requested(&self) -> bool {
        self.shared.restart_requested.load(Ordering::Acquire)
    }
}

impl Shared {
    fn publish(&self, message: impl Into<String>) {
        self.holder.update_state(&StateUpdate::message(message));
    }

    fn request_restart(self: &Arc<Self>) {
        if self.restart_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Restart requested");
        self.publish("Restarting...");
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(shared.restart_delay).await;
            shared.stop.cancel();
        });
    }

    fn cancelled(&self) -> bool {
        self.stop.is_cancelled() || self.phase.borrow().is_inhibiting()
    }

    async fn run_countdown(self: Arc<Self>) {
        let mut remaining = self.countdown.as_secs();
        while remaining > 0 {
            if self.cancelled() {
                info!("Update cancelled");
                self.publish("Update cancelled");
                return;
            }
            self.publish(format!("Updating in {remaining} seconds"));
            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            remaining -= 1;
        }
        if self.cancelled() {
            self.publish("Update cancelled");
            return;
        }
        self.publish("Updating...");
        self.request_restart();
    }
}

#[async_trait]
impl ServiceHooks for DaemonHooks {
    async fn restart(&self) {
        self.shared.request_restart();
    }

    async fn update_response(&self, accepted: bool) {
        if !accepted {
            if let Some(task) = self.shared.pending_update.lock().take() {
                task.abort();
            }
            info!("Update declined");
            self.shared.publish("Update declined");
            return;
        }
        // Check and store under one lock so concurrent accepts start a
        // single countdown.
        let mut pending = self.shared.pending_update.lock();
        if pending.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *pending = Some(tokio::spawn(Arc::clone(&self.shared).run_countdown()));
    }
}
