use crate::domain::inhibit::{
    arbitrate, Arbiter, ArbiterPhase, Enforcement, InhibitHolder, SourceRole, StateUpdate,
};
use crate::ports::{ThrottleError, ThrottleTarget};
use crate::telemetry::InhibitorMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically folds every source's vote into one decision, publishes it
/// and drives the throttle target on phase edges.
pub struct ArbitrationLoop<T: ThrottleTarget> {
    holder: Arc<InhibitHolder>,
    target: Arc<T>,
    arbiter: Arbiter,
    target_connected: bool,
    needs_sync: bool,
    seen_generation: u64,
    metrics: Option<Arc<InhibitorMetrics>>,
    phase_tx: watch::Sender<ArbiterPhase>,
}

impl<T: ThrottleTarget> ArbitrationLoop<T> {
    pub fn new(holder: Arc<InhibitHolder>, target: Arc<T>) -> Self {
        let (phase_tx, _) = watch::channel(ArbiterPhase::default());
        Self {
            holder,
            target,
            arbiter: Arbiter::new(),
            target_connected: false,
            needs_sync: false,
            seen_generation: 0,
            metrics: None,
            phase_tx,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<InhibitorMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ArbiterPhase> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> ArbiterPhase {
        self.arbiter.phase()
    }

    pub fn target_connected(&self) -> bool {
        self.target_connected
    }

    /// One arbitration pass. Errors only come from enforcing the decision on
    /// the target; the decision itself is always published first.
    pub async fn tick(&mut self) -> Result<(), ThrottleError> {
        self.check_target().await;

        // Read before the source list so an append racing this tick is seen
        // again on the next one.
        let generation = self.holder.generation();
        let sources = self.holder.sources();
        let decision = arbitrate(sources.iter().map(Arc::as_ref));
        let outcome = self.arbiter.observe(&decision);
        let membership_changed = generation != self.seen_generation;
        self.seen_generation = generation;

        // A replacement source starts from a blank snapshot, so it gets the
        // current decision even when nothing else moved.
        if outcome.republish || membership_changed {
            debug!(
                inhibiting = decision.inhibiting,
                inhibited_by = ?decision.inhibited_by,
                overridden = decision.overridden,
                "Publishing decision"
            );
            self.holder.update_state(&decision.to_update());
        }
        self.holder.silent_update_state(&self.connectivity());
        self.phase_tx.send_replace(self.arbiter.phase());

        let pending = match outcome.enforcement {
            Some(action) => Some(action),
            None if self.needs_sync => Some(if self.arbiter.phase().is_inhibiting() {
                Enforcement::Engage
            } else {
                Enforcement::Release
            }),
            None => None,
        };
        match pending {
            Some(action) => self.enforce(action).await,
            None => Ok(()),
        }
    }

    async fn check_target(&mut self) {
        if self.target_connected {
            if let Err(err) = self.target.probe().await {
                warn!(error = %err, "Lost connection to throttle target");
                self.target_connected = false;
            }
            return;
        }
        match self.target.login().await {
            Ok(()) => {
                info!("Connected to throttle target");
                self.target_connected = true;
                self.needs_sync = true;
            }
            Err(err) => debug!(error = %err, "Throttle target still unavailable"),
        }
    }

    fn connectivity(&self) -> StateUpdate {
        let role_connected = |role| self.holder.get_by_role(role).map(|s| s.connected());
        StateUpdate {
            qbt_connection: Some(self.target_connected),
            plex_connection: Some(role_connected(SourceRole::Media)),
            net_connection: Some(role_connected(SourceRole::Network)),
            ..StateUpdate::default()
        }
    }

    async fn enforce(&mut self, action: Enforcement) -> Result<(), ThrottleError> {
        if !self.target_connected {
            // Applied once the target is reachable again.
            self.needs_sync = true;
            return Ok(());
        }
        let result = self.target.set_rate_limit(action.rate_limited()).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_enforcement(action.as_str(), result.is_ok());
        }
        match result {
            Ok(()) => {
                info!(action = action.as_str(), "Throttle updated");
                self.needs_sync = false;
                Ok(())
            }
            Err(err) => {
                self.needs_sync = true;
                if matches!(err, ThrottleError::Disconnected | ThrottleError::Transport(_)) {
                    self.target_connected = false;
                }
                Err(err)
            }
        }
    }

    /// Runs ticks until `stop` fires, then logs out of the target.
    pub async fn run(mut self, stop: CancellationToken, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "Arbitration tick failed to enforce decision");
                    }
                }
            }
        }

        if self.target_connected {
            if let Err(err) = self.target.logout().await {
                debug!(error = %err, "Logout from throttle target failed");
            }
        }
        debug!("Arbitration loop stopped");
    }
}
