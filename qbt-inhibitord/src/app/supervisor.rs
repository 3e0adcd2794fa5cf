use super::collaborators::Collaborator;
use crate::domain::inhibit::{InhibitHolder, InhibitSource};
use crate::telemetry::InhibitorMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Keeps one source per collaborator alive in the holder, replacing it
/// whenever its task exits while the daemon is still running.
pub struct Supervisor {
    holder: Arc<InhibitHolder>,
    stop: CancellationToken,
    restart_delay: Duration,
    grace: Duration,
    metrics: Option<Arc<InhibitorMetrics>>,
    loops: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(holder: Arc<InhibitHolder>, stop: CancellationToken) -> Self {
        Self {
            holder,
            stop,
            restart_delay: DEFAULT_RESTART_DELAY,
            grace: DEFAULT_SHUTDOWN_GRACE,
            metrics: None,
            loops: Vec::new(),
        }
    }

    pub fn with_timing(mut self, restart_delay: Duration, grace: Duration) -> Self {
        self.restart_delay = restart_delay;
        self.grace = grace;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<InhibitorMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn spawn(&mut self, collaborator: Arc<dyn Collaborator>) {
        let supervised = Supervised {
            collaborator,
            holder: Arc::clone(&self.holder),
            stop: self.stop.clone(),
            restart_delay: self.restart_delay,
            grace: self.grace,
            metrics: self.metrics.clone(),
        };
        self.loops.push(tokio::spawn(supervised.run()));
    }

    /// Signals every source, waits for the supervision loops to wind down
    /// and aborts whatever is left after the grace period.
    pub async fn shutdown(self) {
        self.stop.cancel();
        self.holder.request_shutdown();

        let deadline = tokio::time::Instant::now() + self.grace + Duration::from_secs(1);
        for mut handle in self.loops {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Supervision loop did not stop in time, aborting");
                handle.abort();
            }
        }
        debug!("Supervisor stopped");
    }
}

struct Supervised {
    collaborator: Arc<dyn Collaborator>,
    holder: Arc<InhibitHolder>,
    stop: CancellationToken,
    restart_delay: Duration,
    grace: Duration,
    metrics: Option<Arc<InhibitorMetrics>>,
}

impl Supervised {
    async fn run(self) {
        let role = self.collaborator.role();
        while !self.stop.is_cancelled() {
            let source = Arc::new(self.collaborator.new_source());
            self.holder.append(Arc::clone(&source));
            info!(%role, "Collaborator started");

            let mut task = {
                let collaborator = Arc::clone(&self.collaborator);
                let source = Arc::clone(&source);
                let stop = self.stop.clone();
                tokio::spawn(async move { collaborator.run(source, stop).await })
            };

            let finished = tokio::select! {
                outcome = &mut task => Some(outcome),
                _ = self.stop.cancelled() => None,
            };
            let Some(outcome) = finished else {
                self.drain(&source, task).await;
                break;
            };
            self.holder.remove_instance(&source);

            match outcome {
                Ok(Ok(())) if source.is_shutdown() || self.stop.is_cancelled() => break,
                Ok(Ok(())) => warn!(%role, "Collaborator returned unexpectedly"),
                Ok(Err(err)) => warn!(%role, error = %err, "Collaborator failed"),
                Err(err) => error!(%role, error = %err, "Collaborator task panicked"),
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_restart(role.as_str());
            }
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
            info!(%role, "Restarting collaborator");
        }
        debug!(%role, "Supervision loop finished");
    }

    async fn drain(&self, source: &Arc<InhibitSource>, mut task: JoinHandle<anyhow::Result<()>>) {
        source.request_shutdown();
        if tokio::time::timeout(self.grace, &mut task).await.is_err() {
            warn!(role = %source.role(), "Collaborator ignored shutdown, aborting");
            task.abort();
        }
        self.holder.remove_instance(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::inhibit::SourceRole;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails its first `failures` runs, then waits for shutdown.
    struct Flaky {
        runs: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl Collaborator for Flaky {
        fn role(&self) -> SourceRole {
            SourceRole::Media
        }

        async fn run(
            &self,
            source: Arc<InhibitSource>,
            stop: CancellationToken,
        ) -> anyhow::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures {
                source.set_should_inhibit(true);
                return Err(anyhow!("probe exploded"));
            }
            stop.cancelled().await;
            Ok(())
        }
    }

    /// Never looks at the stop token.
    struct Stubborn;

    #[async_trait]
    impl Collaborator for Stubborn {
        fn role(&self) -> SourceRole {
            SourceRole::Network
        }

        async fn run(
            &self,
            _source: Arc<InhibitSource>,
            _stop: CancellationToken,
        ) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn failed_collaborator_is_replaced_with_fresh_source() {
        let holder = Arc::new(InhibitHolder::new());
        let mut supervisor = Supervisor::new(Arc::clone(&holder), CancellationToken::new())
            .with_timing(Duration::from_millis(10), Duration::from_millis(100));
        let flaky = Arc::new(Flaky {
            runs: AtomicUsize::new(0),
            failures: 2,
        });
        supervisor.spawn(flaky.clone());

        wait_until(|| flaky.runs.load(Ordering::SeqCst) >= 3 && holder.len() == 1).await;
        let source = holder.get_by_role(SourceRole::Media).unwrap();
        assert!(!source.should_inhibit(), "replacement starts without a vote");

        supervisor.shutdown().await;
        assert!(holder.is_empty());
        assert_eq!(flaky.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stragglers_are_aborted_after_grace() {
        let holder = Arc::new(InhibitHolder::new());
        let mut supervisor = Supervisor::new(Arc::clone(&holder), CancellationToken::new())
            .with_timing(Duration::from_millis(10), Duration::from_millis(20));
        supervisor.spawn(Arc::new(Stubborn));
        wait_until(|| holder.len() == 1).await;

        tokio::time::timeout(Duration::from_secs(2), supervisor.shutdown())
            .await
            .expect("shutdown must not hang");
        assert!(holder.is_empty());
    }
}
