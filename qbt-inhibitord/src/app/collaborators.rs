use crate::adapters::net_counters::to_mbit;
use crate::domain::inhibit::{InhibitSource, SourceRole};
use crate::ports::{SessionProbe, UploadCounter};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DETECTOR_PERIOD: Duration = Duration::from_secs(5);
pub const NET_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// A task that owns one source and keeps its vote current.
///
/// `run` returns when the source is asked to shut down or `stop` fires; any
/// other return (including an error) makes the supervisor replace the source.
#[async_trait]
pub trait Collaborator: Send + Sync + 'static {
    fn role(&self) -> SourceRole;

    fn new_source(&self) -> InhibitSource {
        InhibitSource::new(self.role())
    }

    async fn run(&self, source: Arc<InhibitSource>, stop: CancellationToken) -> Result<()>;
}

/// Sleeps for `period` unless the collaborator is told to stop first.
/// Returns `false` when the caller should exit.
async fn pause(source: &InhibitSource, stop: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(period) => !source.is_shutdown(),
    }
}

/// Inhibits while a media server reports playing or buffering sessions.
pub struct MediaDetector<P> {
    probe: P,
    period: Duration,
}

impl<P: SessionProbe> MediaDetector<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            period: DETECTOR_PERIOD,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    async fn poll(&self, source: &InhibitSource) {
        match self.probe.active_sessions().await {
            Ok(sessions) => {
                if sessions != source.total_sessions() {
                    info!(sessions, "Active media sessions changed");
                }
                source.set_total_sessions(sessions);
                source.set_should_inhibit(sessions > 0);
                source.set_connected(true);
            }
            Err(err) => {
                if source.connected() {
                    warn!(error = %err, "Media server unreachable");
                }
                source.set_connected(false);
                source.set_total_sessions(0);
                source.set_should_inhibit(false);
            }
        }
    }
}

#[async_trait]
impl<P: SessionProbe + 'static> Collaborator for MediaDetector<P> {
    fn role(&self) -> SourceRole {
        SourceRole::Media
    }

    async fn run(&self, source: Arc<InhibitSource>, stop: CancellationToken) -> Result<()> {
        while !source.is_shutdown() {
            self.poll(&source).await;
            if !pause(&source, &stop, self.period).await {
                break;
            }
        }
        debug!("Media detector stopped");
        Ok(())
    }
}

/// Inhibits while the interface's upload rate exceeds a threshold.
pub struct NetDetector<C> {
    counter: C,
    interface: String,
    threshold_mbit: f64,
    period: Duration,
    sample_window: Duration,
}

impl<C: UploadCounter> NetDetector<C> {
    pub fn new(counter: C, interface: impl Into<String>, threshold_mbit: f64) -> Self {
        Self {
            counter,
            interface: interface.into(),
            threshold_mbit,
            period: DETECTOR_PERIOD,
            sample_window: NET_SAMPLE_WINDOW,
        }
    }

    pub fn with_timing(mut self, period: Duration, sample_window: Duration) -> Self {
        self.period = period;
        self.sample_window = sample_window;
        self
    }

    async fn sample_mbit(&self) -> Result<f64> {
        let before = self.counter.bytes_sent(&self.interface).await?;
        tokio::time::sleep(self.sample_window).await;
        let after = self.counter.bytes_sent(&self.interface).await?;
        // Counters reset on interface restart; treat that sample as idle.
        let per_second = after.saturating_sub(before) as f64 / self.sample_window.as_secs_f64();
        Ok(to_mbit(per_second as u64))
    }
}

#[async_trait]
impl<C: UploadCounter + 'static> Collaborator for NetDetector<C> {
    fn role(&self) -> SourceRole {
        SourceRole::Network
    }

    async fn run(&self, source: Arc<InhibitSource>, stop: CancellationToken) -> Result<()> {
        while !source.is_shutdown() {
            match self.sample_mbit().await {
                Ok(mbit) => {
                    let busy = mbit > self.threshold_mbit;
                    if busy != source.should_inhibit() {
                        info!(
                            interface = %self.interface,
                            mbit = format_args!("{mbit:.2}"),
                            busy,
                            "Upload saturation changed"
                        );
                    }
                    source.set_should_inhibit(busy);
                    source.set_connected(true);
                }
                Err(err) => {
                    if source.connected() {
                        warn!(interface = %self.interface, error = %err, "Cannot read upload counters");
                    }
                    source.set_connected(false);
                    source.set_should_inhibit(false);
                }
            }
            if !pause(&source, &stop, self.period).await {
                break;
            }
        }
        debug!("Network detector stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedProbe(Mutex<VecDeque<Result<usize>>>);

    #[async_trait]
    impl SessionProbe for ScriptedProbe {
        async fn active_sessions(&self) -> Result<usize> {
            self.0
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }
    }

    struct ScriptedCounter(Mutex<VecDeque<u64>>);

    #[async_trait]
    impl UploadCounter for ScriptedCounter {
        async fn bytes_sent(&self, _interface: &str) -> Result<u64> {
            self.0
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow!("interface gone"))
        }
    }

    #[tokio::test]
    async fn media_votes_while_sessions_play() {
        let detector = MediaDetector::new(ScriptedProbe(Mutex::new(
            [Ok(2), Ok(0), Err(anyhow!("refused"))].into(),
        )));
        let source = Arc::new(detector.new_source());
        assert_eq!(source.role(), SourceRole::Media);

        detector.poll(&source).await;
        assert!(source.should_inhibit());
        assert_eq!(source.total_sessions(), 2);
        assert!(source.connected());

        detector.poll(&source).await;
        assert!(!source.should_inhibit());

        detector.poll(&source).await;
        assert!(!source.connected());
        assert!(!source.should_inhibit());
    }

    #[tokio::test(start_paused = true)]
    async fn net_detector_compares_rate_against_threshold() {
        // 262_144 bytes in one second is two megabits.
        let counter = ScriptedCounter(Mutex::new([0, 262_144, 1_000_000, 1_000_000].into()));
        let detector = NetDetector::new(counter, "eth0", 1.0);
        assert!((detector.sample_mbit().await.unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(detector.sample_mbit().await.unwrap(), 0.0);
        assert!(detector.sample_mbit().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn detectors_exit_when_source_shuts_down() {
        let detector = MediaDetector::new(ScriptedProbe(Mutex::new(VecDeque::new())))
            .with_period(Duration::from_millis(10));
        let source = Arc::new(detector.new_source());
        let stop = CancellationToken::new();
        let task = {
            let source = Arc::clone(&source);
            let stop = stop.clone();
            tokio::spawn(async move { detector.run(source, stop).await })
        };
        source.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("detector should stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn detectors_exit_on_stop_token() {
        let counter = ScriptedCounter(Mutex::new(VecDeque::new()));
        let detector = NetDetector::new(counter, "eth0", 1.0)
            .with_timing(Duration::from_secs(3600), Duration::from_millis(1));
        let source = Arc::new(detector.new_source());
        let stop = CancellationToken::new();
        stop.cancel();
        detector.run(source, stop).await.unwrap();
    }
}
