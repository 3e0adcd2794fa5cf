use crate::domain::protocol::VersionNotice;
use crate::ports::ReleaseFeed;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const RELEASE_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Receives newly discovered releases.
#[async_trait]
pub trait VersionAnnouncer: Send + Sync {
    async fn announce_version(&self, notice: VersionNotice);
}

/// Polls a release feed and announces each newer version once.
pub struct ReleaseWatcher<F> {
    feed: F,
    installed: String,
    announced: Option<String>,
    period: Duration,
}

impl<F: ReleaseFeed> ReleaseWatcher<F> {
    pub fn new(feed: F, installed: impl Into<String>) -> Self {
        Self {
            feed,
            installed: installed.into(),
            announced: None,
            period: RELEASE_POLL_INTERVAL,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Returns a notice when the feed has a release newer than both the
    /// installed version and the last one announced.
    pub async fn check(&mut self) -> anyhow::Result<Option<VersionNotice>> {
        let Some(latest) = self.feed.latest_version().await? else {
            return Ok(None);
        };
        if !is_newer(&latest, &self.installed) || self.announced.as_deref() == Some(latest.as_str())
        {
            return Ok(None);
        }
        self.announced = Some(latest.clone());
        Ok(Some(VersionNotice {
            new_version: latest,
            old_version: self.installed.clone(),
        }))
    }

    pub async fn run<A: VersionAnnouncer>(mut self, announcer: A, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => match self.check().await {
                    Ok(Some(notice)) => {
                        info!(new_version = %notice.new_version, "New release available");
                        announcer.announce_version(notice).await;
                    }
                    Ok(None) => debug!("No newer release"),
                    Err(err) => debug!(error = %err, "Release check failed"),
                },
            }
        }
    }
}

/// Compares dotted numeric versions; a non-numeric component compares as
/// text so `1.2.0-rc1` still sorts after `1.1`.
pub fn is_newer(candidate: &str, installed: &str) -> bool {
    compare_versions(candidate, installed) == Ordering::Greater
}

fn compare_versions(left: &str, right: &str) -> Ordering {
    let mut left_parts = left.trim().split('.');
    let mut right_parts = right.trim().split('.');
    loop {
        match (left_parts.next(), right_parts.next()) {
            (None, None) => return Ordering::Equal,
            (Some(l), None) => {
                return if is_zero(l) {
                    compare_tail(left_parts)
                } else {
                    Ordering::Greater
                };
            }
            (None, Some(r)) => {
                return if is_zero(r) {
                    compare_tail(right_parts).reverse()
                } else {
                    Ordering::Less
                };
            }
            (Some(l), Some(r)) => {
                let order = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

fn is_zero(part: &str) -> bool {
    part.parse::<u64>() == Ok(0)
}

fn compare_tail<'a>(mut rest: impl Iterator<Item = &'a str>) -> Ordering {
    if rest.all(is_zero) {
        Ordering::Equal
    } else {
        Ordering::Greater
    }
}
