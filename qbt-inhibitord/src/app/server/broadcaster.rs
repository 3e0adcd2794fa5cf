use super::registry::ConnectionRegistry;
use super::StateBroadcastServer;
use crate::domain::inhibit::InhibitSource;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Writes `frame` to every registered connection concurrently. A connection
/// whose write fails is closed and deregistered; the rest still receive it.
pub async fn broadcast_frame(registry: &ConnectionRegistry, frame: &[u8]) -> BroadcastReport {
    let connections = registry.connections().await;
    let results = join_all(connections.iter().map(|conn| conn.send_frame(frame))).await;

    let mut report = BroadcastReport::default();
    for (connection, result) in connections.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                warn!(
                    token = %connection.id(),
                    peer = connection.peer(),
                    error = %err,
                    "Dropping connection after failed write"
                );
                registry.deregister(connection.id()).await;
                report.dropped += 1;
            }
        }
    }
    report
}

/// Pushes the source's snapshot to all clients each time its change event
/// fires. Exits and cancels `stop` once the source is shut down.
pub fn spawn_broadcaster(
    server: Arc<StateBroadcastServer>,
    source: Arc<InhibitSource>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = source.change_event().wait() => {}
            }
            if source.is_shutdown() {
                stop.cancel();
                break;
            }
            // Cleared before the snapshot so a change during the pass re-arms
            // the event for the next round.
            source.change_event().clear();
            let snapshot = source.snapshot();
            match server.broadcast_snapshot(&snapshot).await {
                Ok(report) => debug!(
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "Broadcast state"
                ),
                Err(err) => warn!(error = %err, "Cannot encode state update"),
            }
        }
        debug!("Broadcaster stopped");
    })
}
