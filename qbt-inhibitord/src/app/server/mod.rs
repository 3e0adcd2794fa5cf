mod broadcaster;
mod registry;
mod session;

pub use broadcaster::{broadcast_frame, spawn_broadcaster, BroadcastReport};
pub use registry::{Connection, ConnectionRegistry};

use super::collaborators::Collaborator;
use super::release::VersionAnnouncer;
use crate::config::{DEFAULT_API_ALT_PORT, DEFAULT_API_PORT};
use crate::domain::inhibit::{
    InhibitHolder, InhibitSource, SourceRole, StateSnapshot, StateUpdate,
};
use crate::domain::protocol::{
    encode_message, ClientMessage, ConnectionId, ProtocolError, ServerMessage, SysCommand,
    VersionNotice, MAX_FRAME_LEN,
};
use crate::ports::ServiceHooks;
use crate::telemetry::InhibitorMetrics;
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const POWER_CONTROL_DISABLED: &str = "host power control is disabled";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub alt_port: u16,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    /// Closes clients that send nothing for this long. Off by default since
    /// well-behaved clients may stay silent indefinitely.
    pub idle_timeout: Option<Duration>,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_API_PORT,
            alt_port: DEFAULT_API_ALT_PORT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            idle_timeout: None,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("no {0} source registered")]
    SourceUnavailable(SourceRole),
    #[error("failed to send to {id}: {source}")]
    Send {
        id: ConnectionId,
        #[source]
        source: ProtocolError,
    },
    #[error("cannot bind {address} on port {port} or {alt_port}: {source}")]
    Bind {
        address: IpAddr,
        port: u16,
        alt_port: u16,
        #[source]
        source: io::Error,
    },
}

/// TCP server that pushes inhibit state to remote clients and accepts their
/// commands.
pub struct StateBroadcastServer {
    config: ServerConfig,
    holder: Arc<InhibitHolder>,
    hooks: Arc<dyn ServiceHooks>,
    registry: ConnectionRegistry,
    metrics: Option<Arc<InhibitorMetrics>>,
}

impl StateBroadcastServer {
    pub fn new(
        config: ServerConfig,
        holder: Arc<InhibitHolder>,
        hooks: Arc<dyn ServiceHooks>,
    ) -> Self {
        Self {
            config,
            holder,
            hooks,
            registry: ConnectionRegistry::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<InhibitorMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn holder(&self) -> &Arc<InhibitHolder> {
        &self.holder
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub(crate) fn metrics(&self) -> Option<&InhibitorMetrics> {
        self.metrics.as_deref()
    }

    /// Binds the primary port, falling back to the alternate one when the
    /// primary is taken.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let primary = SocketAddr::new(self.config.address, self.config.port);
        match TcpListener::bind(primary).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                warn!(
                    port = self.config.port,
                    alt_port = self.config.alt_port,
                    "Primary API port in use, trying alternate"
                );
            }
            Err(source) => return Err(self.bind_error(source)),
        }
        let alternate = SocketAddr::new(self.config.address, self.config.alt_port);
        TcpListener::bind(alternate)
            .await
            .map_err(|source| self.bind_error(source))
    }

    fn bind_error(&self, source: io::Error) -> ServerError {
        ServerError::Bind {
            address: self.config.address,
            port: self.config.port,
            alt_port: self.config.alt_port,
            source,
        }
    }

    /// Accepts clients until `stop` fires, then closes every connection.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener, stop: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, error = %err, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(session::handle_stream(
                        Arc::clone(self),
                        stream,
                        peer.to_string(),
                        stop.clone(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        let closed = self.shutdown().await;
        debug!(closed, "API server stopped");
    }

    /// Handles one decoded frame from an active connection.
    pub async fn dispatch(
        &self,
        id: &ConnectionId,
        message: ClientMessage,
    ) -> Result<(), ServerError> {
        let connection = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| ServerError::UnknownConnection(id.clone()))?;

        match message {
            ClientMessage::Command {
                inhibit,
                is_override,
            } => {
                let api = self.api_source()?;
                info!(token = %id, inhibit, is_override, "Remote command");
                api.apply_command(inhibit, is_override);
                api.change_event().set();
            }
            ClientMessage::Refresh => {
                let snapshot = self.api_source()?.snapshot();
                connection
                    .send(&ServerMessage::StateUpdate(snapshot))
                    .await
                    .map_err(|source| ServerError::Send {
                        id: id.clone(),
                        source,
                    })?;
            }
            ClientMessage::SysCommand { command } if !command.is_permitted() => {
                warn!(token = %id, %command, "Refusing system command");
                if let Some(metrics) = self.metrics() {
                    metrics.record_frame_rejected(command.as_str());
                }
                connection
                    .send(&ServerMessage::Rejected {
                        command: command.to_string(),
                        reason: POWER_CONTROL_DISABLED.to_string(),
                    })
                    .await
                    .map_err(|source| ServerError::Send {
                        id: id.clone(),
                        source,
                    })?;
            }
            ClientMessage::SysCommand { command } => {
                info!(token = %id, %command, "System command");
                match command {
                    SysCommand::Restart => self.hooks.restart().await,
                    SysCommand::PrefUpdate => self.hooks.update_response(true).await,
                    SysCommand::DenyUpdate => self.hooks.update_response(false).await,
                    SysCommand::Shutdown | SysCommand::Reboot => {}
                }
            }
            ClientMessage::Ack => debug!(token = %id, "Ack"),
            ClientMessage::Handshake { .. } | ClientMessage::Renew { .. } => {
                debug!(token = %id, kind = message.kind(), "Ignoring handshake on active connection");
            }
        }
        Ok(())
    }

    fn api_source(&self) -> Result<Arc<InhibitSource>, ServerError> {
        self.holder
            .get_by_role(SourceRole::Api)
            .ok_or(ServerError::SourceUnavailable(SourceRole::Api))
    }

    pub async fn broadcast_snapshot(
        &self,
        snapshot: &StateSnapshot,
    ) -> Result<BroadcastReport, ProtocolError> {
        let frame = encode_message(&ServerMessage::StateUpdate(snapshot.clone()))?;
        let report = broadcast_frame(&self.registry, &frame).await;
        self.record_broadcast("state_update", &report);
        Ok(report)
    }

    /// Sends a `new_version` notice to every connected client.
    pub async fn announce_version(&self, notice: VersionNotice) {
        let frame = match encode_message(&ServerMessage::NewVersion(notice)) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Cannot encode version notice");
                return;
            }
        };
        let report = broadcast_frame(&self.registry, &frame).await;
        self.record_broadcast("new_version", &report);
    }

    fn record_broadcast(&self, kind: &str, report: &BroadcastReport) {
        if let Some(metrics) = self.metrics() {
            metrics.record_broadcast(kind, report.delivered as u64, report.dropped as u64);
        }
    }

    pub async fn close_connection(&self, id: &ConnectionId) -> Result<(), ServerError> {
        let connection = self
            .registry
            .deregister(id)
            .await
            .ok_or_else(|| ServerError::UnknownConnection(id.clone()))?;
        connection.close();
        Ok(())
    }

    /// Closes every connection and returns how many were open.
    pub async fn shutdown(&self) -> usize {
        self.registry.close_all().await
    }
}

#[async_trait]
impl VersionAnnouncer for Arc<StateBroadcastServer> {
    async fn announce_version(&self, notice: VersionNotice) {
        StateBroadcastServer::announce_version(self, notice).await
    }
}

/// Supervised owner of the API source: binds the listener, serves clients
/// and broadcasts the source's state whenever it changes.
pub struct ApiCollaborator {
    server: Arc<StateBroadcastServer>,
    version: String,
}

impl ApiCollaborator {
    pub fn new(server: Arc<StateBroadcastServer>, version: impl Into<String>) -> Self {
        Self {
            server,
            version: version.into(),
        }
    }
}

#[async_trait]
impl Collaborator for ApiCollaborator {
    fn role(&self) -> SourceRole {
        SourceRole::Api
    }

    fn new_source(&self) -> InhibitSource {
        let source = InhibitSource::new(SourceRole::Api);
        source.apply(&StateUpdate {
            version: Some(self.version.clone()),
            ..StateUpdate::default()
        });
        source.set_connected(true);
        source
    }

    async fn run(&self, source: Arc<InhibitSource>, stop: CancellationToken) -> anyhow::Result<()> {
        let listener = self.server.bind().await?;
        info!(address = %listener.local_addr()?, "API server listening");

        let local = stop.child_token();
        let broadcaster = spawn_broadcaster(Arc::clone(&self.server), source, local.clone());
        self.server.serve(listener, local.clone()).await;
        local.cancel();
        broadcaster.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::protocol::{FrameCodec, FRAME_DELIMITER};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::FramedRead;

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServiceHooks for RecordingHooks {
        async fn restart(&self) {
            self.calls.lock().push("restart".into());
        }

        async fn update_response(&self, accepted: bool) {
            self.calls.lock().push(format!("update:{accepted}"));
        }
    }

    struct Harness {
        server: Arc<StateBroadcastServer>,
        api: Arc<InhibitSource>,
        hooks: Arc<RecordingHooks>,
        stop: CancellationToken,
    }

    fn harness() -> Harness {
        let holder = Arc::new(InhibitHolder::new());
        let hooks = Arc::new(RecordingHooks::default());
        let server = Arc::new(StateBroadcastServer::new(
            ServerConfig::default(),
            Arc::clone(&holder),
            hooks.clone(),
        ));
        let collaborator = ApiCollaborator::new(Arc::clone(&server), "1.2.3");
        let api = Arc::new(collaborator.new_source());
        holder.append(Arc::clone(&api));
        Harness {
            server,
            api,
            hooks,
            stop: CancellationToken::new(),
        }
    }

    type Frames = FramedRead<tokio::io::ReadHalf<DuplexStream>, FrameCodec>;

    /// Opens an in-memory client and completes the handshake.
    async fn connect(h: &Harness) -> (ConnectionId, Frames, tokio::io::WriteHalf<DuplexStream>) {
        let (client, server_side) = tokio::io::duplex(16 * 1024);
        tokio::spawn(session::handle_stream(
            Arc::clone(&h.server),
            server_side,
            "duplex".to_string(),
            h.stop.clone(),
        ));
        let (read, mut write) = tokio::io::split(client);
        write.write_all(b"{\"type\":\"handshake\"}\n\r").await.unwrap();
        let mut frames = FramedRead::new(read, FrameCodec::new());
        let first: serde_json::Value =
            serde_json::from_slice(&frames.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["type"], "new_conn");
        let token = ConnectionId::from(first["token"].as_str().unwrap());
        (token, frames, write)
    }

    async fn wait_for_connections(h: &Harness, count: usize) {
        for _ in 0..100 {
            if h.server.registry().len().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} connections");
    }

    /// Reads frames until the stream stays quiet for `QUIET`.
    async fn drain(frames: &mut Frames) {
        while let Ok(Some(_)) = tokio::time::timeout(QUIET, frames.next()).await {}
    }

    async fn assert_quiet(frames: &mut Frames) {
        let extra = tokio::time::timeout(QUIET, frames.next()).await;
        assert!(extra.is_err(), "unexpected frame: {extra:?}");
    }

    const QUIET: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn command_updates_api_vote() {
        let h = harness();
        let (token, _frames, _write) = connect(&h).await;
        wait_for_connections(&h, 1).await;
        h.api.change_event().clear();

        h.server
            .dispatch(
                &token,
                ClientMessage::Command {
                    inhibit: true,
                    is_override: true,
                },
            )
            .await
            .unwrap();
        assert!(h.api.should_inhibit());
        assert!(h.api.is_override());
        assert!(h.api.change_event().is_set(), "command must wake observers");
    }

    #[tokio::test]
    async fn stale_token_is_rejected() {
        let h = harness();
        let (token, _frames, _write) = connect(&h).await;
        wait_for_connections(&h, 1).await;
        h.server.close_connection(&token).await.unwrap();

        let err = h.server.dispatch(&token, ClientMessage::Refresh).await.unwrap_err();
        assert!(matches!(err, ServerError::UnknownConnection(_)));
        assert!(matches!(
            h.server.close_connection(&token).await,
            Err(ServerError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn power_commands_are_rejected_in_band() {
        let h = harness();
        let (token, mut frames, _write) = connect(&h).await;
        wait_for_connections(&h, 1).await;

        h.server
            .dispatch(
                &token,
                ClientMessage::SysCommand {
                    command: SysCommand::Reboot,
                },
            )
            .await
            .unwrap();
        let reply: serde_json::Value =
            serde_json::from_slice(&frames.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["type"], "rejected");
        assert_eq!(reply["command"], "reboot");
        assert!(h.server.registry().get(&token).await.is_some());
        assert!(h.hooks.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_commands_reach_hooks() {
        let h = harness();
        let (token, _frames, _write) = connect(&h).await;
        wait_for_connections(&h, 1).await;
        for command in [SysCommand::PrefUpdate, SysCommand::DenyUpdate, SysCommand::Restart] {
            h.server
                .dispatch(&token, ClientMessage::SysCommand { command })
                .await
                .unwrap();
        }
        assert_eq!(
            *h.hooks.calls.lock(),
            vec!["update:true", "update:false", "restart"]
        );
    }

    #[tokio::test]
    async fn fan_out_survives_a_dead_client() {
        let h = harness();
        let (_a, mut alive, _wa) = connect(&h).await;
        let (_b, dead, dead_write) = connect(&h).await;
        wait_for_connections(&h, 2).await;
        drop(dead);
        drop(dead_write);

        // The session task notices EOF and deregisters; a broadcast racing
        // it must still reach the live client.
        let report = h.server.broadcast_snapshot(&h.api.snapshot()).await.unwrap();
        assert!(report.delivered >= 1);
        let frame = alive.next().await.unwrap().unwrap();
        let update: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(update["type"], "state_update");
        assert_eq!(update["version"], "1.2.3");
        wait_for_connections(&h, 1).await;
    }

    #[tokio::test]
    async fn broadcast_reaches_each_live_client_exactly_once() {
        let h = harness();
        let mut live = Vec::new();
        for _ in 0..3 {
            let (_token, frames, write) = connect(&h).await;
            live.push((frames, write));
        }
        let (gone, broken) = tokio::io::duplex(64);
        drop(gone);
        h.server
            .registry()
            .register(Arc::new(Connection::new(
                ConnectionId::from("broken"),
                "broken",
                broken,
                WRITE_TIMEOUT,
            )))
            .await;
        wait_for_connections(&h, 4).await;

        let report = h.server.broadcast_snapshot(&h.api.snapshot()).await.unwrap();
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 3,
                dropped: 1
            }
        );
        for (frames, _write) in &mut live {
            let frame = frames.next().await.unwrap().unwrap();
            let update: serde_json::Value = serde_json::from_slice(&frame).unwrap();
            assert_eq!(update["type"], "state_update");
            assert_quiet(frames).await;
        }
        assert_eq!(h.server.registry().len().await, 3);
    }

    #[tokio::test]
    async fn refresh_replies_only_to_requester() {
        let h = harness();
        let broadcaster = spawn_broadcaster(Arc::clone(&h.server), Arc::clone(&h.api), h.stop.clone());
        let (a, mut frames_a, _wa) = connect(&h).await;
        let (_b, mut frames_b, _wb) = connect(&h).await;
        wait_for_connections(&h, 2).await;
        drain(&mut frames_a).await;
        drain(&mut frames_b).await;

        h.server.dispatch(&a, ClientMessage::Refresh).await.unwrap();
        let reply: serde_json::Value =
            serde_json::from_slice(&frames_a.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["type"], "state_update");
        assert_eq!(reply["version"], "1.2.3");
        assert_quiet(&mut frames_b).await;
        assert_quiet(&mut frames_a).await;

        h.stop.cancel();
        broadcaster.await.unwrap();
    }

    #[tokio::test]
    async fn refresh_produces_identical_frames() {
        let h = harness();
        let broadcaster = spawn_broadcaster(Arc::clone(&h.server), Arc::clone(&h.api), h.stop.clone());
        let (token, mut frames, _write) = connect(&h).await;
        wait_for_connections(&h, 1).await;

        // Handshake already triggered one update; drain it.
        let _ = frames.next().await.unwrap().unwrap();

        h.server.dispatch(&token, ClientMessage::Refresh).await.unwrap();
        let first = frames.next().await.unwrap().unwrap();
        h.server.dispatch(&token, ClientMessage::Refresh).await.unwrap();
        let second = frames.next().await.unwrap().unwrap();
        assert_eq!(first, second);
        assert!(!first.ends_with(FRAME_DELIMITER));

        h.stop.cancel();
        broadcaster.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let h = harness();
        let (_a, _fa, _wa) = connect(&h).await;
        let (_b, _fb, _wb) = connect(&h).await;
        wait_for_connections(&h, 2).await;
        assert_eq!(h.server.shutdown().await, 2);
        assert!(h.server.registry().is_empty().await);
    }
}
