use super::registry::Connection;
use super::{ServerError, StateBroadcastServer};
use crate::domain::protocol::{
    decode_client, ClientMessage, ConnectionId, FrameCodec, ProtocolError, ServerMessage,
    FORBIDDEN_RESPONSE,
};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Frames<S> = FramedRead<ReadHalf<S>, FrameCodec>;

/// Drives one client from handshake to teardown.
pub(crate) async fn handle_stream<S>(
    server: Arc<StateBroadcastServer>,
    stream: S,
    peer: String,
    stop: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = server.config().clone();
    let (reader, mut writer) = tokio::io::split(stream);
    let mut frames = FramedRead::new(reader, FrameCodec::with_max_length(config.max_frame_len));

    let opening = match tokio::time::timeout(config.handshake_timeout, frames.next()).await {
        Err(_) => Err(ProtocolError::Timeout),
        Ok(None) => {
            debug!(%peer, "Peer left before handshake");
            return;
        }
        Ok(Some(frame)) => frame.and_then(|frame| expect_handshake(&frame)),
    };
    if let Err(err) = opening {
        warn!(%peer, reason = err.reason(), error = %err, "Rejecting connection");
        if let Some(metrics) = server.metrics() {
            metrics.record_frame_rejected(err.reason());
        }
        let reply = async {
            writer.write_all(FORBIDDEN_RESPONSE).await?;
            writer.shutdown().await
        };
        if let Ok(Err(err)) = tokio::time::timeout(config.write_timeout, reply).await {
            debug!(%peer, error = %err, "Failed to send rejection");
        }
        return;
    }

    let id = ConnectionId::mint();
    let connection = Arc::new(Connection::new(
        id.clone(),
        peer.clone(),
        writer,
        config.write_timeout,
    ));
    // The token goes out before registration so it is always the first frame.
    if let Err(err) = connection
        .send(&ServerMessage::NewConn { token: id.clone() })
        .await
    {
        warn!(%peer, error = %err, "Failed to acknowledge handshake");
        return;
    }
    server.registry().register(Arc::clone(&connection)).await;
    if let Some(metrics) = server.metrics() {
        metrics.record_connection_opened();
    }
    info!(%peer, token = %id, "Client connected");
    server.holder().refresh_state();

    let reason = listen(&server, &connection, &mut frames, config.idle_timeout, &stop).await;

    server.registry().deregister(&id).await;
    connection.close();
    connection.shutdown_writer().await;
    if let Some(metrics) = server.metrics() {
        metrics.record_connection_closed(reason);
    }
    info!(%peer, token = %id, reason, "Client disconnected");
}

fn expect_handshake(frame: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let message = decode_client(frame)?;
    if message.opens_session() {
        Ok(message)
    } else {
        Err(ProtocolError::ExpectedHandshake(message.kind()))
    }
}

async fn next_frame<S: AsyncRead>(
    frames: &mut Frames<S>,
    idle: Option<Duration>,
) -> Result<Option<Result<Bytes, ProtocolError>>, tokio::time::error::Elapsed> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, frames.next()).await,
        None => Ok(frames.next().await),
    }
}

/// Reads and dispatches frames until the connection ends. Returns why.
async fn listen<S: AsyncRead>(
    server: &StateBroadcastServer,
    connection: &Connection,
    frames: &mut Frames<S>,
    idle: Option<Duration>,
    stop: &CancellationToken,
) -> &'static str {
    loop {
        let next = tokio::select! {
            _ = connection.closed() => return "closed",
            _ = stop.cancelled() => return "shutdown",
            next = next_frame(frames, idle) => next,
        };
        let frame = match next {
            Err(_) => return "idle_timeout",
            Ok(None) => return "eof",
            // Read errors are indistinguishable from a vanished peer.
            Ok(Some(Err(ProtocolError::Io(_)))) => return "eof",
            Ok(Some(Err(err))) => return reject(server, connection, err),
            Ok(Some(Ok(frame))) => frame,
        };
        let message = match decode_client(&frame) {
            Ok(message) => message,
            Err(err) => return reject(server, connection, err),
        };
        debug!(token = %connection.id(), kind = message.kind(), "Frame received");
        match server.dispatch(connection.id(), message).await {
            Ok(()) => {}
            Err(ServerError::UnknownConnection(_)) => return "deregistered",
            Err(err) => warn!(token = %connection.id(), error = %err, "Command failed"),
        }
    }
}

fn reject(
    server: &StateBroadcastServer,
    connection: &Connection,
    err: ProtocolError,
) -> &'static str {
    warn!(
        token = %connection.id(),
        reason = err.reason(),
        error = %err,
        "Closing connection on bad frame"
    );
    if let Some(metrics) = server.metrics() {
        metrics.record_frame_rejected(err.reason());
    }
    err.reason()
}
