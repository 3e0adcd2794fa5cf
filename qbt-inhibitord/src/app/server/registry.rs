use crate::domain::protocol::{encode_message, ConnectionId, ProtocolError, ServerMessage};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of an active client plus its lifecycle flag.
///
/// Every write holds the writer lock across write and flush so frames from
/// the broadcaster and the session task never interleave.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    writer: Mutex<BoxedWriter>,
    write_timeout: Duration,
    closed: CancellationToken,
}

impl Connection {
    pub fn new<W>(id: ConnectionId, peer: impl Into<String>, writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer: peer.into(),
            writer: Mutex::new(Box::new(writer)),
            write_timeout,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Marks the connection closed. The owning session task tears down the
    /// socket when it observes this.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub async fn send(&self, message: &ServerMessage) -> Result<(), ProtocolError> {
        let frame = encode_message(message)?;
        self.send_frame(&frame).await
    }

    /// Writes one already-delimited frame. Any failure closes the connection.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        let result = match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ProtocolError::Io(err)),
            Err(_) => Err(ProtocolError::Timeout),
        };
        if result.is_err() {
            self.close();
        }
        result
    }

    pub(crate) async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(self.write_timeout, writer.shutdown()).await;
    }
}

/// All connections that completed the handshake, keyed by their token.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: Arc<Connection>) {
        self.connections
            .write()
            .await
            .insert(connection.id().clone(), connection);
    }

    pub async fn deregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(id)
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Point-in-time copy; callers write to connections after the lock is
    /// released.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Removes and closes every connection.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (_, connection) in &drained {
            connection.close();
        }
        drained.len()
    }
}
