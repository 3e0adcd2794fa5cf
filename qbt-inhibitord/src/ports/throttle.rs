use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("not connected to throttle target")]
    Disconnected,
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// The managed upload-throttling target.
#[async_trait]
pub trait ThrottleTarget: Send + Sync {
    async fn login(&self) -> Result<(), ThrottleError>;

    /// Cheap call proving the session is still usable.
    async fn probe(&self) -> Result<(), ThrottleError>;

    /// Switches the alternative (limited) rate on or off. Implementations
    /// must be idempotent: asking for the current mode is a no-op.
    async fn set_rate_limit(&self, limited: bool) -> Result<(), ThrottleError>;

    async fn logout(&self) -> Result<(), ThrottleError> {
        Ok(())
    }
}
