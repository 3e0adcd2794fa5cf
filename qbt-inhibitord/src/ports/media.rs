use async_trait::async_trait;

#[async_trait]
pub trait SessionProbe: Send + Sync {
    /// Number of sessions currently playing or buffering.
    async fn active_sessions(&self) -> anyhow::Result<usize>;
}
