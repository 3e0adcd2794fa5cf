use async_trait::async_trait;

#[async_trait]
pub trait UploadCounter: Send + Sync {
    /// Cumulative bytes transmitted on `interface` since boot.
    async fn bytes_sent(&self, interface: &str) -> anyhow::Result<u64>;
}
