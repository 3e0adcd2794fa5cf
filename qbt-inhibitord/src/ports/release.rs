use async_trait::async_trait;

#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Latest published version, without any `v` prefix.
    async fn latest_version(&self) -> anyhow::Result<Option<String>>;
}
