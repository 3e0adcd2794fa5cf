use async_trait::async_trait;

/// Callbacks reached through `sys_command` frames. Implementations must
/// return promptly; long-running work is spawned.
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    async fn restart(&self);

    async fn update_response(&self, accepted: bool);
}
