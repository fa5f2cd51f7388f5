//! Notification of completed stashes, for cache invalidation fan-out.

use async_trait::async_trait;

/// An external observer of successful stash operations.
#[async_trait]
pub trait EventHook: Send + Sync {
    /// Called after a module version has been stored, with the resolved
    /// version.
    async fn stashed(&self, module: &str, version: &str) -> anyhow::Result<()>;
}
