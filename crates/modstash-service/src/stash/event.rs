use std::sync::Arc;

use async_trait::async_trait;

use crate::events::EventHook;

use super::{StashError, Stasher, Wrapper};

/// Notifies an external observer after each successful stash.
pub struct EventedStasher {
    inner: Arc<dyn Stasher>,
    hook: Arc<dyn EventHook>,
}

/// Returns a wrapper that reports stashed versions to `hook`.
pub fn with_events_hook(hook: Arc<dyn EventHook>) -> Wrapper {
    Box::new(move |inner| Arc::new(EventedStasher { inner, hook }))
}

#[async_trait]
impl Stasher for EventedStasher {
    async fn stash(&self, module: &str, version: &str) -> Result<String, StashError> {
        let resolved = self.inner.stash(module, version).await?;

        // The artifact is already safely stored at this point; a notification
        // failure still fails the call so the caller knows to retry it.
        self.hook
            .stashed(module, &resolved)
            .await
            .map_err(StashError::notify)?;

        Ok(resolved)
    }
}
