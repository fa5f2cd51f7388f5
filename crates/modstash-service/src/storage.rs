//! The storage side of a stash operation.
//!
//! Durability and layout belong to the backend; the stash pipeline only needs
//! to persist a fetched bundle and to ask whether one is already stored.

use async_trait::async_trait;

use crate::fetch::ArchiveStream;

/// Persists fetched module versions.
#[async_trait]
pub trait Saver: Send + Sync {
    /// Saves all three artifacts of a module version.
    ///
    /// The save must be atomic from the caller's point of view: a partial
    /// write must never be visible as a successful existence check. The
    /// archive stream is consumed here in full.
    async fn save(
        &self,
        module: &str,
        version: &str,
        mod_file: Vec<u8>,
        zip: ArchiveStream,
        info: Vec<u8>,
    ) -> anyhow::Result<()>;
}

/// Answers whether a module version is already stored.
///
/// This is the idempotency guard that lets the coordination layer skip
/// redundant fetch-and-save work. It is a pure query with no side effects.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn exists(&self, module: &str, version: &str) -> anyhow::Result<bool>;
}
