//! The upstream side of a stash operation.
//!
//! How a module version is actually retrieved (VCS, another proxy, a registry
//! API) is not this crate's concern; the stash pipeline consumes it through
//! the single [`Fetcher::fetch`] operation.

use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncRead;

/// The archive stream of a [`VersionBundle`].
///
/// Streamed rather than buffered since archives can be large. It is consumed
/// by the saver and closed on drop, on every exit path.
pub type ArchiveStream = Box<dyn AsyncRead + Send + Unpin>;

/// The artifacts produced by fetching one module version from upstream.
pub struct VersionBundle {
    /// The machine-readable info record.
    pub info: Vec<u8>,
    /// The module definition file.
    pub mod_file: Vec<u8>,
    /// The archive content.
    pub zip: ArchiveStream,
    /// The concrete version the upstream resolved the request to.
    ///
    /// This can differ from the requested version when the request was
    /// symbolic, e.g. a branch name resolving to a pseudo-version.
    pub version: String,
}

impl fmt::Debug for VersionBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionBundle")
            .field("info", &self.info.len())
            .field("mod_file", &self.mod_file.len())
            .field("zip", &"<stream>")
            .field("version", &self.version)
            .finish()
    }
}

/// Retrieves module versions from an upstream source.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches the bundle for a module version.
    ///
    /// The requested version may be symbolic; the returned bundle carries the
    /// resolved one.
    async fn fetch(&self, module: &str, version: &str) -> anyhow::Result<VersionBundle>;
}
