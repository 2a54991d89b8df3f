pub mod http;
pub mod memory;
pub mod retry;

use crate::error::Result;

/// The narrow interface the engine needs from a permanent blob store.
///
/// The store is assumed append-only and immutable: a returned URL always
/// resolves to the exact bytes that were put, and nothing is ever deleted.
/// Both operations may fail transiently; adapters classify failures as
/// [`DustError::RemoteTransient`](crate::error::DustError::RemoteTransient)
/// or [`DustError::Remote`](crate::error::DustError::Remote) and leave retry
/// policy to the caller.
pub trait RemoteStore: Send + Sync {
    /// Upload an opaque blob with descriptive tags; returns its immutable URL.
    fn put(&self, blob: &[u8], tags: &[(&str, &str)]) -> Result<String>;

    /// Fetch a previously stored blob.
    fn get(&self, url: &str) -> Result<Vec<u8>>;
}
