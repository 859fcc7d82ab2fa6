//! Remote cache tier interface
//!
//! Transport is out of scope for the core; anything that can answer
//! these three questions can serve as the remote tier. Implementations
//! must be safe to call concurrently.

use async_trait::async_trait;

use crate::CacheError;

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Does an artifact exist for `key`? Returns the recorded execution
    /// duration in milliseconds when known.
    async fn exists(&self, key: &str) -> Result<Option<u64>, CacheError>;

    /// Download the artifact bytes for `key`, with the recorded
    /// duration. `None` on miss.
    async fn fetch(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>, CacheError>;

    /// Upload an artifact. Uploads may be retried; implementations must
    /// tolerate repeated puts of the same key.
    async fn put(&self, key: &str, body: Vec<u8>, duration_ms: u64) -> Result<(), CacheError>;
}
