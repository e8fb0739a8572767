//! Blob store abstraction
//!
//! Archives and model file binaries are streamed to and from an object store.
//! Implementations must be thread-safe (Send + Sync) for use in async
//! contexts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::{ObjectMetadata, StorageLocation};
use tokio::io::AsyncRead;

use crate::error::GatewayResult;

/// A single-pass reader stream for object contents
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Stored object information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Size in bytes
    pub size: u64,
    /// Creation timestamp
    pub created: DateTime<Utc>,
    /// User metadata written with the object
    pub metadata: ObjectMetadata,
}

/// Object storage operations used by the mirroring pipeline
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `body` into `location`, replacing any existing object
    ///
    /// # Returns
    /// * `Ok(u64)` - Number of bytes written
    /// * `Err(GatewayError)` - If the body stream fails or the store rejects it
    async fn put_stream(
        &self,
        location: &StorageLocation,
        body: ByteReader,
        metadata: ObjectMetadata,
    ) -> GatewayResult<u64>;

    /// Open a read stream over an object
    ///
    /// # Returns
    /// * `Err(GatewayError::NotFound)` - If the object does not exist
    async fn get_stream(&self, location: &StorageLocation) -> GatewayResult<ByteReader>;

    /// Check whether an object exists
    async fn exists(&self, location: &StorageLocation) -> GatewayResult<bool>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete(&self, location: &StorageLocation) -> GatewayResult<()>;

    /// Read the size and user metadata of an object
    async fn metadata(&self, location: &StorageLocation) -> GatewayResult<ObjectInfo>;
}
