//! Integrity service
//!
//! Computes content digests of streamed archives without buffering them.

use async_trait::async_trait;
use mirror_core::{Digest, DigestHasher, HashAlgorithm, StorageLocation};
use mirror_gateway::{BlobStore, ByteReader};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use crate::error::ServiceResult;

const READ_BUFFER: usize = 64 * 1024;

/// Trait for digest computation over streams and stored objects
#[async_trait]
pub trait IntegrityService: Send + Sync {
    /// Digest a stream, returning the digest and the number of bytes read
    async fn digest_stream(&self, body: ByteReader) -> ServiceResult<(Digest, u64)>;

    /// Read a stored object back and digest it
    async fn digest_object(&self, location: &StorageLocation) -> ServiceResult<(Digest, u64)>;
}

/// Default implementation of IntegrityService
pub struct DefaultIntegrityService {
    blob_store: Arc<dyn BlobStore>,
    algorithm: HashAlgorithm,
}

impl DefaultIntegrityService {
    /// Create a SHA-256 integrity service
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            blob_store,
            algorithm: HashAlgorithm::SHA256,
        }
    }

    /// Use another digest algorithm
    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
}

#[async_trait]
impl IntegrityService for DefaultIntegrityService {
    async fn digest_stream(&self, mut body: ByteReader) -> ServiceResult<(Digest, u64)> {
        let mut hasher = DigestHasher::new(self.algorithm);
        let mut buf = vec![0u8; READ_BUFFER];
        let mut total: u64 = 0;

        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }

        Ok((hasher.finalize(), total))
    }

    #[instrument(skip(self), fields(location = %location))]
    async fn digest_object(&self, location: &StorageLocation) -> ServiceResult<(Digest, u64)> {
        let body = self.blob_store.get_stream(location).await?;
        let (digest, size) = self.digest_stream(body).await?;
        debug!(%digest, size, "Digested stored object");
        Ok((digest, size))
    }
}
