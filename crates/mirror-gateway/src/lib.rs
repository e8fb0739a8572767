//! Collaborator gateways for model mirroring
//!
//! This crate defines the contracts the mirroring pipeline consumes and
//! ships adapters for them:
//! - Blob store streaming ([`BlobStore`]) with an in-memory backend
//! - Distribution-protocol registry ([`RegistryGateway`]) over HTTP or in memory
//! - Registry token minting ([`TokenIssuer`]) with scoped JWTs
//! - Authorization ([`Authorizer`]) backed by an RBAC policy
//! - Digest signing ([`Signer`]) with Ed25519
//! - Model persistence ([`ModelStore`]) with an in-memory backend
//!
//! # Example
//!
//! ```rust,no_run
//! use mirror_gateway::{MemoryRegistry, RegistryAction, RegistryGateway, RegistryToken};
//! use mirror_core::Digest;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = MemoryRegistry::new();
//! let token = RegistryToken::new("t".to_string(), "model-1/app", RegistryAction::PULL);
//! let present = registry
//!     .blob_exists(&token, "model-1/app", &Digest::sha256(b"layer"))
//!     .await?;
//! assert!(!present);
//! # Ok(())
//! # }
//! ```

// Re-export core domain types for convenience
pub use mirror_core;

// Public modules
pub mod auth;
pub mod blob_store;
pub mod error;
pub mod http_registry;
pub mod memory;
pub mod model_store;
pub mod rbac;
pub mod registry;
pub mod registry_token;
pub mod signing;

// Re-exports for convenience
pub use auth::{AuthDecision, Authorizer};
pub use blob_store::{BlobStore, ByteReader, ObjectInfo};
pub use error::{GatewayError, GatewayResult};
pub use http_registry::{HttpRegistryClient, HttpRegistryConfig};
pub use memory::{
    BlobStoreCall, MemoryBlobStore, MemoryModelStore, MemoryRegistry, MemoryTokenIssuer,
    ModelStoreCall, RegistryCall,
};
pub use model_store::{MirrorSettings, ModelRecord, ModelStore};
pub use rbac::{Permission, RbacAuthorizer, RbacError, RbacPolicy, Role};
pub use registry::{
    RegistryAction, RegistryBlob, RegistryGateway, RegistryToken, TokenIssuer, UploadSession,
};
pub use registry_token::{JwtTokenIssuer, RegistryClaims, RegistryTokenConfig};
pub use signing::{Ed25519Signer, Signature, Signer};

/// Gateway layer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
