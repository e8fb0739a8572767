//! Distribution-protocol registry abstraction
//!
//! Calls mirror the OCI distribution API: blob existence checks, upload
//! sessions with a single monolithic PUT, and manifest commits. Every call
//! carries a [`RegistryToken`] scoped to one repository, pull-only or
//! push+pull.

use async_trait::async_trait;
use mirror_core::{Digest, ImageManifest, User};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::blob_store::ByteReader;
use crate::error::GatewayResult;

/// Registry scope action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAction {
    /// Read blobs and manifests
    Pull,
    /// Write blobs and manifests
    Push,
}

impl RegistryAction {
    /// Pull-only scope
    pub const PULL: &'static [RegistryAction] = &[RegistryAction::Pull];

    /// Push+pull scope
    pub const PUSH_PULL: &'static [RegistryAction] = &[RegistryAction::Push, RegistryAction::Pull];

    /// Get the string representation used in token scopes
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryAction::Pull => "pull",
            RegistryAction::Push => "push",
        }
    }
}

impl fmt::Display for RegistryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bearer token for one repository scope
#[derive(Debug, Clone)]
pub struct RegistryToken {
    value: SecretString,
    repository: String,
    actions: Vec<RegistryAction>,
}

impl RegistryToken {
    /// Wrap an issued token together with the scope it was issued for
    pub fn new(value: String, repository: impl Into<String>, actions: &[RegistryAction]) -> Self {
        Self {
            value: SecretString::new(value),
            repository: repository.into(),
            actions: actions.to_vec(),
        }
    }

    /// The raw bearer value
    pub fn bearer(&self) -> &str {
        self.value.expose_secret()
    }

    /// Repository the token is scoped to
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Actions granted by the token
    pub fn actions(&self) -> &[RegistryAction] {
        &self.actions
    }

    /// Check the token grants `action` on `repository`
    pub fn allows(&self, repository: &str, action: RegistryAction) -> bool {
        self.repository == repository && self.actions.contains(&action)
    }

    /// Scope string in Docker token-auth form (`repository:<name>:<actions>`)
    pub fn scope(&self) -> String {
        scope_string(&self.repository, &self.actions)
    }
}

/// Format a Docker token-auth scope
pub fn scope_string(repository: &str, actions: &[RegistryAction]) -> String {
    let actions: Vec<&str> = actions.iter().map(RegistryAction::as_str).collect();
    format!("repository:{}:{}", repository, actions.join(","))
}

/// An open blob upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Repository the upload belongs to
    pub repository: String,
    /// Upload location returned by the registry
    pub location: String,
}

/// A blob read back from the registry
pub struct RegistryBlob {
    /// Size in bytes
    pub size: u64,
    /// Blob content
    pub body: ByteReader,
}

impl fmt::Debug for RegistryBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBlob").field("size", &self.size).finish()
    }
}

/// Distribution-protocol registry operations
#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// Check whether a blob exists in a repository (pull scope)
    async fn blob_exists(
        &self,
        token: &RegistryToken,
        repository: &str,
        digest: &Digest,
    ) -> GatewayResult<bool>;

    /// Open an upload session (push scope)
    async fn initiate_upload(
        &self,
        token: &RegistryToken,
        repository: &str,
    ) -> GatewayResult<UploadSession>;

    /// Upload a whole blob in a single request, closing the session (push scope)
    async fn upload_blob_monolithic(
        &self,
        token: &RegistryToken,
        session: &UploadSession,
        digest: &Digest,
        body: ByteReader,
        size: u64,
    ) -> GatewayResult<()>;

    /// Abort an upload session (push scope)
    async fn cancel_upload(&self, token: &RegistryToken, session: &UploadSession)
        -> GatewayResult<()>;

    /// Commit a manifest under a tag (push scope)
    ///
    /// # Returns
    /// * `Ok(Digest)` - Digest the registry stored the manifest under
    async fn put_manifest(
        &self,
        token: &RegistryToken,
        repository: &str,
        reference: &str,
        manifest: &ImageManifest,
    ) -> GatewayResult<Digest>;

    /// Fetch a manifest by tag or digest (pull scope)
    async fn get_manifest(
        &self,
        token: &RegistryToken,
        repository: &str,
        reference: &str,
    ) -> GatewayResult<ImageManifest>;

    /// Fetch a blob (pull scope)
    async fn get_blob(
        &self,
        token: &RegistryToken,
        repository: &str,
        digest: &Digest,
    ) -> GatewayResult<RegistryBlob>;
}

/// Mints registry tokens for a user and repository scope
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Issue a token granting `actions` on `repository`
    async fn issue(
        &self,
        user: &User,
        repository: &str,
        actions: &[RegistryAction],
    ) -> GatewayResult<RegistryToken>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_scope() {
        let token = RegistryToken::new("t".to_string(), "m1/app", RegistryAction::PUSH_PULL);
        assert_eq!(token.scope(), "repository:m1/app:push,pull");
        assert!(token.allows("m1/app", RegistryAction::Push));
        assert!(!token.allows("m2/app", RegistryAction::Pull));
    }

    #[test]
    fn test_token_debug_redacts_value() {
        let token = RegistryToken::new("super-secret".to_string(), "m1/app", RegistryAction::PULL);
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret"));
        assert_eq!(token.bearer(), "super-secret");
    }
}
