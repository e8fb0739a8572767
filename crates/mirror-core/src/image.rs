//! Container images attached to model releases
//!
//! An image export lays the image out as a content directory named after the
//! image's distribution package (`name:tag`):
//!
//! ```text
//! <name:tag>/blobs/sha256/<hex>   one entry per blob
//! <name:tag>/manifest.json        the manifest, written last
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::checksum::Digest;
use crate::error::{MirrorError, Result};
use crate::types::ModelId;

/// Docker schema 2 image manifest
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list
pub const DOCKER_MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index
pub const OCI_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";

/// Name and tag of a container image within a model
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageIdentity {
    /// Image name, relative to the owning model
    pub name: String,
    /// Image tag
    pub tag: String,
}

impl ImageIdentity {
    /// Create a validated identity
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let tag = tag.into();

        if name.is_empty() || name.contains("..") || name.starts_with('/') || name.contains(':') {
            return Err(MirrorError::Validation(format!("Invalid image name: {:?}", name)));
        }
        let tag_ok = !tag.is_empty()
            && tag.len() <= 128
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !tag_ok {
            return Err(MirrorError::Validation(format!("Invalid image tag: {:?}", tag)));
        }

        Ok(Self { name, tag })
    }

    /// Parse a distribution package name (`name:tag`)
    pub fn parse(package: &str) -> Result<Self> {
        let (name, tag) = package.rsplit_once(':').ok_or_else(|| {
            MirrorError::Validation(format!(
                "Distribution package name must be name:tag, got {:?}",
                package
            ))
        })?;
        Self::new(name, tag)
    }

    /// Distribution package name, also used as the archive content directory
    pub fn package_name(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Registry repository holding this image for the given model
    pub fn repository(&self, model_id: &ModelId) -> String {
        format!("{}/{}", model_id, self.name)
    }

    /// Archive entry name of the manifest
    pub fn manifest_entry(&self) -> String {
        format!("{}/manifest.json", self.package_name())
    }

    /// Archive entry name of a blob
    pub fn blob_entry(&self, digest: &Digest) -> String {
        format!("{}/blobs/{}/{}", self.package_name(), digest.algorithm(), digest.hex())
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageIdentity {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        ImageIdentity::parse(s)
    }
}

/// A digest-addressed blob referenced by a manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobReference {
    /// Content digest
    pub digest: Digest,
    /// Size in bytes
    pub size: u64,
    /// Declared media type, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestShape {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<BlobReference>,
    #[serde(default)]
    layers: Vec<BlobReference>,
    #[serde(default)]
    manifests: Vec<BlobReference>,
}

/// An image manifest body together with its media type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    body: Vec<u8>,
    media_type: String,
    references: Vec<BlobReference>,
}

impl ImageManifest {
    /// Parse a manifest body, taking the media type from the `mediaType` field
    ///
    /// A manifest without a media type is rejected: the registry needs it as
    /// the content type of the manifest PUT.
    pub fn from_body(body: Vec<u8>) -> Result<Self> {
        let shape: ManifestShape = serde_json::from_slice(&body)
            .map_err(|e| MirrorError::Validation(format!("Invalid image manifest: {}", e)))?;

        let media_type = shape.media_type.clone().ok_or_else(|| {
            MirrorError::Validation("Image manifest has no mediaType".to_string())
        })?;
        Self::build(body, media_type, shape)
    }

    /// Build a manifest with an explicit media type
    pub fn with_media_type(body: Vec<u8>, media_type: impl Into<String>) -> Result<Self> {
        let shape: ManifestShape = serde_json::from_slice(&body)
            .map_err(|e| MirrorError::Validation(format!("Invalid image manifest: {}", e)))?;
        Self::build(body, media_type.into(), shape)
    }

    fn build(body: Vec<u8>, media_type: String, shape: ManifestShape) -> Result<Self> {
        validate_media_type(&media_type)?;

        let references = if is_index_type(&media_type) {
            shape.manifests
        } else {
            let config = shape.config.ok_or_else(|| {
                MirrorError::Validation("Image manifest has no config blob".to_string())
            })?;
            std::iter::once(config).chain(shape.layers).collect()
        };

        Ok(Self {
            body,
            media_type,
            references,
        })
    }

    /// Raw manifest bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Manifest media type
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Whether this is an index / manifest list rather than a single image
    pub fn is_index(&self) -> bool {
        is_index_type(&self.media_type)
    }

    /// Every blob (or child manifest) the manifest points at
    pub fn references(&self) -> &[BlobReference] {
        &self.references
    }

    /// Digests of every referenced blob, config first
    pub fn referenced_digests(&self) -> Vec<Digest> {
        self.references.iter().map(|r| r.digest.clone()).collect()
    }

    /// Digest of the manifest body itself
    pub fn digest(&self) -> Digest {
        Digest::sha256(&self.body)
    }
}

fn is_index_type(media_type: &str) -> bool {
    matches!(media_type, DOCKER_MANIFEST_LIST_V2 | OCI_INDEX_V1)
}

fn validate_media_type(media_type: &str) -> Result<()> {
    match media_type {
        DOCKER_MANIFEST_V2 | DOCKER_MANIFEST_LIST_V2 | OCI_MANIFEST_V1 | OCI_INDEX_V1 => Ok(()),
        other => Err(MirrorError::Validation(format!(
            "Unsupported manifest media type: {}",
            other
        ))),
    }
}
