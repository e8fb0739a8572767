//! Model documents carried by a documents archive
//!
//! A documents export contains the model card revisions, releases and file
//! records of one model. Each is serialized as an [`ArchivedDocument`], the
//! document's own fields flattened next to its provenance block.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::image::ImageIdentity;
use crate::provenance::MirrorProvenance;
use crate::types::ModelId;

/// Common behaviour of every mirrored document
pub trait MirroredDocument: Serialize + DeserializeOwned + Send {
    /// Short label used in logs and errors
    const LABEL: &'static str;

    /// Model the document belongs to
    fn model_id(&self) -> &ModelId;

    /// Re-home the document onto another model
    fn rehome(&mut self, model_id: ModelId);

    /// Archive entry name for this document
    fn entry_name(&self) -> String;

    /// Validate the document body
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// One revision of a model card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCardRevision {
    /// Owning model
    pub model_id: ModelId,

    /// Monotonic revision number
    pub version: u32,

    /// Classification schema the card was filled against
    pub schema_id: String,

    /// Card body as captured by the schema form
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Author of the revision
    pub created_by: String,

    /// Timestamp of the revision
    pub created_at: DateTime<Utc>,
}

impl MirroredDocument for ModelCardRevision {
    const LABEL: &'static str = "model card revision";

    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    fn rehome(&mut self, model_id: ModelId) {
        self.model_id = model_id;
    }

    fn entry_name(&self) -> String {
        format!("{}.json", self.version)
    }

    fn validate(&self) -> Result<()> {
        if self.schema_id.is_empty() {
            return Err(MirrorError::Validation(format!(
                "Model card revision {} has no schema",
                self.version
            )));
        }
        Ok(())
    }
}

/// A release of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Owning model
    pub model_id: ModelId,

    /// Semantic version of the release
    pub semver: Version,

    /// Release notes
    #[serde(default)]
    pub notes: String,

    /// Whether this is a minor release
    #[serde(default)]
    pub minor: bool,

    /// Whether the release is still a draft
    #[serde(default)]
    pub draft: bool,

    /// Files attached to the release
    #[serde(default)]
    pub file_ids: Vec<String>,

    /// Container images attached to the release
    #[serde(default)]
    pub images: Vec<ImageIdentity>,

    /// Author of the release
    pub created_by: String,

    /// Timestamp of the release
    pub created_at: DateTime<Utc>,
}

impl MirroredDocument for Release {
    const LABEL: &'static str = "release";

    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    fn rehome(&mut self, model_id: ModelId) {
        self.model_id = model_id;
    }

    fn entry_name(&self) -> String {
        format!("releases/{}.json", self.semver)
    }
}

/// Metadata of a file uploaded to a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// File identifier
    pub id: String,

    /// Owning model
    pub model_id: ModelId,

    /// Original file name
    pub name: String,

    /// Size in bytes
    pub size: u64,

    /// Content type / MIME type
    pub mime: String,

    /// Object key of the binary in the files bucket
    pub path: String,

    /// Whether the binary upload finished
    #[serde(default)]
    pub complete: bool,

    /// Timestamp when the file was created
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Conventional object key of a file binary
    pub fn storage_path(model_id: &ModelId, file_id: &str) -> String {
        format!("models/{}/files/{}", model_id, file_id)
    }

    /// Object key a mirrored copy of `source_path` lands on
    pub fn mirrored_path(source_path: &str, mirrored_model_id: &ModelId) -> String {
        let leaf = source_path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(source_path);
        Self::storage_path(mirrored_model_id, leaf)
    }
}

impl MirroredDocument for FileRecord {
    const LABEL: &'static str = "file";

    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    fn rehome(&mut self, model_id: ModelId) {
        self.path = Self::mirrored_path(&self.path, &model_id);
        self.model_id = model_id;
        self.complete = false;
    }

    fn entry_name(&self) -> String {
        format!("files/{}.json", self.id)
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.id.contains('/') {
            return Err(MirrorError::Validation(format!(
                "Invalid file id: {:?}",
                self.id
            )));
        }
        if self.path.is_empty() {
            return Err(MirrorError::Validation(format!(
                "File {} has no storage path",
                self.id
            )));
        }
        Ok(())
    }
}

/// A document together with its provenance block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedDocument<T> {
    /// Export provenance
    pub provenance: MirrorProvenance,

    /// The document itself
    #[serde(flatten)]
    pub document: T,
}

impl<T: MirroredDocument> ArchivedDocument<T> {
    /// Pair a document with provenance
    pub fn new(document: T, provenance: MirrorProvenance) -> Self {
        Self {
            provenance,
            document,
        }
    }

    /// Serialize to the archive entry body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and validate an archive entry body
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let archived: Self = serde_json::from_slice(bytes).map_err(|e| {
            MirrorError::Validation(format!("Invalid {} document: {}", T::LABEL, e))
        })?;
        archived.provenance.validate()?;
        archived.document.validate()?;
        Ok(archived)
    }

    /// Check both the provenance block and the declared model id
    pub fn verify_source(&self, expected: &ModelId) -> Result<()> {
        self.provenance.verify_source(expected)?;
        if self.document.model_id() != expected {
            return Err(MirrorError::Validation(format!(
                "{} declares model {} but job expects {}",
                T::LABEL,
                self.document.model_id(),
                expected
            )));
        }
        Ok(())
    }
}

/// Any document parsed from a documents archive
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedDocument {
    /// Model card revision
    CardRevision(ModelCardRevision),
    /// Release
    Release(Release),
    /// File record
    File(FileRecord),
}

impl ParsedDocument {
    /// Model the document belongs to
    pub fn model_id(&self) -> &ModelId {
        match self {
            ParsedDocument::CardRevision(card) => card.model_id(),
            ParsedDocument::Release(release) => release.model_id(),
            ParsedDocument::File(file) => file.model_id(),
        }
    }

    /// Archive entry name of the document
    pub fn entry_name(&self) -> String {
        match self {
            ParsedDocument::CardRevision(card) => card.entry_name(),
            ParsedDocument::Release(release) => release.entry_name(),
            ParsedDocument::File(file) => file.entry_name(),
        }
    }
}
