//! Object storage locations
//!
//! Archives, staged archives and model file binaries all live in a blob
//! store addressed by bucket and key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{MirrorError, Result};

/// User metadata stored alongside an object
pub type ObjectMetadata = BTreeMap<String, String>;

/// Location of one object in the blob store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Bucket name
    pub bucket: String,
    /// Object key within the bucket
    pub key: String,
}

impl StorageLocation {
    /// Create a new storage location with validation
    ///
    /// # Errors
    /// Returns an error if the bucket or key is empty, or the key is absolute
    /// or escapes its prefix.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        let key = key.into();

        if bucket.is_empty() {
            return Err(MirrorError::Validation(
                "Storage bucket cannot be empty".to_string(),
            ));
        }
        if key.is_empty() {
            return Err(MirrorError::Validation(
                "Storage key cannot be empty".to_string(),
            ));
        }
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return Err(MirrorError::Validation(format!(
                "Storage key must be relative: {}",
                key
            )));
        }

        Ok(Self { bucket, key })
    }

    /// Join a prefix and a name into a key, tolerating stray slashes
    pub fn join_key(prefix: &str, name: &str) -> String {
        let prefix = prefix.trim_matches('/');
        let name = name.trim_start_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    /// Location of `name` under `prefix` in `bucket`
    pub fn under(bucket: impl Into<String>, prefix: &str, name: &str) -> Result<Self> {
        Self::new(bucket, Self::join_key(prefix, name))
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// URI form (`bucket://key`)
    pub fn uri(&self) -> String {
        format!("{}://{}", self.bucket, self.key)
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

impl FromStr for StorageLocation {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        let (bucket, key) = s.split_once("://").ok_or_else(|| {
            MirrorError::Validation(format!("Storage location must be bucket://key, got {}", s))
        })?;
        Self::new(bucket, key)
    }
}
