//! Mirror configuration
//!
//! This module handles hierarchical configuration loading from multiple sources:
//! - Default configuration file
//! - Environment-specific configuration file
//! - Environment variables

use config::{Config, ConfigError, Environment, File};
use mirror_core::MirrorError;
use mirror_gateway::{Ed25519Signer, HttpRegistryConfig, RegistryTokenConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::context::PipelineSettings;
use crate::error::ServiceResult;
use crate::telemetry::TelemetryConfig;
use crate::upload::UploadTarget;

/// Mirror configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Model file storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Export settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Import settings
    #[serde(default)]
    pub import: ImportConfig,

    /// Distribution registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Model file storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding model file binaries
    #[serde(default = "default_files_bucket")]
    pub files_bucket: String,
}

fn default_files_bucket() -> String {
    "model-files".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            files_bucket: default_files_bucket(),
        }
    }
}

/// Export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Allow exports from this instance
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bucket receiving finished archives
    #[serde(default = "default_export_bucket")]
    pub bucket: String,

    /// Key prefix for finished archives
    #[serde(default = "default_export_prefix")]
    pub key_prefix: String,

    /// Bucket for archives awaiting signature
    #[serde(default = "default_staging_bucket")]
    pub staging_bucket: String,

    /// Key prefix for staged archives
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,

    /// Archive signing
    #[serde(default)]
    pub signing: SigningConfig,
}

fn default_true() -> bool {
    true
}

fn default_export_bucket() -> String {
    "mirror-exports".to_string()
}

fn default_export_prefix() -> String {
    "exports".to_string()
}

fn default_staging_bucket() -> String {
    "mirror-staging".to_string()
}

fn default_staging_prefix() -> String {
    "staging".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bucket: default_export_bucket(),
            key_prefix: default_export_prefix(),
            staging_bucket: default_staging_bucket(),
            staging_prefix: default_staging_prefix(),
            signing: SigningConfig::default(),
        }
    }
}

/// Archive signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Sign archives before publishing them
    #[serde(default)]
    pub enabled: bool,

    /// Identifier of the signing key
    #[serde(default = "default_key_id")]
    pub key_id: String,

    /// Hex-encoded Ed25519 seed
    #[serde(default)]
    pub seed_hex: Option<String>,
}

fn default_key_id() -> String {
    "mirror-signing".to_string()
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_id: default_key_id(),
            seed_hex: None,
        }
    }
}

/// Import configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Largest image manifest buffered before it is committed
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: usize,
}

fn default_max_manifest_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_manifest_bytes: default_max_manifest_bytes(),
        }
    }
}

/// Distribution registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry base URL
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Token minting
    #[serde(default)]
    pub token: TokenConfig,
}

fn default_registry_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            timeout_seconds: default_timeout(),
            token: TokenConfig::default(),
        }
    }
}

/// Registry token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Token issuer
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Registry service name the tokens are issued for
    #[serde(default = "default_audience")]
    pub audience: String,

    /// Token lifetime in seconds
    #[serde(default = "default_token_ttl")]
    pub ttl_seconds: i64,

    /// Shared signing secret
    #[serde(default = "default_secret")]
    pub secret: String,
}

fn default_issuer() -> String {
    "model-mirror".to_string()
}

fn default_audience() -> String {
    "registry".to_string()
}

fn default_token_ttl() -> i64 {
    300
}

fn default_secret() -> String {
    RegistryTokenConfig::default().secret
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            audience: default_audience(),
            ttl_seconds: default_token_ttl(),
            secret: default_secret(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON formatting
    #[serde(default)]
    pub json_format: bool,

    /// Include thread IDs
    #[serde(default)]
    pub include_thread_ids: bool,

    /// Include target module
    #[serde(default = "default_true")]
    pub include_target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            include_thread_ids: false,
            include_target: true,
        }
    }
}

impl MirrorConfig {
    /// Load configuration from files and environment
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default configuration file (`<config_dir>/default.toml`)
    /// 2. Environment-specific file (`<config_dir>/<environment>.toml`)
    /// 3. Environment variables (`MODEL_MIRROR_*`, `__` between sections)
    ///
    /// A `.env` file in the working directory is read first, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or parsed
    pub fn load(config_dir: impl Into<PathBuf>, environment: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config_dir = config_dir.into();

        let config = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", environment))).required(false))
            // e.g. MODEL_MIRROR_EXPORT__BUCKET=archives
            .add_source(
                Environment::with_prefix("MODEL_MIRROR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration with defaults if files don't exist
    pub fn load_or_default(config_dir: impl Into<PathBuf>, environment: &str) -> Self {
        Self::load(config_dir, environment).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load configuration: {}", e);
            eprintln!("Using default configuration");
            Self::default()
        })
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> ServiceResult<()> {
        let buckets = [
            ("storage.files_bucket", &self.storage.files_bucket),
            ("export.bucket", &self.export.bucket),
            ("export.staging_bucket", &self.export.staging_bucket),
        ];
        for (field, value) in buckets {
            if value.trim().is_empty() {
                return Err(MirrorError::Validation(format!("{} cannot be empty", field)));
            }
        }

        if self.export.signing.enabled && self.export.signing.seed_hex.is_none() {
            return Err(MirrorError::Validation(
                "export.signing is enabled but no seed_hex is configured".to_string(),
            ));
        }

        if self.import.max_manifest_bytes == 0 {
            return Err(MirrorError::Validation(
                "import.max_manifest_bytes must be positive".to_string(),
            ));
        }

        Url::parse(&self.registry.url).map_err(|e| {
            MirrorError::Validation(format!("Invalid registry.url {}: {}", self.registry.url, e))
        })?;

        self.token_config().validate()?;
        Ok(())
    }

    /// Settings shared by exporters and importers
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            export_enabled: self.export.enabled,
            files_bucket: self.storage.files_bucket.clone(),
            max_manifest_bytes: self.import.max_manifest_bytes,
        }
    }

    /// Where export archives are written
    pub fn upload_target(&self) -> UploadTarget {
        UploadTarget {
            bucket: self.export.bucket.clone(),
            key_prefix: self.export.key_prefix.clone(),
            staging_bucket: self.export.staging_bucket.clone(),
            staging_prefix: self.export.staging_prefix.clone(),
        }
    }

    /// Registry token issuer settings
    pub fn token_config(&self) -> RegistryTokenConfig {
        RegistryTokenConfig::new(self.registry.token.secret.clone())
            .with_ttl(self.registry.token.ttl_seconds)
            .with_issuer(self.registry.token.issuer.clone())
            .with_audience(self.registry.token.audience.clone())
    }

    /// HTTP registry client settings
    pub fn http_registry_config(&self) -> ServiceResult<HttpRegistryConfig> {
        Ok(HttpRegistryConfig::new(&self.registry.url)?
            .with_timeout(Duration::from_secs(self.registry.timeout_seconds)))
    }

    /// Archive signer, when signing is enabled
    pub fn signer(&self) -> ServiceResult<Option<Ed25519Signer>> {
        let signing = &self.export.signing;
        if !signing.enabled {
            return Ok(None);
        }
        let seed = signing.seed_hex.as_deref().ok_or_else(|| {
            MirrorError::Validation("export.signing.seed_hex is required".to_string())
        })?;
        Ok(Some(Ed25519Signer::from_seed_hex(signing.key_id.clone(), seed)?))
    }

    /// Logging initialisation settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig::new()
            .with_log_level(self.logging.level.clone())
            .with_json_format(self.logging.json_format)
            .with_thread_ids(self.logging.include_thread_ids)
            .with_target(self.logging.include_target)
    }
}

/// Get the current environment name
///
/// Reads from the `ENVIRONMENT` or `ENV` environment variable,
/// defaulting to "development" if not set.
pub fn get_environment() -> String {
    std::env::var("ENVIRONMENT")
        .or_else(|_| std::env::var("ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get the configuration directory
///
/// Reads from the `CONFIG_DIR` environment variable,
/// defaulting to "config" if not set.
pub fn get_config_dir() -> PathBuf {
    std::env::var("CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"))
}
