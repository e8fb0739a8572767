//! Registry token minting
//!
//! Tokens follow the Docker registry token-auth format: a JWT whose `access`
//! claim lists the repository and the actions granted on it.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use mirror_core::User;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::registry::{RegistryAction, RegistryToken, TokenIssuer};

const DEFAULT_SECRET: &str = "change-me-in-production";

/// Registry token configuration
#[derive(Debug, Clone)]
pub struct RegistryTokenConfig {
    /// Secret key for signing tokens
    pub secret: String,

    /// Token lifetime in seconds
    pub ttl_seconds: i64,

    /// Token issuer
    pub issuer: String,

    /// Token audience (the registry service name)
    pub audience: String,

    /// Algorithm for signing
    pub algorithm: Algorithm,
}

impl Default for RegistryTokenConfig {
    fn default() -> Self {
        Self {
            secret: DEFAULT_SECRET.to_string(),
            ttl_seconds: 300,
            issuer: "model-mirror".to_string(),
            audience: "registry".to_string(),
            algorithm: Algorithm::HS256,
        }
    }
}

impl RegistryTokenConfig {
    /// Create a configuration with the given secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Default::default()
        }
    }

    /// Set token lifetime in seconds
    pub fn with_ttl(mut self, seconds: i64) -> Self {
        self.ttl_seconds = seconds;
        self
    }

    /// Set issuer
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Set audience
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> GatewayResult<()> {
        if self.secret.is_empty() {
            return Err(GatewayError::Configuration(
                "Registry token secret cannot be empty".to_string(),
            ));
        }

        if self.secret == DEFAULT_SECRET {
            warn!("Using default registry token secret - change this in production!");
        }

        if self.ttl_seconds <= 0 {
            return Err(GatewayError::Configuration(
                "Registry token TTL must be positive".to_string(),
            ));
        }

        if self.issuer.is_empty() || self.audience.is_empty() {
            return Err(GatewayError::Configuration(
                "Registry token issuer and audience cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// One entry of the `access` claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    /// Resource type, always "repository"
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Repository name
    pub name: String,

    /// Granted actions
    pub actions: Vec<RegistryAction>,
}

/// Registry token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryClaims {
    /// Subject (user dn)
    pub sub: String,

    /// Issuer
    pub iss: String,

    /// Audience
    pub aud: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Not before (Unix timestamp)
    pub nbf: i64,

    /// JWT ID
    pub jti: String,

    /// Granted repository access
    #[serde(default)]
    pub access: Vec<AccessEntry>,
}

impl RegistryClaims {
    /// Check the claims grant `action` on `repository`
    pub fn grants(&self, repository: &str, action: RegistryAction) -> bool {
        self.access
            .iter()
            .any(|entry| entry.name == repository && entry.actions.contains(&action))
    }
}

/// JWT-based [`TokenIssuer`]
pub struct JwtTokenIssuer {
    config: RegistryTokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenIssuer {
    /// Create a new issuer
    pub fn new(config: RegistryTokenConfig) -> GatewayResult<Self> {
        config.validate()?;

        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::new(config.algorithm);
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&config.audience]);
        validation.validate_exp = true;
        validation.validate_nbf = true;

        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            validation,
        })
    }

    /// Build claims for a scope
    pub fn claims(&self, user: &User, repository: &str, actions: &[RegistryAction]) -> RegistryClaims {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.config.ttl_seconds);

        RegistryClaims {
            sub: user.dn.clone(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            access: vec![AccessEntry {
                resource_type: "repository".to_string(),
                name: repository.to_string(),
                actions: actions.to_vec(),
            }],
        }
    }

    /// Validate and decode a token
    pub fn verify(&self, token: &str) -> GatewayResult<RegistryClaims> {
        let data = decode::<RegistryClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::PermissionDenied(format!("Invalid registry token: {}", e)))?;
        Ok(data.claims)
    }
}

#[async_trait]
impl TokenIssuer for JwtTokenIssuer {
    #[instrument(skip(self), fields(user = %user))]
    async fn issue(
        &self,
        user: &User,
        repository: &str,
        actions: &[RegistryAction],
    ) -> GatewayResult<RegistryToken> {
        if actions.is_empty() {
            return Err(GatewayError::InvalidData(
                "Registry token needs at least one action".to_string(),
            ));
        }

        let claims = self.claims(user, repository, actions);
        let header = Header::new(self.config.algorithm);
        let value = encode(&header, &claims, &self.encoding_key)?;

        debug!(jti = %claims.jti, "Issued registry token");
        Ok(RegistryToken::new(value, repository, actions))
    }
}
