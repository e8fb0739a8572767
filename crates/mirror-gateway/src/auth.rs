//! Authorization collaborator contract

use async_trait::async_trait;
use mirror_core::{Action, ModelId, Release, User};
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;

/// Outcome of one capability check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDecision {
    /// Whether the action is allowed
    pub success: bool,
    /// Explanation when denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl AuthDecision {
    /// An allowing decision
    pub fn allow() -> Self {
        Self {
            success: true,
            info: None,
        }
    }

    /// A denying decision with an explanation
    pub fn deny(info: impl Into<String>) -> Self {
        Self {
            success: false,
            info: Some(info.into()),
        }
    }
}

/// Capability checks against models and releases
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Check that `user` may perform `action` on `model`
    async fn check_model_action(
        &self,
        user: &User,
        model: &ModelId,
        action: Action,
    ) -> GatewayResult<AuthDecision>;

    /// Check `action` for each release; one decision per release, same order
    async fn check_release_import(
        &self,
        user: &User,
        model: &ModelId,
        releases: &[Release],
        action: Action,
    ) -> GatewayResult<Vec<AuthDecision>>;
}
