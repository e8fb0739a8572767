//! Role-Based Access Control (RBAC)
//!
//! Roles grant `resource:action` permissions. Resources name a model
//! (`model/<id>`) or one release of a model (`release/<id>/<semver>`); a
//! trailing `*` segment matches any suffix.

use async_trait::async_trait;
use mirror_core::{Action, ModelId, Release, User};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::auth::{AuthDecision, Authorizer};
use crate::error::GatewayResult;

/// Permission representing a specific action on a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    /// Resource path (e.g. "model/m1", "release/m1/*", "*")
    pub resource: String,

    /// Action (e.g. "export", "import", "*")
    pub action: String,
}

impl Permission {
    /// Create a new permission
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// Permission to perform `action` on a model
    pub fn model(model: &ModelId, action: Action) -> Self {
        Self::new(format!("model/{}", model), action.as_str())
    }

    /// Permission to perform `action` on one release
    pub fn release(model: &ModelId, release: &Release, action: Action) -> Self {
        Self::new(
            format!("release/{}/{}", model, release.semver),
            action.as_str(),
        )
    }

    /// Check if this permission matches another (supports wildcards)
    pub fn matches(&self, other: &Permission) -> bool {
        let resource_match = match self.resource.strip_suffix('*') {
            Some(prefix) => other.resource.starts_with(prefix),
            None => self.resource == other.resource,
        };
        let action_match = self.action == "*" || self.action == other.action;
        resource_match && action_match
    }

    /// Create from string format "resource:action"
    pub fn from_string(s: &str) -> Result<Self, RbacError> {
        match s.rsplit_once(':') {
            Some((resource, action)) if !resource.is_empty() && !action.is_empty() => {
                Ok(Permission::new(resource, action))
            }
            _ => Err(RbacError::InvalidPermissionFormat(s.to_string())),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

/// Role with associated permissions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Role name
    pub name: String,

    /// Role description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Permissions granted to this role
    pub permissions: HashSet<Permission>,

    /// Parent roles (for role hierarchy)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits_from: Vec<String>,
}

impl Role {
    /// Create a new role
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            permissions: HashSet::new(),
            inherits_from: Vec::new(),
        }
    }

    /// Add a permission to this role
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    /// Add parent role for inheritance
    pub fn with_parent(mut self, parent_role: impl Into<String>) -> Self {
        self.inherits_from.push(parent_role.into());
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// RBAC policy: role definitions plus user role assignments
#[derive(Debug, Clone)]
pub struct RbacPolicy {
    roles: HashMap<String, Role>,
    assignments: HashMap<String, Vec<String>>,
}

impl Default for RbacPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RbacPolicy {
    /// Create a policy with the default mirroring roles
    pub fn new() -> Self {
        let mut policy = Self {
            roles: HashMap::new(),
            assignments: HashMap::new(),
        };
        policy.add_default_roles();
        policy
    }

    fn add_default_roles(&mut self) {
        self.add_role(
            Role::new("admin")
                .with_description("Full access to every model")
                .with_permission(Permission::new("*", "*")),
        );

        self.add_role(
            Role::new("exporter")
                .with_description("May export any model")
                .with_permission(Permission::new("model/*", "export")),
        );

        self.add_role(
            Role::new("importer")
                .with_description("May import into any model, including its releases")
                .with_permission(Permission::new("model/*", "import"))
                .with_permission(Permission::new("release/*", "import")),
        );

        self.add_role(
            Role::new("mirror-operator")
                .with_description("Runs both ends of a mirror")
                .with_parent("exporter")
                .with_parent("importer"),
        );
    }

    /// Add a role to the policy
    pub fn add_role(&mut self, role: Role) {
        self.roles.insert(role.name.clone(), role);
    }

    /// Get a role by name
    pub fn get_role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    /// Assign a role to a user
    pub fn assign(&mut self, user: &User, role: impl Into<String>) -> Result<(), RbacError> {
        let role = role.into();
        if !self.roles.contains_key(&role) {
            return Err(RbacError::RoleNotFound(role));
        }
        self.assignments.entry(user.dn.clone()).or_default().push(role);
        Ok(())
    }

    /// Roles assigned to a user
    pub fn roles_of(&self, user: &User) -> &[String] {
        self.assignments
            .get(&user.dn)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Get all permissions for a role (including inherited)
    pub fn get_role_permissions(&self, role_name: &str) -> HashSet<Permission> {
        let mut permissions = HashSet::new();
        let mut visited = HashSet::new();
        self.collect_permissions(role_name, &mut visited, &mut permissions);
        permissions
    }

    fn collect_permissions(
        &self,
        role_name: &str,
        visited: &mut HashSet<String>,
        permissions: &mut HashSet<Permission>,
    ) {
        if !visited.insert(role_name.to_string()) {
            return;
        }
        if let Some(role) = self.roles.get(role_name) {
            permissions.extend(role.permissions.iter().cloned());
            for parent in &role.inherits_from {
                self.collect_permissions(parent, visited, permissions);
            }
        }
    }

    /// Check if a user holds a specific permission
    pub fn has_permission(&self, user: &User, permission: &Permission) -> bool {
        self.roles_of(user).iter().any(|role| {
            self.get_role_permissions(role)
                .iter()
                .any(|p| p.matches(permission))
        })
    }
}

/// RBAC errors
#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("Invalid permission format: {0}. Expected format: resource:action")]
    InvalidPermissionFormat(String),

    #[error("Role not found: {0}")]
    RoleNotFound(String),
}

/// [`Authorizer`] backed by an [`RbacPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RbacAuthorizer {
    policy: RbacPolicy,
}

impl RbacAuthorizer {
    /// Create an authorizer over a policy
    pub fn new(policy: RbacPolicy) -> Self {
        Self { policy }
    }

    fn decide(&self, user: &User, permission: &Permission) -> AuthDecision {
        if self.policy.has_permission(user, permission) {
            AuthDecision::allow()
        } else {
            AuthDecision::deny(format!("{} lacks permission {}", user, permission))
        }
    }
}

#[async_trait]
impl Authorizer for RbacAuthorizer {
    async fn check_model_action(
        &self,
        user: &User,
        model: &ModelId,
        action: Action,
    ) -> GatewayResult<AuthDecision> {
        let decision = self.decide(user, &Permission::model(model, action));
        debug!(user = %user, model = %model, action = %action, allowed = decision.success, "Model action check");
        Ok(decision)
    }

    async fn check_release_import(
        &self,
        user: &User,
        model: &ModelId,
        releases: &[Release],
        action: Action,
    ) -> GatewayResult<Vec<AuthDecision>> {
        Ok(releases
            .iter()
            .map(|release| self.decide(user, &Permission::release(model, release, action)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use semver::Version;

    fn release(model: &ModelId, version: Version) -> Release {
        Release {
            model_id: model.clone(),
            semver: version,
            notes: String::new(),
            minor: false,
            draft: false,
            file_ids: vec![],
            images: vec![],
            created_by: "alice".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_permission_from_string() {
        let perm = Permission::from_string("release/m1/*:import").unwrap();
        assert_eq!(perm.resource, "release/m1/*");
        assert_eq!(perm.action, "import");
        assert!(Permission::from_string("invalid").is_err());
    }

    #[test]
    fn test_permission_wildcard_matching() {
        let model = ModelId::new("m1").unwrap();
        let all = Permission::new("*", "*");
        let models = Permission::new("model/*", "export");
        let exact = Permission::model(&model, Action::Export);

        assert!(all.matches(&exact));
        assert!(models.matches(&exact));
        assert!(!models.matches(&Permission::model(&model, Action::Import)));
        assert!(!exact.matches(&all));
    }

    #[test]
    fn test_role_inheritance() {
        let policy = RbacPolicy::new();
        let permissions = policy.get_role_permissions("mirror-operator");
        assert!(permissions.contains(&Permission::new("model/*", "export")));
        assert!(permissions.contains(&Permission::new("release/*", "import")));
    }

    #[test]
    fn test_inheritance_cycle_terminates() {
        let mut policy = RbacPolicy::new();
        policy.add_role(Role::new("a").with_parent("b"));
        policy.add_role(Role::new("b").with_parent("a"));
        assert!(policy.get_role_permissions("a").is_empty());
    }

    #[test]
    fn test_assign_unknown_role() {
        let mut policy = RbacPolicy::new();
        assert!(policy.assign(&User::new("bob"), "nope").is_err());
    }

    #[tokio::test]
    async fn test_release_checks_are_individual() {
        let model = ModelId::new("m1").unwrap();
        let user = User::new("carol");
        let mut policy = RbacPolicy::new();
        policy.add_role(
            Role::new("first-release-only")
                .with_permission(Permission::new("release/m1/1.0.0", "import")),
        );
        policy.assign(&user, "first-release-only").unwrap();
        let authorizer = RbacAuthorizer::new(policy);

        let releases = vec![
            release(&model, Version::new(1, 0, 0)),
            release(&model, Version::new(2, 0, 0)),
        ];
        let decisions = authorizer
            .check_release_import(&user, &model, &releases, Action::Import)
            .await
            .unwrap();
        assert!(decisions[0].success);
        assert!(!decisions[1].success);
        assert!(decisions[1].info.as_deref().unwrap().contains("release/m1/2.0.0"));

        let model_decision = authorizer
            .check_model_action(&user, &model, Action::Export)
            .await
            .unwrap();
        assert!(!model_decision.success);
    }
}
