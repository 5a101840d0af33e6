//! Permission evaluation with a full audit trail.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    permission_matches, AuditDecision, AuditEntry, AuditLogger, Role, User,
};

/// Evaluates `check(user, permission, resource)` against the registered
/// users and roles. Every decision appends one audit entry; a failed audit
/// write can never block the decision (the in-memory logger cannot fail).
pub struct RbacEnforcer {
    users: RwLock<HashMap<String, User>>,
    roles: RwLock<HashMap<String, Role>>,
    audit: Arc<AuditLogger>,
}

impl RbacEnforcer {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            audit,
        }
    }

    pub fn audit_log(&self) -> Arc<AuditLogger> {
        Arc::clone(&self.audit)
    }

    pub async fn upsert_user(&self, user: User) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn upsert_role(&self, role: Role) {
        self.roles.write().await.insert(role.name.clone(), role);
    }

    pub async fn get_user(&self, user_id: &str) -> Option<User> {
        self.users.read().await.get(user_id).cloned()
    }

    async fn record(
        &self,
        user_id: &str,
        permission: &str,
        resource: &str,
        decision: AuditDecision,
        reason: &str,
    ) {
        self.audit
            .record(AuditEntry {
                timestamp: Utc::now(),
                user_id: user_id.to_string(),
                permission: permission.to_string(),
                resource: resource.to_string(),
                decision,
                reason: reason.to_string(),
                channel: None,
                session_key: None,
            })
            .await;
    }

    /// Whether `user_id` holds `permission` for `resource`.
    pub async fn check(&self, user_id: &str, permission: &str, resource: &str) -> bool {
        let user = match self.users.read().await.get(user_id).cloned() {
            Some(user) => user,
            None => {
                self.record(user_id, permission, resource, AuditDecision::Deny, "unknown user")
                    .await;
                return false;
            }
        };
        if !user.enabled {
            self.record(user_id, permission, resource, AuditDecision::Deny, "user disabled")
                .await;
            return false;
        }

        let matched_role = {
            let roles = self.roles.read().await;
            let mut matched = None;
            'roles: for role_name in &user.roles {
                let Some(role) = roles.get(role_name) else {
                    debug!("user {} references unknown role {}", user_id, role_name);
                    continue;
                };
                for granted in &role.permissions {
                    if permission_matches(granted, permission) {
                        matched = Some(role_name.clone());
                        break 'roles;
                    }
                }
            }
            matched
        };

        if let Some(role_name) = matched_role {
            let reason = format!("granted by role {}", role_name);
            self.record(user_id, permission, resource, AuditDecision::Allow, &reason)
                .await;
            return true;
        }

        self.record(
            user_id,
            permission,
            resource,
            AuditDecision::Deny,
            "no matching permission",
        )
        .await;
        false
    }

    /// `check` plus node-group scope verification. A user without any scope
    /// restriction passes on permission alone.
    pub async fn check_with_scope(
        &self,
        user_id: &str,
        permission: &str,
        resource: &str,
        node_group: &str,
    ) -> bool {
        if !self.check(user_id, permission, resource).await {
            return false;
        }
        let Some(user) = self.get_user(user_id).await else {
            return false;
        };
        if user.scopes.is_empty() {
            return true;
        }
        let in_scope = user
            .scopes
            .iter()
            .any(|s| s.node_groups.iter().any(|g| g == node_group));
        if !in_scope {
            let reason = format!("node group {} not in scope", node_group);
            self.record(user_id, permission, resource, AuditDecision::Deny, &reason)
                .await;
        }
        in_scope
    }

    /// Resolve the internal user for an external channel identity.
    pub async fn resolve_user_from_channel(&self, channel: &str, sender_id: &str) -> Option<User> {
        self.users
            .read()
            .await
            .values()
            .find(|u| {
                u.channel_ids
                    .get(channel)
                    .map(|id| id == sender_id)
                    .unwrap_or(false)
            })
            .cloned()
    }
}
