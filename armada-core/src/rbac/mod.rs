//! Role-based access control gating every fleet command.

mod audit;
mod enforcer;

pub use audit::{AuditDecision, AuditEntry, AuditFilter, AuditLogger, DEFAULT_AUDIT_CAPACITY};
pub use enforcer::RbacEnforcer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-user restriction limiting where a permission applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceScope {
    #[serde(default)]
    pub node_groups: Vec<String>,
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub work_dirs: Vec<String>,
}

/// A named list of `resource:action` permissions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<String>,
}

impl Role {
    pub fn new<I, S>(name: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }
}

/// A control-plane caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<ResourceScope>,
    /// External channel name -> external identifier, for caller resolution.
    #[serde(default)]
    pub channel_ids: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
            scopes: Vec::new(),
            channel_ids: HashMap::new(),
            enabled: true,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// Wildcard permission match.
///
/// Segments are compared pairwise; a `*` segment matches any single segment,
/// a trailing `*` absorbs every remaining (or missing) segment, and the
/// superuser grant `admin:*` matches anything at all.
pub fn permission_matches(granted: &str, requested: &str) -> bool {
    if granted == "*" || granted == "admin:*" {
        return true;
    }
    let granted: Vec<&str> = granted.split(':').collect();
    let requested: Vec<&str> = requested.split(':').collect();

    let mut i = 0;
    loop {
        match (granted.get(i), requested.get(i)) {
            (Some(&"*"), _) if i == granted.len() - 1 => return true,
            (Some(&"*"), Some(_)) => i += 1,
            (Some(g), Some(r)) if g == r => i += 1,
            (None, None) => return true,
            _ => return false,
        }
    }
}
