//! Role resolution from Entra ID group memberships.

use std::collections::{BTreeSet, HashSet};

use crate::config::RolesConfig;

/// Pure mapping from group object ids to application role names.
///
/// A role is granted when any of its configured group ids appears in the
/// user's memberships. When nothing matches, the configured default role
/// (if any) is assigned; with no default, the result is empty and the
/// user stays unauthorized.
#[derive(Debug, Clone)]
pub struct RoleResolver {
    config: RolesConfig,
}

impl RoleResolver {
    pub fn new(config: RolesConfig) -> Self {
        Self { config }
    }

    /// Resolve a set of group ids to a sorted set of role names.
    pub fn resolve<'a, I>(&self, group_ids: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let groups: HashSet<&str> = group_ids.into_iter().collect();
        let mut roles = BTreeSet::new();

        for (role, configured) in &self.config.mappings {
            if configured
                .iter()
                .any(|gid| !gid.is_empty() && groups.contains(gid.as_str()))
            {
                roles.insert(role.clone());
            }
        }

        if roles.is_empty() {
            if let Some(default) = &self.config.default_role {
                if !default.is_empty() {
                    roles.insert(default.clone());
                }
            }
        }

        roles
    }
}
