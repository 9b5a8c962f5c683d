//! Organization membership and permission checks.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::document::{OrganizationId, UserId};
use crate::error::{GeoreferenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Create documents, fit transforms and roll back fits.
    Georeference,
    /// Submit, cancel and retry tile jobs.
    GenerateTiles,
    /// Read job status and fit history.
    ViewJobs,
}

impl Permission {
    pub const ALL: [Permission; 3] = [
        Permission::Georeference,
        Permission::GenerateTiles,
        Permission::ViewJobs,
    ];
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    /// `Ok(())` if `user` holds `permission` in `organization`, otherwise
    /// `AccessDenied`.
    async fn authorize(
        &self,
        user: UserId,
        organization: OrganizationId,
        permission: Permission,
    ) -> Result<()>;
}

/// Membership table held in memory.
#[derive(Default)]
pub struct StaticAccessControl {
    grants: RwLock<HashMap<(UserId, OrganizationId), HashSet<Permission>>>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user: UserId, organization: OrganizationId, permissions: &[Permission]) {
        self.grants
            .write()
            .entry((user, organization))
            .or_default()
            .extend(permissions.iter().copied());
    }

    pub fn grant_all(&self, user: UserId, organization: OrganizationId) {
        self.grant(user, organization, &Permission::ALL);
    }

    /// Remove the user from the organization entirely.
    pub fn revoke(&self, user: UserId, organization: OrganizationId) {
        self.grants.write().remove(&(user, organization));
    }
}

#[async_trait]
impl AccessControl for StaticAccessControl {
    async fn authorize(
        &self,
        user: UserId,
        organization: OrganizationId,
        permission: Permission,
    ) -> Result<()> {
        let allowed = self
            .grants
            .read()
            .get(&(user, organization))
            .is_some_and(|perms| perms.contains(&permission));
        if allowed {
            Ok(())
        } else {
            tracing::debug!(user = %user, organization = %organization, ?permission, "Access denied");
            Err(GeoreferenceError::AccessDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grants_are_per_organization_and_permission() {
        let access = StaticAccessControl::new();
        let user = UserId::new();
        let org = OrganizationId::new();
        access.grant(user, org, &[Permission::ViewJobs]);

        access.authorize(user, org, Permission::ViewJobs).await.unwrap();
        assert!(matches!(
            access.authorize(user, org, Permission::GenerateTiles).await,
            Err(GeoreferenceError::AccessDenied)
        ));
        assert!(matches!(
            access
                .authorize(user, OrganizationId::new(), Permission::ViewJobs)
                .await,
            Err(GeoreferenceError::AccessDenied)
        ));

        access.revoke(user, org);
        assert!(access.authorize(user, org, Permission::ViewJobs).await.is_err());
    }
}
