//! Guard policy against destructive self-harm.
//!
//! Every check is pure: callers load whatever state is needed and run the
//! guard before touching storage. All failures are `Validation` errors.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::{GatekeeperError, Result};
use crate::models::{PermissionUpdate, RoleUpdate};
use crate::rbac::{ADMIN_ACCESS, ADMIN_ROLE, DEFAULT_ROLE};

/// Roles that can never be deleted or renamed.
pub const SYSTEM_ROLES: [&str; 2] = [ADMIN_ROLE, DEFAULT_ROLE];

pub fn is_system_role(name: &str) -> bool {
    SYSTEM_ROLES.contains(&name)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GuardPolicy;

impl GuardPolicy {
    /// An admin replacing their own roles must keep `admin`.
    ///
    /// Only the actor's own account is protected; demoting another admin is
    /// allowed even if it leaves a single administrator.
    pub fn check_role_replacement(
        &self,
        actor_id: i64,
        target_user_id: i64,
        target_current_roles: &BTreeSet<String>,
        requested_roles: &[String],
    ) -> Result<()> {
        if actor_id == target_user_id
            && target_current_roles.contains(ADMIN_ROLE)
            && !requested_roles.iter().any(|r| r == ADMIN_ROLE)
        {
            return Err(GatekeeperError::Validation(
                "cannot remove admin role from yourself".to_string(),
            ));
        }
        Ok(())
    }

    /// A single grant may carry an expiry, which must lie in the future. An
    /// admin cannot put an expiry on their own `admin` role.
    pub fn check_role_grant(
        &self,
        actor_id: i64,
        target_user_id: i64,
        role_name: &str,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(expires_at) = expires_at else {
            return Ok(());
        };
        if expires_at <= now {
            return Err(GatekeeperError::Validation(
                "expires_at must be in the future".to_string(),
            ));
        }
        if actor_id == target_user_id && role_name == ADMIN_ROLE {
            return Err(GatekeeperError::Validation(
                "cannot set an expiry on your own admin role".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_user_deletion(&self, actor_id: i64, target_user_id: i64) -> Result<()> {
        if actor_id == target_user_id {
            return Err(GatekeeperError::Validation(
                "cannot delete your own account".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_role_deletion(&self, role_name: &str) -> Result<()> {
        if is_system_role(role_name) {
            return Err(GatekeeperError::Validation(format!(
                "cannot delete system role '{}'",
                role_name
            )));
        }
        Ok(())
    }

    /// System roles keep their names; a rename would strip their protection.
    pub fn check_role_update(&self, role_name: &str, updates: &[RoleUpdate]) -> Result<()> {
        let renamed = updates
            .iter()
            .any(|u| matches!(u, RoleUpdate::Name(new_name) if new_name != role_name));

        if renamed && is_system_role(role_name) {
            return Err(GatekeeperError::Validation(format!(
                "cannot rename system role '{}'",
                role_name
            )));
        }
        Ok(())
    }

    /// The `admin` role must keep `admin.access`.
    pub fn check_role_permissions(&self, role_name: &str, requested: &[String]) -> Result<()> {
        if role_name == ADMIN_ROLE && !requested.iter().any(|p| p == ADMIN_ACCESS) {
            return Err(GatekeeperError::Validation(format!(
                "cannot remove {} from the {} role",
                ADMIN_ACCESS, ADMIN_ROLE
            )));
        }
        Ok(())
    }

    pub fn check_permission_deletion(&self, permission_name: &str) -> Result<()> {
        if permission_name == ADMIN_ACCESS {
            return Err(GatekeeperError::Validation(format!(
                "cannot delete critical permission {}",
                ADMIN_ACCESS
            )));
        }
        Ok(())
    }

    pub fn check_permission_update(
        &self,
        permission_name: &str,
        updates: &[PermissionUpdate],
    ) -> Result<()> {
        let renamed = updates
            .iter()
            .any(|u| matches!(u, PermissionUpdate::Name(new_name) if new_name != permission_name));

        if renamed && permission_name == ADMIN_ACCESS {
            return Err(GatekeeperError::Validation(format!(
                "cannot rename critical permission {}",
                ADMIN_ACCESS
            )));
        }
        Ok(())
    }
}
