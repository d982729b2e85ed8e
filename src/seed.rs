//! Startup seeding of system roles, the base permission catalog and the
//! optional bootstrap administrator. Safe to run on every start.

use std::collections::BTreeSet;

use crate::catalog::{NewPermission, RoleCatalog};
use crate::config::BootstrapAdmin;
use crate::error::{GatekeeperError, Result};
use crate::models::NewUser;
use crate::password::PasswordManager;
use crate::rbac::{RBACService, ADMIN_ROLE, DEFAULT_ROLE};
use crate::users::UserStore;
use crate::validation::Validator;

/// `(resource, action, description)` for every seeded permission.
pub const SEED_PERMISSIONS: [(&str, &str, &str); 10] = [
    ("admin", "access", "Use the admin API"),
    ("users", "read", "View user accounts"),
    ("users", "manage", "Edit and delete user accounts"),
    ("roles", "read", "View roles and their permissions"),
    ("roles", "manage", "Create, edit and delete roles"),
    ("permissions", "manage", "Create, edit and delete permissions"),
    ("templates", "manage", "Manage email templates"),
    ("audit", "read", "Read the audit log"),
    ("profile", "read", "View your own profile"),
    ("profile", "update", "Edit your own profile"),
];

const USER_PERMISSIONS: [&str; 2] = ["profile.read", "profile.update"];

/// Create the system roles and base permissions if missing, and make sure
/// each system role holds at least its seeded permissions. Permissions an
/// administrator added later are left alone.
pub async fn seed_catalog(catalog: &RoleCatalog) -> Result<()> {
    let admin = ensure_role(catalog, ADMIN_ROLE, "Full administrative access").await?;
    let user = ensure_role(catalog, DEFAULT_ROLE, "Default role for registered users").await?;

    for (resource, action, description) in SEED_PERMISSIONS {
        let result = catalog
            .create_permission(&NewPermission {
                name: None,
                resource: resource.to_string(),
                action: action.to_string(),
                description: Some(description.to_string()),
            })
            .await;
        match result {
            Ok(_) | Err(GatekeeperError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let all_seeded: Vec<String> = SEED_PERMISSIONS
        .iter()
        .map(|(resource, action, _)| format!("{}.{}", resource, action))
        .collect();
    ensure_role_permissions(catalog, admin, &all_seeded).await?;

    let user_seeded: Vec<String> = USER_PERMISSIONS.iter().map(|s| s.to_string()).collect();
    ensure_role_permissions(catalog, user, &user_seeded).await?;

    tracing::info!("Role catalog seeded");
    Ok(())
}

async fn ensure_role(catalog: &RoleCatalog, name: &str, description: &str) -> Result<i64> {
    if let Some(role) = catalog.find_role_by_name(name).await? {
        return Ok(role.id);
    }
    Ok(catalog.create_role(name, Some(description)).await?.id)
}

async fn ensure_role_permissions(
    catalog: &RoleCatalog,
    role_id: i64,
    required: &[String],
) -> Result<()> {
    let current: BTreeSet<String> = catalog
        .get_role_permissions(role_id)
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect();

    if required.iter().all(|p| current.contains(p)) {
        return Ok(());
    }

    let merged: Vec<String> = current.into_iter().chain(required.iter().cloned()).collect();
    catalog.set_role_permissions(role_id, &merged).await
}

/// Create the configured administrator account, or restore its system roles
/// if it already exists.
pub async fn bootstrap_admin(
    users: &UserStore,
    rbac: &RBACService,
    passwords: &PasswordManager,
    validator: &Validator,
    admin: &BootstrapAdmin,
) -> Result<i64> {
    let email = validator.normalize_email(&admin.email)?;

    let user_id = match users.find_by_email(&email).await? {
        Some(existing) => {
            tracing::info!(user_id = existing.id, "Bootstrap admin already exists");
            existing.id
        }
        None => {
            validator.password(&admin.password)?;
            let user = users
                .create_user(&NewUser {
                    email: email.clone(),
                    password_hash: passwords.hash(&admin.password)?,
                    name: validator.display_name(&admin.name)?,
                    phone: None,
                    company: None,
                })
                .await?;
            tracing::info!(user_id = user.id, email = %email, "Bootstrap admin created");
            user.id
        }
    };

    for role in [ADMIN_ROLE, DEFAULT_ROLE] {
        if !rbac.has_role(user_id, role).await? {
            rbac.grant_role(user_id, role, None, None).await?;
        }
    }

    Ok(user_id)
}
