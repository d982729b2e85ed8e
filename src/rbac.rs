//! Role-Based Access Control (RBAC) resolver.
//!
//! Computes a user's current roles and permissions from the grant tables and
//! answers point queries against them. Nothing here trusts token claims:
//! every check reads the store, so grant changes apply to the next request.
//!
//! Route protection uses the [`Authenticated<P>`] extractor, where the marker
//! type `P` names the [`AccessPolicy`] the route requires.

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};

use crate::catalog::permission_from_row;
use crate::database::{format_timestamp, parse_optional_timestamp, parse_timestamp, Database};
use crate::error::{GatekeeperError, Result};
use crate::models::{Permission, RoleGrant};

/// Name of the role every registered user receives.
pub const DEFAULT_ROLE: &str = "user";
/// Name of the administrator role.
pub const ADMIN_ROLE: &str = "admin";
/// Permission gating the whole admin API.
pub const ADMIN_ACCESS: &str = "admin.access";

// ========== Access Requirements ==========

/// What a caller must hold to pass a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AccessRequirement {
    /// At least one of the listed roles.
    AnyOf(Vec<String>),
    /// Every listed role.
    AllOf(Vec<String>),
    /// This specific role.
    Role(String),
    /// This permission, through any granted role.
    Permission(String),
}

impl AccessRequirement {
    /// Evaluate against already resolved role and permission sets.
    pub fn is_satisfied_by(&self, roles: &BTreeSet<String>, permissions: &BTreeSet<String>) -> bool {
        match self {
            Self::AnyOf(required) => required.iter().any(|r| roles.contains(r)),
            Self::AllOf(required) => required.iter().all(|r| roles.contains(r)),
            Self::Role(required) => roles.contains(required),
            Self::Permission(required) => permissions.contains(required),
        }
    }
}

impl fmt::Display for AccessRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnyOf(roles) => write!(f, "one of roles [{}]", roles.join(", ")),
            Self::AllOf(roles) => write!(f, "all of roles [{}]", roles.join(", ")),
            Self::Role(role) => write!(f, "role {}", role),
            Self::Permission(permission) => write!(f, "permission {}", permission),
        }
    }
}

// ========== Access Policy Markers ==========

/// A compile-time route policy. Implemented by zero-sized marker types.
pub trait AccessPolicy: 'static + Send + Sync {
    /// `None` means any authenticated, active user.
    fn requirement() -> Option<AccessRequirement>;
}

/// Any signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnyUser;

/// Holders of the `admin.access` permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminPanel;

impl AccessPolicy for AnyUser {
    fn requirement() -> Option<AccessRequirement> {
        None
    }
}

impl AccessPolicy for AdminPanel {
    fn requirement() -> Option<AccessRequirement> {
        Some(AccessRequirement::Permission(ADMIN_ACCESS.to_string()))
    }
}

/// An authenticated caller that satisfied policy `P`.
///
/// Only the extractor can construct this, so holding one proves the check ran.
#[derive(Debug, Clone)]
pub struct Authenticated<P: AccessPolicy> {
    pub user_id: i64,
    pub email: String,
    _policy: PhantomData<P>,
}

impl<P: AccessPolicy> Authenticated<P> {
    fn new(user_id: i64, email: String) -> Self {
        Self {
            user_id,
            email,
            _policy: PhantomData,
        }
    }
}

// ========== RBAC Service ==========

/// Resolves and mutates role grants.
pub struct RBACService {
    db: Arc<Database>,
}

impl RBACService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Whether the user exists and is not soft-deleted.
    pub async fn is_active_user(&self, user_id: i64) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ? AND deleted_at IS NULL)",
        )
        .bind(user_id)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to check user: {}", e)))?;

        Ok(exists != 0)
    }

    /// Names of the roles currently granted to the user. Expired grants are excluded.
    pub async fn get_roles_for_user(&self, user_id: i64) -> Result<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT r.name
             FROM user_roles ur
             JOIN roles r ON r.id = ur.role_id
             WHERE ur.user_id = ?
               AND (ur.expires_at IS NULL OR ur.expires_at > ?)",
        )
        .bind(user_id)
        .bind(format_timestamp(Utc::now()))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to get user roles: {}", e)))?;

        Ok(names.into_iter().collect())
    }

    /// Union of the permissions of every current role, each listed once.
    pub async fn get_permissions_for_user(&self, user_id: i64) -> Result<Vec<Permission>> {
        let rows = sqlx::query(
            "SELECT DISTINCT p.id, p.name, p.resource, p.action, p.description
             FROM user_roles ur
             JOIN role_permissions rp ON rp.role_id = ur.role_id
             JOIN permissions p ON p.id = rp.permission_id
             WHERE ur.user_id = ?
               AND (ur.expires_at IS NULL OR ur.expires_at > ?)
             ORDER BY p.name",
        )
        .bind(user_id)
        .bind(format_timestamp(Utc::now()))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| {
            GatekeeperError::Database(format!("Failed to get user permissions: {}", e))
        })?;

        Ok(rows.iter().map(permission_from_row).collect())
    }

    pub async fn get_permission_names_for_user(&self, user_id: i64) -> Result<BTreeSet<String>> {
        Ok(self
            .get_permissions_for_user(user_id)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }

    /// Existence check; agrees with membership in [`Self::get_permissions_for_user`].
    pub async fn has_permission(&self, user_id: i64, permission: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1
                FROM user_roles ur
                JOIN role_permissions rp ON rp.role_id = ur.role_id
                JOIN permissions p ON p.id = rp.permission_id
                WHERE ur.user_id = ?
                  AND p.name = ?
                  AND (ur.expires_at IS NULL OR ur.expires_at > ?)
             )",
        )
        .bind(user_id)
        .bind(permission)
        .bind(format_timestamp(Utc::now()))
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to check permission: {}", e)))?;

        Ok(exists != 0)
    }

    pub async fn has_role(&self, user_id: i64, role: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1
                FROM user_roles ur
                JOIN roles r ON r.id = ur.role_id
                WHERE ur.user_id = ?
                  AND r.name = ?
                  AND (ur.expires_at IS NULL OR ur.expires_at > ?)
             )",
        )
        .bind(user_id)
        .bind(role)
        .bind(format_timestamp(Utc::now()))
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to check role: {}", e)))?;

        Ok(exists != 0)
    }

    /// Evaluate a requirement, failing with `Forbidden` when it is not met.
    pub async fn check(&self, user_id: i64, requirement: &AccessRequirement) -> Result<()> {
        let allowed = match requirement {
            AccessRequirement::Permission(name) => self.has_permission(user_id, name).await?,
            AccessRequirement::Role(name) => self.has_role(user_id, name).await?,
            AccessRequirement::AnyOf(_) | AccessRequirement::AllOf(_) => {
                let roles = self.get_roles_for_user(user_id).await?;
                requirement.is_satisfied_by(&roles, &BTreeSet::new())
            }
        };

        if allowed {
            Ok(())
        } else {
            Err(GatekeeperError::Forbidden(format!(
                "insufficient permissions: requires {}",
                requirement
            )))
        }
    }

    /// Replace every role of a user in one transaction.
    ///
    /// Roles kept from the previous set retain their original grant metadata
    /// (any expiry is cleared). An unknown role name aborts with no change.
    /// An empty list leaves the user with no roles.
    pub async fn set_roles_for_user(
        &self,
        user_id: i64,
        role_names: &[String],
        granted_by: Option<i64>,
    ) -> Result<()> {
        self.replace_roles_checked(user_id, role_names, granted_by, |_| Ok(()))
            .await?;
        Ok(())
    }

    /// Like [`set_roles_for_user`](Self::set_roles_for_user), but `check` sees
    /// the user's active roles read inside the same transaction and can veto
    /// the change. Returns the roles the user held before the replacement.
    pub async fn replace_roles_checked<F>(
        &self,
        user_id: i64,
        role_names: &[String],
        granted_by: Option<i64>,
        check: F,
    ) -> Result<BTreeSet<String>>
    where
        F: FnOnce(&BTreeSet<String>) -> Result<()>,
    {
        let requested: BTreeSet<&str> = role_names.iter().map(String::as_str).collect();
        let now = format_timestamp(Utc::now());

        let mut tx =
            self.db.pool().begin().await.map_err(|e| {
                GatekeeperError::Database(format!("Failed to begin transaction: {}", e))
            })?;

        let user_exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ? AND deleted_at IS NULL)",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to check user: {}", e)))?;
        if user_exists == 0 {
            return Err(GatekeeperError::NotFound(format!(
                "user {} not found",
                user_id
            )));
        }

        let previous: BTreeSet<String> = sqlx::query_scalar(
            "SELECT r.name FROM user_roles ur JOIN roles r ON r.id = ur.role_id
             WHERE ur.user_id = ? AND (ur.expires_at IS NULL OR ur.expires_at > ?)",
        )
        .bind(user_id)
        .bind(&now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to get user roles: {}", e)))?
        .into_iter()
        .collect();
        check(&previous)?;

        let mut role_ids = BTreeSet::new();
        for &name in &requested {
            role_ids.insert(role_id_by_name(&mut tx, name).await?);
        }

        let current: Vec<i64> = sqlx::query_scalar("SELECT role_id FROM user_roles WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| GatekeeperError::Database(format!("Failed to get grants: {}", e)))?;

        for role_id in current.into_iter().filter(|id| !role_ids.contains(id)) {
            sqlx::query("DELETE FROM user_roles WHERE user_id = ? AND role_id = ?")
                .bind(user_id)
                .bind(role_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| GatekeeperError::Database(format!("Failed to revoke role: {}", e)))?;
        }

        for &role_id in &role_ids {
            sqlx::query(
                "INSERT INTO user_roles (user_id, role_id, granted_at, granted_by, expires_at)
                 VALUES (?, ?, ?, ?, NULL)
                 ON CONFLICT(user_id, role_id) DO UPDATE SET expires_at = NULL",
            )
            .bind(user_id)
            .bind(role_id)
            .bind(&now)
            .bind(granted_by)
            .execute(&mut *tx)
            .await
            .map_err(|e| GatekeeperError::Database(format!("Failed to grant role: {}", e)))?;
        }

        tx.commit().await.map_err(|e| {
            GatekeeperError::Database(format!("Failed to commit role change: {}", e))
        })?;

        tracing::info!(
            user_id,
            granted_by = ?granted_by,
            roles = ?requested,
            "User roles replaced"
        );
        Ok(previous)
    }

    /// Grant a single role, refreshing the grant metadata if already held.
    pub async fn grant_role(
        &self,
        user_id: i64,
        role_name: &str,
        granted_by: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.db.pool().acquire().await.map_err(|e| {
            GatekeeperError::Database(format!("Failed to acquire connection: {}", e))
        })?;
        grant_role_on(&mut conn, user_id, role_name, granted_by, expires_at).await
    }

    /// Every grant the user holds, including expired ones.
    pub async fn list_grants(&self, user_id: i64) -> Result<Vec<RoleGrant>> {
        let rows = sqlx::query(
            "SELECT ur.user_id, ur.role_id, r.name AS role_name, ur.granted_at,
                    ur.granted_by, ur.expires_at
             FROM user_roles ur
             JOIN roles r ON r.id = ur.role_id
             WHERE ur.user_id = ?
             ORDER BY r.name",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to list grants: {}", e)))?;

        rows.iter()
            .map(|row| {
                Ok(RoleGrant {
                    user_id: row.get("user_id"),
                    role_id: row.get("role_id"),
                    role_name: row.get("role_name"),
                    granted_at: parse_timestamp(row.get("granted_at"), "granted_at")?,
                    granted_by: row.get("granted_by"),
                    expires_at: parse_optional_timestamp(row.get("expires_at"), "expires_at")?,
                })
            })
            .collect()
    }
}

async fn role_id_by_name(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM roles WHERE name = ?")
        .bind(name)
        .fetch_optional(conn)
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to look up role: {}", e)))?;

    id.ok_or_else(|| GatekeeperError::Validation(format!("role not found: {}", name)))
}

/// Upsert one grant on an existing connection or transaction.
pub(crate) async fn grant_role_on(
    conn: &mut SqliteConnection,
    user_id: i64,
    role_name: &str,
    granted_by: Option<i64>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let role_id = role_id_by_name(conn, role_name).await?;

    sqlx::query(
        "INSERT INTO user_roles (user_id, role_id, granted_at, granted_by, expires_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(user_id, role_id) DO UPDATE SET
            granted_at = excluded.granted_at,
            granted_by = excluded.granted_by,
            expires_at = excluded.expires_at",
    )
    .bind(user_id)
    .bind(role_id)
    .bind(format_timestamp(Utc::now()))
    .bind(granted_by)
    .bind(expires_at.map(format_timestamp))
    .execute(conn)
    .await
    .map_err(|e| GatekeeperError::Database(format!("Failed to grant role: {}", e)))?;

    tracing::debug!(user_id, role = %role_name, "Role granted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{NewPermission, RoleCatalog};
    use crate::users::tests::new_user;
    use crate::users::UserStore;
    use chrono::Duration;

    struct Fixture {
        rbac: RBACService,
        catalog: RoleCatalog,
        users: UserStore,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().await.unwrap());
        Fixture {
            rbac: RBACService::new(db.clone()),
            catalog: RoleCatalog::new(db.clone()),
            users: UserStore::new(db),
        }
    }

    impl Fixture {
        async fn role_with(&self, role: &str, permissions: &[&str]) {
            let role = self.catalog.create_role(role, None).await.unwrap();
            for name in permissions {
                if self
                    .catalog
                    .list_permissions()
                    .await
                    .unwrap()
                    .iter()
                    .all(|p| p.name != *name)
                {
                    let (resource, action) = name.split_once('.').unwrap();
                    self.catalog
                        .create_permission(&NewPermission {
                            name: None,
                            resource: resource.to_string(),
                            action: action.to_string(),
                            description: None,
                        })
                        .await
                        .unwrap();
                }
            }
            let names: Vec<String> = permissions.iter().map(|s| s.to_string()).collect();
            self.catalog
                .set_role_permissions(role.id, &names)
                .await
                .unwrap();
        }

        async fn user(&self, email: &str) -> i64 {
            self.users.create_user(&new_user(email)).await.unwrap().id
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn set_roles_and_resolve() {
        let f = fixture().await;
        f.role_with("user", &["profile.read"]).await;
        f.role_with("premium", &["premium.access"]).await;
        let alice = f.user("alice@example.com").await;

        f.rbac
            .set_roles_for_user(alice, &strings(&["user", "premium"]), None)
            .await
            .unwrap();

        assert_eq!(
            f.rbac.get_roles_for_user(alice).await.unwrap(),
            set(&["premium", "user"])
        );
        assert!(f.rbac.has_permission(alice, "premium.access").await.unwrap());
        assert!(f.rbac.has_role(alice, "premium").await.unwrap());
        assert!(!f.rbac.has_role(alice, "admin").await.unwrap());
    }

    #[tokio::test]
    async fn role_replacement_is_idempotent() {
        let f = fixture().await;
        f.role_with("user", &[]).await;
        f.role_with("editor", &[]).await;
        let alice = f.user("alice@example.com").await;
        let roles = strings(&["user", "editor"]);

        f.rbac.set_roles_for_user(alice, &roles, None).await.unwrap();
        let first = f.rbac.get_roles_for_user(alice).await.unwrap();
        let first_grants = f.rbac.list_grants(alice).await.unwrap();

        f.rbac.set_roles_for_user(alice, &roles, None).await.unwrap();
        let second = f.rbac.get_roles_for_user(alice).await.unwrap();
        let second_grants = f.rbac.list_grants(alice).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first_grants.len(), second_grants.len());
        for (a, b) in first_grants.iter().zip(&second_grants) {
            assert_eq!(a.granted_at, b.granted_at);
        }
    }

    #[tokio::test]
    async fn permission_union_counts_shared_permission_once() {
        let f = fixture().await;
        f.role_with("r1", &["app.p1", "app.p2"]).await;
        f.role_with("r2", &["app.p2", "app.p3"]).await;
        let user = f.user("u@example.com").await;

        f.rbac
            .set_roles_for_user(user, &strings(&["r1", "r2"]), None)
            .await
            .unwrap();

        let permissions = f.rbac.get_permissions_for_user(user).await.unwrap();
        let names: Vec<&str> = permissions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["app.p1", "app.p2", "app.p3"]);
    }

    #[tokio::test]
    async fn unknown_role_aborts_without_change() {
        let f = fixture().await;
        f.role_with("user", &[]).await;
        let alice = f.user("alice@example.com").await;
        f.rbac
            .set_roles_for_user(alice, &strings(&["user"]), None)
            .await
            .unwrap();

        let result = f
            .rbac
            .set_roles_for_user(alice, &strings(&["user", "ghost"]), None)
            .await;
        match result {
            Err(GatekeeperError::Validation(msg)) => assert_eq!(msg, "role not found: ghost"),
            other => panic!("expected Validation, got {:?}", other),
        }

        assert_eq!(f.rbac.get_roles_for_user(alice).await.unwrap(), set(&["user"]));
    }

    #[tokio::test]
    async fn empty_role_list_clears_roles() {
        let f = fixture().await;
        f.role_with("user", &["profile.read"]).await;
        let alice = f.user("alice@example.com").await;
        f.rbac
            .set_roles_for_user(alice, &strings(&["user"]), None)
            .await
            .unwrap();

        f.rbac.set_roles_for_user(alice, &[], None).await.unwrap();

        assert!(f.rbac.get_roles_for_user(alice).await.unwrap().is_empty());
        assert!(!f.rbac.has_permission(alice, "profile.read").await.unwrap());
    }

    #[tokio::test]
    async fn rejected_replacement_check_leaves_roles_unchanged() {
        let f = fixture().await;
        f.role_with("user", &[]).await;
        f.role_with("editor", &[]).await;
        let alice = f.user("alice@example.com").await;
        f.rbac
            .set_roles_for_user(alice, &strings(&["user", "editor"]), None)
            .await
            .unwrap();

        let mut seen = BTreeSet::new();
        let result = f
            .rbac
            .replace_roles_checked(alice, &strings(&["user"]), None, |current| {
                seen = current.clone();
                Err(GatekeeperError::Validation("rejected".to_string()))
            })
            .await;

        assert!(matches!(result, Err(GatekeeperError::Validation(_))));
        assert_eq!(seen, set(&["editor", "user"]));
        assert_eq!(
            f.rbac.get_roles_for_user(alice).await.unwrap(),
            set(&["editor", "user"])
        );

        let previous = f
            .rbac
            .replace_roles_checked(alice, &strings(&["user"]), None, |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(previous, set(&["editor", "user"]));
        assert_eq!(f.rbac.get_roles_for_user(alice).await.unwrap(), set(&["user"]));
    }

    #[tokio::test]
    async fn set_roles_for_missing_user_is_not_found() {
        let f = fixture().await;
        f.role_with("user", &[]).await;
        assert!(matches!(
            f.rbac.set_roles_for_user(404, &strings(&["user"]), None).await,
            Err(GatekeeperError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn expired_grants_are_ignored() {
        let f = fixture().await;
        f.role_with("trial", &["premium.access"]).await;
        let alice = f.user("alice@example.com").await;

        f.rbac
            .grant_role(alice, "trial", None, Some(Utc::now() - Duration::minutes(1)))
            .await
            .unwrap();

        assert!(f.rbac.get_roles_for_user(alice).await.unwrap().is_empty());
        assert!(!f.rbac.has_permission(alice, "premium.access").await.unwrap());
        assert!(!f.rbac.has_role(alice, "trial").await.unwrap());
        assert!(f.rbac.get_permissions_for_user(alice).await.unwrap().is_empty());

        // The grant itself is still listed with its expiry
        let grants = f.rbac.list_grants(alice).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert!(grants[0].is_expired_at(Utc::now()));

        // Re-setting the role through replacement clears the expiry
        f.rbac
            .set_roles_for_user(alice, &strings(&["trial"]), None)
            .await
            .unwrap();
        assert!(f.rbac.has_permission(alice, "premium.access").await.unwrap());
    }

    #[tokio::test]
    async fn future_expiry_still_active() {
        let f = fixture().await;
        f.role_with("trial", &["premium.access"]).await;
        let alice = f.user("alice@example.com").await;

        f.rbac
            .grant_role(alice, "trial", None, Some(Utc::now() + Duration::days(7)))
            .await
            .unwrap();
        assert!(f.rbac.has_permission(alice, "premium.access").await.unwrap());
    }

    #[tokio::test]
    async fn grant_records_granter() {
        let f = fixture().await;
        f.role_with("user", &[]).await;
        let admin = f.user("admin@example.com").await;
        let alice = f.user("alice@example.com").await;

        f.rbac
            .set_roles_for_user(alice, &strings(&["user"]), Some(admin))
            .await
            .unwrap();

        let grants = f.rbac.list_grants(alice).await.unwrap();
        assert_eq!(grants[0].role_name, "user");
        assert_eq!(grants[0].granted_by, Some(admin));
        assert!(grants[0].expires_at.is_none());
    }

    #[tokio::test]
    async fn check_requirements() {
        let f = fixture().await;
        f.role_with("user", &["profile.read"]).await;
        f.role_with("editor", &["posts.write"]).await;
        f.role_with("admin", &["admin.access"]).await;
        let alice = f.user("alice@example.com").await;
        f.rbac
            .set_roles_for_user(alice, &strings(&["user", "editor"]), None)
            .await
            .unwrap();

        let ok = [
            AccessRequirement::AnyOf(strings(&["admin", "editor"])),
            AccessRequirement::AllOf(strings(&["user", "editor"])),
            AccessRequirement::Role("editor".to_string()),
            AccessRequirement::Permission("posts.write".to_string()),
        ];
        for requirement in &ok {
            assert!(f.rbac.check(alice, requirement).await.is_ok(), "{}", requirement);
        }

        let denied = [
            AccessRequirement::AnyOf(strings(&["admin"])),
            AccessRequirement::AllOf(strings(&["user", "admin"])),
            AccessRequirement::Role("admin".to_string()),
            AccessRequirement::Permission("admin.access".to_string()),
        ];
        for requirement in &denied {
            assert!(
                matches!(
                    f.rbac.check(alice, requirement).await,
                    Err(GatekeeperError::Forbidden(_))
                ),
                "{}",
                requirement
            );
        }
    }

    #[tokio::test]
    async fn deleted_user_loses_grants() {
        let f = fixture().await;
        f.role_with("user", &["profile.read"]).await;
        let alice = f.user("alice@example.com").await;
        f.rbac
            .set_roles_for_user(alice, &strings(&["user"]), None)
            .await
            .unwrap();

        f.users.soft_delete_user(alice).await.unwrap();

        assert!(!f.rbac.is_active_user(alice).await.unwrap());
        assert!(f.rbac.get_roles_for_user(alice).await.unwrap().is_empty());
        assert!(f.rbac.list_grants(alice).await.unwrap().is_empty());
    }

    #[test]
    fn empty_any_of_is_never_satisfied() {
        let roles = set(&["user"]);
        assert!(!AccessRequirement::AnyOf(vec![]).is_satisfied_by(&roles, &BTreeSet::new()));
        assert!(AccessRequirement::AllOf(vec![]).is_satisfied_by(&roles, &BTreeSet::new()));
    }
}


// ========== Axum Integration ==========

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};

use crate::token::TokenIssuer;
use crate::web::api_error;

/// Extract the bearer token from the Authorization header.
fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

impl<P, S> FromRequestParts<S> for Authenticated<P>
where
    P: AccessPolicy,
    S: Send + Sync,
    Arc<Database>: FromRef<S>,
    Arc<TokenIssuer>: FromRef<S>,
    Arc<RBACService>: FromRef<S>,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        extract_authenticated::<P, S>(parts, state)
            .await
            .map_err(|e| api_error(e).into_response())
    }
}

/// Verify the token, confirm the account is live and evaluate the policy.
async fn extract_authenticated<P, S>(parts: &Parts, state: &S) -> Result<Authenticated<P>>
where
    P: AccessPolicy,
    S: Send + Sync,
    Arc<Database>: FromRef<S>,
    Arc<TokenIssuer>: FromRef<S>,
    Arc<RBACService>: FromRef<S>,
{
    let token = bearer_token(parts)
        .ok_or_else(|| GatekeeperError::Unauthorized("missing bearer token".to_string()))?;

    let issuer = <Arc<TokenIssuer> as FromRef<S>>::from_ref(state);
    let identity = issuer.verify(token)?;

    let rbac = <Arc<RBACService> as FromRef<S>>::from_ref(state);
    if !rbac.is_active_user(identity.user_id).await? {
        return Err(GatekeeperError::Unauthorized(
            "invalid or expired token".to_string(),
        ));
    }

    if let Some(requirement) = P::requirement() {
        if let Err(denied) = rbac.check(identity.user_id, &requirement).await {
            let db = <Arc<Database> as FromRef<S>>::from_ref(state);
            let details = format!(
                "Access to {} {} requires {}",
                parts.method,
                parts.uri.path(),
                requirement
            );
            if let Err(e) = db
                .create_audit_log(Some(identity.user_id), "permission_denied", Some(&details))
                .await
            {
                tracing::error!(error = %e, "Failed to record permission denial");
            }

            tracing::warn!(
                user_id = identity.user_id,
                required = %requirement,
                path = %parts.uri.path(),
                "Permission denied"
            );
            return Err(denied);
        }
    }

    Ok(Authenticated::new(identity.user_id, identity.email))
}
