//! Role and permission catalog.
//!
//! Persists roles, permissions and the role <-> permission link table. Inputs
//! are expected to be validated by the caller; this layer enforces uniqueness
//! and referential integrity only.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{format_timestamp, parse_timestamp, Database};
use crate::error::{GatekeeperError, Result};
use crate::models::{Permission, PermissionUpdate, Role, RoleSummary, RoleUpdate};

/// Fields for a new permission. `name` defaults to `resource.action`.
#[derive(Debug, Clone)]
pub struct NewPermission {
    pub name: Option<String>,
    pub resource: String,
    pub action: String,
    pub description: Option<String>,
}

impl NewPermission {
    pub fn effective_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.resource, self.action))
    }
}

pub struct RoleCatalog {
    db: Arc<Database>,
}

impl RoleCatalog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ========== Roles ==========

    pub async fn create_role(&self, name: &str, description: Option<&str>) -> Result<Role> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "INSERT INTO roles (name, description, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            GatekeeperError::from_sqlx(e, "Failed to create role", || {
                format!("role '{}' already exists", name)
            })
        })?;

        tracing::info!(role = %name, "Role created");
        self.get_role(result.last_insert_rowid()).await
    }

    pub async fn get_role(&self, id: i64) -> Result<Role> {
        let row = sqlx::query(
            "SELECT id, name, description, created_at, updated_at FROM roles WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to get role: {}", e)))?;

        match row {
            Some(row) => role_from_row(&row),
            None => Err(GatekeeperError::NotFound(format!("role {} not found", id))),
        }
    }

    pub async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query(
            "SELECT id, name, description, created_at, updated_at FROM roles WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to find role: {}", e)))?;

        row.as_ref().map(role_from_row).transpose()
    }

    /// List all roles with their permission and holder counts.
    pub async fn list_roles(&self) -> Result<Vec<RoleSummary>> {
        let rows = sqlx::query(
            "SELECT r.id, r.name, r.description, r.created_at, r.updated_at,
                    (SELECT COUNT(*) FROM role_permissions rp WHERE rp.role_id = r.id)
                        AS permission_count,
                    (SELECT COUNT(*) FROM user_roles ur
                        JOIN users u ON u.id = ur.user_id AND u.deleted_at IS NULL
                        WHERE ur.role_id = r.id) AS user_count
             FROM roles r
             ORDER BY r.name",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to list roles: {}", e)))?;

        rows.iter()
            .map(|row| {
                Ok(RoleSummary {
                    role: role_from_row(row)?,
                    permission_count: row.get("permission_count"),
                    user_count: row.get("user_count"),
                })
            })
            .collect()
    }

    pub async fn update_role(&self, id: i64, updates: &[RoleUpdate]) -> Result<Role> {
        let mut role = self.get_role(id).await?;
        for update in updates {
            match update {
                RoleUpdate::Name(name) => role.name = name.clone(),
                RoleUpdate::Description(description) => role.description = description.clone(),
            }
        }

        let name = role.name.clone();
        sqlx::query("UPDATE roles SET name = ?, description = ?, updated_at = ? WHERE id = ?")
            .bind(&role.name)
            .bind(&role.description)
            .bind(format_timestamp(Utc::now()))
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| {
                GatekeeperError::from_sqlx(e, "Failed to update role", || {
                    format!("role '{}' already exists", name)
                })
            })?;

        self.get_role(id).await
    }

    /// Delete a role. Grants and permission links cascade.
    pub async fn delete_role(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM roles WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| GatekeeperError::Database(format!("Failed to delete role: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(GatekeeperError::NotFound(format!("role {} not found", id)));
        }

        tracing::info!(role_id = id, "Role deleted");
        Ok(())
    }

    // ========== Permissions ==========

    pub async fn create_permission(&self, new: &NewPermission) -> Result<Permission> {
        let name = new.effective_name();
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "INSERT INTO permissions (name, resource, action, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(&new.resource)
        .bind(&new.action)
        .bind(&new.description)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            GatekeeperError::from_sqlx(e, "Failed to create permission", || {
                format!("permission '{}' already exists", name)
            })
        })?;

        tracing::info!(permission = %name, "Permission created");
        self.get_permission(result.last_insert_rowid()).await
    }

    pub async fn get_permission(&self, id: i64) -> Result<Permission> {
        let row = sqlx::query(
            "SELECT id, name, resource, action, description FROM permissions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to get permission: {}", e)))?;

        match row {
            Some(row) => Ok(permission_from_row(&row)),
            None => Err(GatekeeperError::NotFound(format!(
                "permission {} not found",
                id
            ))),
        }
    }

    pub async fn list_permissions(&self) -> Result<Vec<Permission>> {
        let rows = sqlx::query(
            "SELECT id, name, resource, action, description FROM permissions ORDER BY name",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to list permissions: {}", e)))?;

        Ok(rows.iter().map(permission_from_row).collect())
    }

    pub async fn update_permission(
        &self,
        id: i64,
        updates: &[PermissionUpdate],
    ) -> Result<Permission> {
        let mut permission = self.get_permission(id).await?;
        for update in updates {
            match update {
                PermissionUpdate::Name(name) => permission.name = name.clone(),
                PermissionUpdate::Resource(resource) => permission.resource = resource.clone(),
                PermissionUpdate::Action(action) => permission.action = action.clone(),
                PermissionUpdate::Description(d) => permission.description = d.clone(),
            }
        }

        let name = permission.name.clone();
        sqlx::query(
            "UPDATE permissions SET name = ?, resource = ?, action = ?, description = ?,
                    updated_at = ?
             WHERE id = ?",
        )
        .bind(&permission.name)
        .bind(&permission.resource)
        .bind(&permission.action)
        .bind(&permission.description)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            GatekeeperError::from_sqlx(e, "Failed to update permission", || {
                format!("permission '{}' already exists", name)
            })
        })?;

        self.get_permission(id).await
    }

    /// Delete a permission. Its links to every role cascade.
    pub async fn delete_permission(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM permissions WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| {
                GatekeeperError::Database(format!("Failed to delete permission: {}", e))
            })?;

        if result.rows_affected() == 0 {
            return Err(GatekeeperError::NotFound(format!(
                "permission {} not found",
                id
            )));
        }

        tracing::info!(permission_id = id, "Permission deleted");
        Ok(())
    }

    // ========== Role <-> Permission links ==========

    pub async fn get_role_permissions(&self, role_id: i64) -> Result<Vec<Permission>> {
        self.get_role(role_id).await?;

        let rows = sqlx::query(
            "SELECT p.id, p.name, p.resource, p.action, p.description
             FROM permissions p
             JOIN role_permissions rp ON rp.permission_id = p.id
             WHERE rp.role_id = ?
             ORDER BY p.name",
        )
        .bind(role_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| {
            GatekeeperError::Database(format!("Failed to get role permissions: {}", e))
        })?;

        Ok(rows.iter().map(permission_from_row).collect())
    }

    /// Replace the full permission set of a role in one transaction.
    ///
    /// An unknown permission name aborts with no change.
    pub async fn set_role_permissions(&self, role_id: i64, names: &[String]) -> Result<()> {
        let names: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let now = format_timestamp(Utc::now());

        let mut tx =
            self.db.pool().begin().await.map_err(|e| {
                GatekeeperError::Database(format!("Failed to begin transaction: {}", e))
            })?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM roles WHERE id = ?")
            .bind(role_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| GatekeeperError::Database(format!("Failed to get role: {}", e)))?;
        if exists.is_none() {
            return Err(GatekeeperError::NotFound(format!(
                "role {} not found",
                role_id
            )));
        }

        let mut permission_ids = Vec::with_capacity(names.len());
        for &name in &names {
            let id: Option<i64> = sqlx::query_scalar("SELECT id FROM permissions WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    GatekeeperError::Database(format!("Failed to look up permission: {}", e))
                })?;
            match id {
                Some(id) => permission_ids.push(id),
                None => {
                    return Err(GatekeeperError::Validation(format!(
                        "permission not found: {}",
                        name
                    )))
                }
            }
        }

        sqlx::query("DELETE FROM role_permissions WHERE role_id = ?")
            .bind(role_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                GatekeeperError::Database(format!("Failed to clear role permissions: {}", e))
            })?;

        for permission_id in permission_ids {
            sqlx::query(
                "INSERT INTO role_permissions (role_id, permission_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(role_id)
            .bind(permission_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                GatekeeperError::Database(format!("Failed to link permission: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            GatekeeperError::Database(format!("Failed to commit role permissions: {}", e))
        })?;

        tracing::info!(role_id, count = names.len(), "Role permissions replaced");
        Ok(())
    }
}

fn role_from_row(row: &SqliteRow) -> Result<Role> {
    Ok(Role {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: parse_timestamp(row.get("created_at"), "created_at")?,
        updated_at: parse_timestamp(row.get("updated_at"), "updated_at")?,
    })
}

pub(crate) fn permission_from_row(row: &SqliteRow) -> Permission {
    Permission {
        id: row.get("id"),
        name: row.get("name"),
        resource: row.get("resource"),
        action: row.get("action"),
        description: row.get("description"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog() -> RoleCatalog {
        RoleCatalog::new(Arc::new(Database::in_memory().await.unwrap()))
    }

    fn perm(resource: &str, action: &str) -> NewPermission {
        NewPermission {
            name: None,
            resource: resource.to_string(),
            action: action.to_string(),
            description: None,
        }
    }

    fn names(permissions: &[Permission]) -> Vec<&str> {
        permissions.iter().map(|p| p.name.as_str()).collect()
    }

    #[tokio::test]
    async fn create_and_find_role() {
        let catalog = catalog().await;
        let role = catalog
            .create_role("moderator", Some("Moderates content"))
            .await
            .unwrap();

        assert_eq!(catalog.get_role(role.id).await.unwrap(), role);
        assert_eq!(
            catalog.find_role_by_name("moderator").await.unwrap(),
            Some(role)
        );
        assert!(catalog.find_role_by_name("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_role_is_conflict() {
        let catalog = catalog().await;
        catalog.create_role("moderator", None).await.unwrap();
        assert!(matches!(
            catalog.create_role("moderator", None).await,
            Err(GatekeeperError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn permission_name_defaults_to_resource_action() {
        let catalog = catalog().await;
        let p = catalog.create_permission(&perm("premium", "access")).await.unwrap();
        assert_eq!(p.name, "premium.access");
        assert_eq!(p.resource, "premium");
        assert_eq!(p.action, "access");

        assert!(matches!(
            catalog.create_permission(&perm("premium", "access")).await,
            Err(GatekeeperError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn set_role_permissions_replaces_set() {
        let catalog = catalog().await;
        let role = catalog.create_role("editor", None).await.unwrap();
        for (r, a) in [("posts", "read"), ("posts", "write"), ("posts", "delete")] {
            catalog.create_permission(&perm(r, a)).await.unwrap();
        }

        catalog
            .set_role_permissions(role.id, &["posts.read".to_string(), "posts.write".to_string()])
            .await
            .unwrap();
        let perms = catalog.get_role_permissions(role.id).await.unwrap();
        assert_eq!(names(&perms), vec!["posts.read", "posts.write"]);

        catalog
            .set_role_permissions(role.id, &["posts.delete".to_string()])
            .await
            .unwrap();
        let perms = catalog.get_role_permissions(role.id).await.unwrap();
        assert_eq!(names(&perms), vec!["posts.delete"]);
    }

    #[tokio::test]
    async fn unknown_permission_aborts_without_change() {
        let catalog = catalog().await;
        let role = catalog.create_role("editor", None).await.unwrap();
        catalog.create_permission(&perm("posts", "read")).await.unwrap();
        catalog
            .set_role_permissions(role.id, &["posts.read".to_string()])
            .await
            .unwrap();

        let result = catalog
            .set_role_permissions(
                role.id,
                &["posts.write".to_string(), "posts.read".to_string()],
            )
            .await;
        match result {
            Err(GatekeeperError::Validation(msg)) => {
                assert_eq!(msg, "permission not found: posts.write")
            }
            other => panic!("expected Validation, got {:?}", other),
        }

        let perms = catalog.get_role_permissions(role.id).await.unwrap();
        assert_eq!(names(&perms), vec!["posts.read"]);
    }

    #[tokio::test]
    async fn duplicate_names_in_request_are_collapsed() {
        let catalog = catalog().await;
        let role = catalog.create_role("editor", None).await.unwrap();
        catalog.create_permission(&perm("posts", "read")).await.unwrap();

        catalog
            .set_role_permissions(role.id, &["posts.read".to_string(), "posts.read".to_string()])
            .await
            .unwrap();
        assert_eq!(catalog.get_role_permissions(role.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_permission_removes_role_links() {
        let catalog = catalog().await;
        let r1 = catalog.create_role("editor", None).await.unwrap();
        let r2 = catalog.create_role("reviewer", None).await.unwrap();
        let p = catalog.create_permission(&perm("posts", "read")).await.unwrap();
        catalog.create_permission(&perm("posts", "write")).await.unwrap();

        catalog
            .set_role_permissions(r1.id, &["posts.read".to_string(), "posts.write".to_string()])
            .await
            .unwrap();
        catalog
            .set_role_permissions(r2.id, &["posts.read".to_string()])
            .await
            .unwrap();

        catalog.delete_permission(p.id).await.unwrap();

        let r1_perms = catalog.get_role_permissions(r1.id).await.unwrap();
        assert_eq!(names(&r1_perms), vec!["posts.write"]);
        assert!(catalog.get_role_permissions(r2.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_role_keeps_links() {
        let catalog = catalog().await;
        let role = catalog.create_role("editor", None).await.unwrap();
        catalog.create_permission(&perm("posts", "read")).await.unwrap();
        catalog
            .set_role_permissions(role.id, &["posts.read".to_string()])
            .await
            .unwrap();

        let renamed = catalog
            .update_role(role.id, &[RoleUpdate::Name("writer".to_string())])
            .await
            .unwrap();
        assert_eq!(renamed.name, "writer");
        assert_eq!(catalog.get_role_permissions(role.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_roles_counts_permissions() {
        let catalog = catalog().await;
        let role = catalog.create_role("editor", None).await.unwrap();
        catalog.create_role("viewer", None).await.unwrap();
        catalog.create_permission(&perm("posts", "read")).await.unwrap();
        catalog
            .set_role_permissions(role.id, &["posts.read".to_string()])
            .await
            .unwrap();

        let roles = catalog.list_roles().await.unwrap();
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[0].role.name, "editor");
        assert_eq!(roles[0].permission_count, 1);
        assert_eq!(roles[1].permission_count, 0);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let catalog = catalog().await;
        assert!(matches!(
            catalog.delete_role(42).await,
            Err(GatekeeperError::NotFound(_))
        ));
        assert!(matches!(
            catalog.delete_permission(42).await,
            Err(GatekeeperError::NotFound(_))
        ));
    }
}
