//! Administrative operations.
//!
//! Every mutation validates its input, runs the guard policy before any
//! write, performs the change and records an audit log entry naming the
//! acting user.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::auth::load_profile;
use crate::catalog::{NewPermission, RoleCatalog};
use crate::database::{AuditLogEntry, Database};
use crate::error::Result;
use crate::guard::GuardPolicy;
use crate::models::{
    EmailTemplate, Page, Pagination, Permission, PermissionUpdate, Role, RoleGrant, RoleSummary,
    RoleUpdate, TemplateUpdate, User, UserProfile, UserUpdate,
};
use crate::rbac::RBACService;
use crate::template_store::{NewEmailTemplate, TemplateStore};
use crate::users::UserStore;
use crate::validation::Validator;

pub struct AdminService {
    db: Arc<Database>,
    users: Arc<UserStore>,
    catalog: Arc<RoleCatalog>,
    rbac: Arc<RBACService>,
    templates: Arc<TemplateStore>,
    validator: Arc<Validator>,
    guard: GuardPolicy,
}

impl AdminService {
    pub fn new(
        db: Arc<Database>,
        users: Arc<UserStore>,
        catalog: Arc<RoleCatalog>,
        rbac: Arc<RBACService>,
        templates: Arc<TemplateStore>,
        validator: Arc<Validator>,
    ) -> Self {
        Self {
            db,
            users,
            catalog,
            rbac,
            templates,
            validator,
            guard: GuardPolicy,
        }
    }

    async fn audit(&self, actor_id: i64, action: &str, details: serde_json::Value) {
        let details = details.to_string();
        if let Err(e) = self
            .db
            .create_audit_log(Some(actor_id), action, Some(&details))
            .await
        {
            tracing::error!(error = %e, action, actor_id, "Failed to write audit log");
        }
    }

    // ========== Users ==========

    pub async fn list_users(
        &self,
        pagination: Pagination,
        search: Option<&str>,
    ) -> Result<Page<User>> {
        self.users.list_users(pagination, search).await
    }

    pub async fn get_user(&self, user_id: i64) -> Result<UserProfile> {
        load_profile(&self.users, &self.rbac, user_id).await
    }

    pub async fn update_user(
        &self,
        actor_id: i64,
        user_id: i64,
        updates: Vec<UserUpdate>,
    ) -> Result<User> {
        let updates = self.validator.user_updates(updates)?;
        let user = self.users.update_user(user_id, &updates).await?;

        self.audit(
            actor_id,
            "user.update",
            json!({ "user_id": user_id, "updates": updates }),
        )
        .await;
        Ok(user)
    }

    pub async fn delete_user(&self, actor_id: i64, user_id: i64) -> Result<()> {
        self.guard.check_user_deletion(actor_id, user_id)?;
        self.users.soft_delete_user(user_id).await?;

        self.audit(actor_id, "user.delete", json!({ "user_id": user_id }))
            .await;
        Ok(())
    }

    pub async fn get_user_roles(&self, user_id: i64) -> Result<Vec<RoleGrant>> {
        self.users.get_user(user_id).await?;
        self.rbac.list_grants(user_id).await
    }

    /// Replace all roles of a user.
    pub async fn set_user_roles(
        &self,
        actor_id: i64,
        user_id: i64,
        role_names: Vec<String>,
    ) -> Result<()> {
        let guard = &self.guard;
        let previous = self
            .rbac
            .replace_roles_checked(user_id, &role_names, Some(actor_id), |current| {
                guard.check_role_replacement(actor_id, user_id, current, &role_names)
            })
            .await?;

        self.audit(
            actor_id,
            "user.roles.set",
            json!({ "user_id": user_id, "previous": previous, "roles": role_names }),
        )
        .await;
        Ok(())
    }

    /// Grant one role, optionally until `expires_at`. Granting a role the user
    /// already holds refreshes its metadata and expiry.
    pub async fn grant_user_role(
        &self,
        actor_id: i64,
        user_id: i64,
        role_name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<RoleGrant>> {
        self.users.get_user(user_id).await?;
        self.guard
            .check_role_grant(actor_id, user_id, role_name, expires_at, Utc::now())?;

        self.rbac
            .grant_role(user_id, role_name, Some(actor_id), expires_at)
            .await?;

        self.audit(
            actor_id,
            "user.roles.grant",
            json!({ "user_id": user_id, "role": role_name, "expires_at": expires_at }),
        )
        .await;
        self.rbac.list_grants(user_id).await
    }

    // ========== Roles ==========

    pub async fn list_roles(&self) -> Result<Vec<RoleSummary>> {
        self.catalog.list_roles().await
    }

    pub async fn get_role(&self, role_id: i64) -> Result<Role> {
        self.catalog.get_role(role_id).await
    }

    pub async fn create_role(
        &self,
        actor_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<Role> {
        let name = self.validator.role_name(name)?;
        let description = self.validator.description(description)?;
        let role = self
            .catalog
            .create_role(&name, description.as_deref())
            .await?;

        self.audit(
            actor_id,
            "role.create",
            json!({ "role_id": role.id, "name": role.name }),
        )
        .await;
        Ok(role)
    }

    pub async fn update_role(
        &self,
        actor_id: i64,
        role_id: i64,
        updates: Vec<RoleUpdate>,
    ) -> Result<Role> {
        let updates = self.validator.role_updates(updates)?;
        let role = self.catalog.get_role(role_id).await?;
        self.guard.check_role_update(&role.name, &updates)?;

        let updated = self.catalog.update_role(role_id, &updates).await?;

        self.audit(
            actor_id,
            "role.update",
            json!({ "role_id": role_id, "updates": updates }),
        )
        .await;
        Ok(updated)
    }

    pub async fn delete_role(&self, actor_id: i64, role_id: i64) -> Result<()> {
        let role = self.catalog.get_role(role_id).await?;
        self.guard.check_role_deletion(&role.name)?;

        self.catalog.delete_role(role_id).await?;

        self.audit(
            actor_id,
            "role.delete",
            json!({ "role_id": role_id, "name": role.name }),
        )
        .await;
        Ok(())
    }

    pub async fn get_role_permissions(&self, role_id: i64) -> Result<Vec<Permission>> {
        self.catalog.get_role_permissions(role_id).await
    }

    pub async fn set_role_permissions(
        &self,
        actor_id: i64,
        role_id: i64,
        permission_names: Vec<String>,
    ) -> Result<()> {
        let role = self.catalog.get_role(role_id).await?;
        self.guard
            .check_role_permissions(&role.name, &permission_names)?;

        self.catalog
            .set_role_permissions(role_id, &permission_names)
            .await?;

        self.audit(
            actor_id,
            "role.permissions.set",
            json!({ "role_id": role_id, "permissions": permission_names }),
        )
        .await;
        Ok(())
    }

    // ========== Permissions ==========

    pub async fn list_permissions(&self) -> Result<Vec<Permission>> {
        self.catalog.list_permissions().await
    }

    pub async fn create_permission(&self, actor_id: i64, new: NewPermission) -> Result<Permission> {
        let new = NewPermission {
            name: new
                .name
                .as_deref()
                .map(|n| self.validator.permission_name(n))
                .transpose()?,
            resource: self.validator.permission_part("resource", &new.resource)?,
            action: self.validator.permission_part("action", &new.action)?,
            description: self.validator.description(new.description.as_deref())?,
        };
        let permission = self.catalog.create_permission(&new).await?;

        self.audit(
            actor_id,
            "permission.create",
            json!({ "permission_id": permission.id, "name": permission.name }),
        )
        .await;
        Ok(permission)
    }

    pub async fn update_permission(
        &self,
        actor_id: i64,
        permission_id: i64,
        updates: Vec<PermissionUpdate>,
    ) -> Result<Permission> {
        let updates = self.validator.permission_updates(updates)?;
        let permission = self.catalog.get_permission(permission_id).await?;
        self.guard
            .check_permission_update(&permission.name, &updates)?;

        let updated = self
            .catalog
            .update_permission(permission_id, &updates)
            .await?;

        self.audit(
            actor_id,
            "permission.update",
            json!({ "permission_id": permission_id, "updates": updates }),
        )
        .await;
        Ok(updated)
    }

    pub async fn delete_permission(&self, actor_id: i64, permission_id: i64) -> Result<()> {
        let permission = self.catalog.get_permission(permission_id).await?;
        self.guard.check_permission_deletion(&permission.name)?;

        self.catalog.delete_permission(permission_id).await?;

        self.audit(
            actor_id,
            "permission.delete",
            json!({ "permission_id": permission_id, "name": permission.name }),
        )
        .await;
        Ok(())
    }

    // ========== Email templates ==========

    pub async fn create_template(
        &self,
        actor_id: i64,
        new: NewEmailTemplate,
    ) -> Result<EmailTemplate> {
        let template = self.templates.create(new).await?;

        self.audit(
            actor_id,
            "template.create",
            json!({ "template_id": template.id, "name": template.name }),
        )
        .await;
        Ok(template)
    }

    pub async fn update_template(
        &self,
        actor_id: i64,
        template_id: i64,
        updates: Vec<TemplateUpdate>,
    ) -> Result<EmailTemplate> {
        let fields: Vec<&'static str> = updates
            .iter()
            .map(|u| match u {
                TemplateUpdate::Subject(_) => "subject",
                TemplateUpdate::HtmlContent(_) => "html_content",
                TemplateUpdate::TextContent(_) => "text_content",
                TemplateUpdate::Variables(_) => "variables",
            })
            .collect();
        let template = self.templates.update(template_id, updates).await?;

        self.audit(
            actor_id,
            "template.update",
            json!({ "template_id": template_id, "fields": fields }),
        )
        .await;
        Ok(template)
    }

    pub async fn delete_template(&self, actor_id: i64, template_id: i64) -> Result<()> {
        self.templates.soft_delete(template_id).await?;

        self.audit(
            actor_id,
            "template.delete",
            json!({ "template_id": template_id }),
        )
        .await;
        Ok(())
    }

    // ========== Audit log ==========

    pub async fn audit_log(&self, pagination: Pagination) -> Result<Page<AuditLogEntry>> {
        let total = self.db.count_audit_logs().await?;
        let entries = self
            .db
            .get_audit_logs(pagination.per_page, pagination.offset())
            .await?;
        Ok(Page::new(entries, total, pagination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatekeeperError;
    use crate::seed::seed_catalog;
    use crate::users::tests::new_user;

    struct Fixture {
        admin: AdminService,
        users: Arc<UserStore>,
        catalog: Arc<RoleCatalog>,
        rbac: Arc<RBACService>,
        root: i64,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let validator = Arc::new(Validator::new().unwrap());
        let users = Arc::new(UserStore::new(db.clone()));
        let catalog = Arc::new(RoleCatalog::new(db.clone()));
        let rbac = Arc::new(RBACService::new(db.clone()));
        let templates = Arc::new(TemplateStore::new(db.clone(), validator.clone()));
        seed_catalog(&catalog).await.unwrap();

        let root = users.create_user(&new_user("root@example.com")).await.unwrap().id;
        rbac.set_roles_for_user(root, &["admin".to_string(), "user".to_string()], None)
            .await
            .unwrap();

        Fixture {
            admin: AdminService::new(
                db,
                users.clone(),
                catalog.clone(),
                rbac.clone(),
                templates,
                validator,
            ),
            users,
            catalog,
            rbac,
            root,
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn assert_validation<T: std::fmt::Debug>(result: Result<T>, expected: &str) {
        match result {
            Err(GatekeeperError::Validation(msg)) => assert_eq!(msg, expected),
            other => panic!("expected Validation({}), got {:?}", expected, other),
        }
    }

    #[tokio::test]
    async fn self_demotion_rejected_other_admin_allowed() {
        let f = fixture().await;
        let second = f
            .users
            .create_user(&new_user("second@example.com"))
            .await
            .unwrap()
            .id;
        f.rbac
            .set_roles_for_user(second, &strings(&["admin", "user"]), None)
            .await
            .unwrap();

        assert_validation(
            f.admin
                .set_user_roles(f.root, f.root, strings(&["user"]))
                .await,
            "cannot remove admin role from yourself",
        );
        assert!(f.rbac.has_role(f.root, "admin").await.unwrap());

        f.admin
            .set_user_roles(second, f.root, strings(&["user"]))
            .await
            .unwrap();
        assert!(!f.rbac.has_role(f.root, "admin").await.unwrap());
    }

    #[tokio::test]
    async fn self_deletion_rejected() {
        let f = fixture().await;
        assert_validation(
            f.admin.delete_user(f.root, f.root).await,
            "cannot delete your own account",
        );
        assert!(f.users.get_user(f.root).await.is_ok());
    }

    #[tokio::test]
    async fn delete_user_cascades_grants() {
        let f = fixture().await;
        let alice = f
            .users
            .create_user(&new_user("alice@example.com"))
            .await
            .unwrap()
            .id;
        f.rbac
            .set_roles_for_user(alice, &strings(&["user"]), None)
            .await
            .unwrap();

        f.admin.delete_user(f.root, alice).await.unwrap();
        assert!(f.rbac.list_grants(alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn system_roles_undeletable_custom_deletable() {
        let f = fixture().await;
        for name in ["admin", "user"] {
            let role = f.catalog.find_role_by_name(name).await.unwrap().unwrap();
            assert!(matches!(
                f.admin.delete_role(f.root, role.id).await,
                Err(GatekeeperError::Validation(_))
            ));
        }

        let moderator = f
            .admin
            .create_role(f.root, "moderator", Some("Moderates content"))
            .await
            .unwrap();
        f.admin.delete_role(f.root, moderator.id).await.unwrap();
        assert!(f.catalog.find_role_by_name("moderator").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn system_role_rename_rejected() {
        let f = fixture().await;
        let admin = f.catalog.find_role_by_name("admin").await.unwrap().unwrap();
        assert!(matches!(
            f.admin
                .update_role(f.root, admin.id, vec![RoleUpdate::Name("root".to_string())])
                .await,
            Err(GatekeeperError::Validation(_))
        ));

        let described = f
            .admin
            .update_role(
                f.root,
                admin.id,
                vec![RoleUpdate::Description(Some("Superusers".to_string()))],
            )
            .await
            .unwrap();
        assert_eq!(described.description.as_deref(), Some("Superusers"));
    }

    #[tokio::test]
    async fn critical_permission_cannot_be_removed_from_admin() {
        let f = fixture().await;
        let admin = f.catalog.find_role_by_name("admin").await.unwrap().unwrap();

        let result = f
            .admin
            .set_role_permissions(f.root, admin.id, strings(&["users.read"]))
            .await;
        assert!(matches!(result, Err(GatekeeperError::Validation(_))));
        assert!(f.rbac.has_permission(f.root, "admin.access").await.unwrap());

        f.admin
            .set_role_permissions(f.root, admin.id, strings(&["admin.access", "users.read"]))
            .await
            .unwrap();
        assert_eq!(
            f.admin.get_role_permissions(admin.id).await.unwrap().len(),
            2
        );

        let critical = f
            .admin
            .list_permissions()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.name == "admin.access")
            .unwrap();
        assert!(matches!(
            f.admin.delete_permission(f.root, critical.id).await,
            Err(GatekeeperError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn permission_delete_cascades_through_roles() {
        let f = fixture().await;
        let premium = f
            .admin
            .create_permission(
                f.root,
                NewPermission {
                    name: None,
                    resource: "premium".to_string(),
                    action: "access".to_string(),
                    description: None,
                },
            )
            .await
            .unwrap();
        let role = f.admin.create_role(f.root, "premium", None).await.unwrap();
        f.admin
            .set_role_permissions(f.root, role.id, strings(&["premium.access"]))
            .await
            .unwrap();

        f.admin.delete_permission(f.root, premium.id).await.unwrap();
        assert!(f.admin.get_role_permissions(role.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_input_rejected_before_write() {
        let f = fixture().await;
        assert!(matches!(
            f.admin.create_role(f.root, "Bad Name", None).await,
            Err(GatekeeperError::Validation(_))
        ));
        assert!(matches!(
            f.admin
                .update_user(f.root, f.root, vec![UserUpdate::Email("nope".to_string())])
                .await,
            Err(GatekeeperError::Validation(_))
        ));
        assert_eq!(f.catalog.list_roles().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mutations_are_audited() {
        let f = fixture().await;
        let role = f.admin.create_role(f.root, "support", None).await.unwrap();
        f.admin.delete_role(f.root, role.id).await.unwrap();

        let log = f.admin.audit_log(Pagination::default()).await.unwrap();
        assert_eq!(log.total, 2);
        assert_eq!(log.items[0].action, "role.delete");
        assert_eq!(log.items[1].action, "role.create");
        assert_eq!(log.items[0].actor_id, Some(f.root));
    }

    #[tokio::test]
    async fn failed_guard_writes_no_audit_entry() {
        let f = fixture().await;
        let _ = f.admin.delete_user(f.root, f.root).await;

        let log = f.admin.audit_log(Pagination::default()).await.unwrap();
        assert_eq!(log.total, 0);
    }

    #[tokio::test]
    async fn timed_grant_recorded_and_audited() {
        let f = fixture().await;
        let alice = f
            .users
            .create_user(&new_user("alice@example.com"))
            .await
            .unwrap()
            .id;
        let expires = Utc::now() + chrono::Duration::hours(2);

        let grants = f
            .admin
            .grant_user_role(f.root, alice, "admin", Some(expires))
            .await
            .unwrap();
        let grant = grants.iter().find(|g| g.role_name == "admin").unwrap();
        assert_eq!(
            grant.expires_at.map(|e| e.timestamp()),
            Some(expires.timestamp())
        );
        assert_eq!(grant.granted_by, Some(f.root));
        assert!(f.rbac.has_role(alice, "admin").await.unwrap());

        let log = f.admin.audit_log(Pagination::default()).await.unwrap();
        assert_eq!(log.items[0].action, "user.roles.grant");
    }

    #[tokio::test]
    async fn invalid_timed_grants_rejected() {
        let f = fixture().await;
        let alice = f
            .users
            .create_user(&new_user("alice@example.com"))
            .await
            .unwrap()
            .id;

        assert_validation(
            f.admin
                .grant_user_role(
                    f.root,
                    alice,
                    "user",
                    Some(Utc::now() - chrono::Duration::minutes(1)),
                )
                .await,
            "expires_at must be in the future",
        );
        assert_validation(
            f.admin
                .grant_user_role(
                    f.root,
                    f.root,
                    "admin",
                    Some(Utc::now() + chrono::Duration::days(1)),
                )
                .await,
            "cannot set an expiry on your own admin role",
        );
        assert!(matches!(
            f.admin.grant_user_role(f.root, 9999, "user", None).await,
            Err(GatekeeperError::NotFound(_))
        ));

        assert!(f.rbac.get_roles_for_user(alice).await.unwrap().is_empty());
        let root_admin = f
            .rbac
            .list_grants(f.root)
            .await
            .unwrap()
            .into_iter()
            .find(|g| g.role_name == "admin")
            .unwrap();
        assert!(root_admin.expires_at.is_none());
        assert_eq!(f.admin.audit_log(Pagination::default()).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn user_profile_includes_resolved_access() {
        let f = fixture().await;
        let profile = f.admin.get_user(f.root).await.unwrap();
        assert_eq!(profile.roles, vec!["admin", "user"]);
        assert!(profile.permissions.contains(&"admin.access".to_string()));
    }
}
