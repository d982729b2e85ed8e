//! Credential store: user records and password reset tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::database::{format_timestamp, parse_optional_timestamp, parse_timestamp, Database};
use crate::error::{GatekeeperError, Result};
use crate::models::{NewUser, Page, Pagination, User, UserUpdate};

const USER_COLUMNS: &str =
    "id, email, password_hash, name, phone, company, created_at, updated_at, deleted_at";

/// A stored password reset token (hash only).
#[derive(Debug, Clone)]
pub struct ResetTokenRecord {
    pub id: i64,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// Persists user accounts.
pub struct UserStore {
    db: Arc<Database>,
}

impl UserStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a user outside of any larger transaction.
    pub async fn create_user(&self, new_user: &NewUser) -> Result<User> {
        let mut conn = self.db.pool().acquire().await.map_err(|e| {
            GatekeeperError::Database(format!("Failed to acquire connection: {}", e))
        })?;
        let id = insert_user(&mut conn, new_user).await?;
        drop(conn);
        self.get_user(id).await
    }

    /// Get an active (not soft-deleted) user.
    pub async fn get_user(&self, id: i64) -> Result<User> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE id = ? AND deleted_at IS NULL",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to get user: {}", e)))?;

        match row {
            Some(row) => user_from_row(&row),
            None => Err(GatekeeperError::NotFound(format!("user {} not found", id))),
        }
    }

    /// Find an active user by email. The lookup is case-insensitive.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.trim().to_lowercase();
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE email = ? AND deleted_at IS NULL",
            USER_COLUMNS
        ))
        .bind(&email)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to find user: {}", e)))?;

        row.as_ref().map(user_from_row).transpose()
    }

    /// List active users, optionally filtered by an email/name substring.
    pub async fn list_users(
        &self,
        pagination: Pagination,
        search: Option<&str>,
    ) -> Result<Page<User>> {
        let pattern = match search.map(str::trim).filter(|s| !s.is_empty()) {
            Some(term) => format!("%{}%", escape_like(&term.to_lowercase())),
            None => "%".to_string(),
        };

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users
             WHERE deleted_at IS NULL
               AND (email LIKE ?1 ESCAPE '\\' OR lower(name) LIKE ?1 ESCAPE '\\')",
        )
        .bind(&pattern)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to count users: {}", e)))?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM users
             WHERE deleted_at IS NULL
               AND (email LIKE ?1 ESCAPE '\\' OR lower(name) LIKE ?1 ESCAPE '\\')
             ORDER BY id
             LIMIT ?2 OFFSET ?3",
            USER_COLUMNS
        ))
        .bind(&pattern)
        .bind(pagination.per_page as i64)
        .bind(pagination.offset() as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to list users: {}", e)))?;

        let users = rows.iter().map(user_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Page::new(users, total as u64, pagination))
    }

    /// Apply already-validated field updates to a user.
    pub async fn update_user(&self, id: i64, updates: &[UserUpdate]) -> Result<User> {
        let mut user = self.get_user(id).await?;

        for update in updates {
            match update {
                UserUpdate::Email(email) => user.email = email.clone(),
                UserUpdate::Name(name) => user.name = name.clone(),
                UserUpdate::Phone(phone) => user.phone = phone.clone(),
                UserUpdate::Company(company) => user.company = company.clone(),
            }
        }

        sqlx::query(
            "UPDATE users SET email = ?, name = ?, phone = ?, company = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.phone)
        .bind(&user.company)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            GatekeeperError::from_sqlx(e, "Failed to update user", || {
                "email already registered".to_string()
            })
        })?;

        tracing::info!(user_id = id, fields = updates.len(), "User updated");
        self.get_user(id).await
    }

    /// Soft-delete a user, removing their role grants and reset tokens in the
    /// same transaction.
    pub async fn soft_delete_user(&self, id: i64) -> Result<()> {
        let now = format_timestamp(Utc::now());
        let mut tx =
            self.db.pool().begin().await.map_err(|e| {
                GatekeeperError::Database(format!("Failed to begin transaction: {}", e))
            })?;

        let result = sqlx::query(
            "UPDATE users SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to delete user: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(GatekeeperError::NotFound(format!("user {} not found", id)));
        }

        sqlx::query("DELETE FROM user_roles WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                GatekeeperError::Database(format!("Failed to remove role grants: {}", e))
            })?;

        sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                GatekeeperError::Database(format!("Failed to remove reset tokens: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            GatekeeperError::Database(format!("Failed to commit user deletion: {}", e))
        })?;

        tracing::info!(user_id = id, "User soft-deleted");
        Ok(())
    }

    // ========== Password reset tokens ==========

    /// Store a new reset token hash, invalidating every earlier token of the user.
    pub async fn replace_reset_token(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx =
            self.db.pool().begin().await.map_err(|e| {
                GatekeeperError::Database(format!("Failed to begin transaction: {}", e))
            })?;

        sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                GatekeeperError::Database(format!("Failed to clear reset tokens: {}", e))
            })?;

        sqlx::query(
            "INSERT INTO password_reset_tokens (user_id, token_hash, expires_at, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(format_timestamp(expires_at))
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to store reset token: {}", e)))?;

        tx.commit().await.map_err(|e| {
            GatekeeperError::Database(format!("Failed to commit reset token: {}", e))
        })?;

        Ok(())
    }

    pub async fn find_reset_token(&self, token_hash: &str) -> Result<Option<ResetTokenRecord>> {
        let row = sqlx::query(
            "SELECT id, user_id, expires_at FROM password_reset_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to find reset token: {}", e)))?;

        match row {
            Some(row) => Ok(Some(ResetTokenRecord {
                id: row.get("id"),
                user_id: row.get("user_id"),
                expires_at: parse_timestamp(row.get("expires_at"), "expires_at")?,
            })),
            None => Ok(None),
        }
    }

    pub async fn delete_reset_token(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM password_reset_tokens WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| {
                GatekeeperError::Database(format!("Failed to delete reset token: {}", e))
            })?;
        Ok(())
    }

    /// Set a new password hash and drop all of the user's reset tokens atomically,
    /// so a link mailed before the change can no longer be used.
    pub async fn set_password_hash(&self, user_id: i64, password_hash: &str) -> Result<()> {
        let mut tx =
            self.db.pool().begin().await.map_err(|e| {
                GatekeeperError::Database(format!("Failed to begin transaction: {}", e))
            })?;

        let result = sqlx::query(
            "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(password_hash)
        .bind(format_timestamp(Utc::now()))
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to set password: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(GatekeeperError::NotFound(format!(
                "user {} not found",
                user_id
            )));
        }

        sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                GatekeeperError::Database(format!("Failed to clear reset tokens: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            GatekeeperError::Database(format!("Failed to commit password change: {}", e))
        })?;

        Ok(())
    }
}

/// Insert a user row on an existing connection or transaction.
pub(crate) async fn insert_user(conn: &mut SqliteConnection, new_user: &NewUser) -> Result<i64> {
    let now = format_timestamp(Utc::now());
    let result = sqlx::query(
        "INSERT INTO users (email, password_hash, name, phone, company, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&new_user.email)
    .bind(&new_user.password_hash)
    .bind(&new_user.name)
    .bind(&new_user.phone)
    .bind(&new_user.company)
    .bind(&now)
    .bind(&now)
    .execute(conn)
    .await
    .map_err(|e| {
        GatekeeperError::from_sqlx(e, "Failed to create user", || {
            "email already registered".to_string()
        })
    })?;

    Ok(result.last_insert_rowid())
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        name: row.get("name"),
        phone: row.get("phone"),
        company: row.get("company"),
        created_at: parse_timestamp(row.get("created_at"), "created_at")?,
        updated_at: parse_timestamp(row.get("updated_at"), "updated_at")?,
        deleted_at: parse_optional_timestamp(row.get("deleted_at"), "deleted_at")?,
    })
}

/// Escape LIKE wildcards in a user-supplied search term.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            password_hash: "$argon2id$v=19$m=1024,t=1,p=1$c2FsdA$aGFzaA".to_string(),
            name: email.split('@').next().unwrap_or("user").to_string(),
            phone: None,
            company: None,
        }
    }

    async fn store() -> UserStore {
        UserStore::new(Arc::new(Database::in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn create_and_get_user() {
        let store = store().await;
        let user = store.create_user(&new_user("alice@example.com")).await.unwrap();

        let fetched = store.get_user(user.id).await.unwrap();
        assert_eq!(fetched.email, "alice@example.com");
        assert_eq!(fetched.name, "alice");
        assert!(fetched.deleted_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_conflict() {
        let store = store().await;
        store.create_user(&new_user("alice@example.com")).await.unwrap();

        let result = store.create_user(&new_user("alice@example.com")).await;
        assert!(matches!(result, Err(GatekeeperError::Conflict(_))));
    }

    #[tokio::test]
    async fn find_by_email_is_case_insensitive() {
        let store = store().await;
        store.create_user(&new_user("alice@example.com")).await.unwrap();

        let found = store.find_by_email("  ALICE@Example.com").await.unwrap();
        assert!(found.is_some());
        assert!(store.find_by_email("bob@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_missing_user_is_not_found() {
        let store = store().await;
        assert!(matches!(
            store.get_user(999).await,
            Err(GatekeeperError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_user_fields() {
        let store = store().await;
        let user = store.create_user(&new_user("alice@example.com")).await.unwrap();

        let updated = store
            .update_user(
                user.id,
                &[
                    UserUpdate::Name("Alice Liddell".to_string()),
                    UserUpdate::Phone(Some("+44 20 7946 0000".to_string())),
                ],
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Alice Liddell");
        assert_eq!(updated.phone.as_deref(), Some("+44 20 7946 0000"));
        assert_eq!(updated.email, "alice@example.com");

        let cleared = store
            .update_user(user.id, &[UserUpdate::Phone(None)])
            .await
            .unwrap();
        assert_eq!(cleared.phone, None);
        assert_eq!(cleared.name, "Alice Liddell");
    }

    #[tokio::test]
    async fn email_change_to_taken_address_is_conflict() {
        let store = store().await;
        store.create_user(&new_user("alice@example.com")).await.unwrap();
        let bob = store.create_user(&new_user("bob@example.com")).await.unwrap();

        let result = store
            .update_user(bob.id, &[UserUpdate::Email("alice@example.com".to_string())])
            .await;
        assert!(matches!(result, Err(GatekeeperError::Conflict(_))));
    }

    #[tokio::test]
    async fn soft_delete_hides_user_and_frees_email() {
        let store = store().await;
        let user = store.create_user(&new_user("alice@example.com")).await.unwrap();

        store.soft_delete_user(user.id).await.unwrap();

        assert!(matches!(
            store.get_user(user.id).await,
            Err(GatekeeperError::NotFound(_))
        ));
        assert!(store.find_by_email("alice@example.com").await.unwrap().is_none());

        // A deleted account does not block re-registration
        store.create_user(&new_user("alice@example.com")).await.unwrap();

        // Deleting twice is NotFound
        assert!(matches!(
            store.soft_delete_user(user.id).await,
            Err(GatekeeperError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn soft_delete_removes_reset_tokens() {
        let store = store().await;
        let user = store.create_user(&new_user("alice@example.com")).await.unwrap();
        store
            .replace_reset_token(user.id, "hash-1", Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        store.soft_delete_user(user.id).await.unwrap();
        assert!(store.find_reset_token("hash-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_users_paginates_and_searches() {
        let store = store().await;
        for name in ["alice", "bob", "carol", "dave", "erin"] {
            store
                .create_user(&new_user(&format!("{}@example.com", name)))
                .await
                .unwrap();
        }

        let page = store
            .list_users(
                Pagination {
                    page: 2,
                    per_page: 2,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].email, "carol@example.com");

        let found = store
            .list_users(Pagination::default(), Some("CAR"))
            .await
            .unwrap();
        assert_eq!(found.total, 1);
        assert_eq!(found.items[0].email, "carol@example.com");

        let wildcard = store
            .list_users(Pagination::default(), Some("%"))
            .await
            .unwrap();
        assert_eq!(wildcard.total, 0);
    }

    #[tokio::test]
    async fn new_reset_token_replaces_old() {
        let store = store().await;
        let user = store.create_user(&new_user("alice@example.com")).await.unwrap();
        let expires = Utc::now() + Duration::hours(1);

        store.replace_reset_token(user.id, "first", expires).await.unwrap();
        store.replace_reset_token(user.id, "second", expires).await.unwrap();

        assert!(store.find_reset_token("first").await.unwrap().is_none());
        let record = store.find_reset_token("second").await.unwrap().unwrap();
        assert_eq!(record.user_id, user.id);
    }

    #[tokio::test]
    async fn set_password_hash_clears_tokens() {
        let store = store().await;
        let user = store.create_user(&new_user("alice@example.com")).await.unwrap();
        store
            .replace_reset_token(user.id, "token", Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        store
            .set_password_hash(user.id, "$argon2id$new")
            .await
            .unwrap();

        assert!(store.find_reset_token("token").await.unwrap().is_none());
        assert_eq!(
            store.get_user(user.id).await.unwrap().password_hash,
            "$argon2id$new"
        );
    }

    #[test]
    fn like_wildcards_escaped() {
        assert_eq!(escape_like("a%b_c\\"), "a\\%b\\_c\\\\");
    }
}
