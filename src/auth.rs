//! Authentication flows: registration, login, profile and password recovery.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::database::Database;
use crate::error::{GatekeeperError, Result};
use crate::models::{NewUser, UserProfile, UserUpdate};
use crate::notification::Notifier;
use crate::password::PasswordManager;
use crate::rbac::{grant_role_on, RBACService, DEFAULT_ROLE};
use crate::templates::{Variables, PASSWORD_RESET_TEMPLATE, WELCOME_TEMPLATE};
use crate::token::TokenIssuer;
use crate::users::{insert_user, UserStore};
use crate::validation::Validator;

const INVALID_CREDENTIALS: &str = "invalid email or password";
const INVALID_RESET_TOKEN: &str = "invalid or expired reset token";

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

/// Token plus the caller's profile, returned by register and login.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

/// Settings for the password reset flow.
#[derive(Debug, Clone)]
pub struct ResetSettings {
    pub token_ttl: Duration,
    pub app_base_url: String,
}

pub struct AuthService {
    db: Arc<Database>,
    users: Arc<UserStore>,
    rbac: Arc<RBACService>,
    tokens: Arc<TokenIssuer>,
    passwords: Arc<PasswordManager>,
    validator: Arc<Validator>,
    notifier: Arc<Notifier>,
    reset: ResetSettings,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        users: Arc<UserStore>,
        rbac: Arc<RBACService>,
        tokens: Arc<TokenIssuer>,
        passwords: Arc<PasswordManager>,
        validator: Arc<Validator>,
        notifier: Arc<Notifier>,
        reset: ResetSettings,
    ) -> Self {
        Self {
            db,
            users,
            rbac,
            tokens,
            passwords,
            validator,
            notifier,
            reset,
        }
    }

    /// Create an account holding the default role.
    ///
    /// The user row and the default grant are written in one transaction; if
    /// the grant cannot be made the registration fails as a whole.
    pub async fn register(&self, request: RegisterRequest) -> Result<AuthResponse> {
        let email = self.validator.normalize_email(&request.email)?;
        self.validator.password(&request.password)?;
        let name = self.validator.display_name(&request.name)?;
        let phone = self.validator.phone(request.phone.as_deref())?;
        let company = self.validator.company(request.company.as_deref())?;

        let new_user = NewUser {
            email,
            password_hash: self.passwords.hash(&request.password)?,
            name,
            phone,
            company,
        };

        let mut tx =
            self.db.pool().begin().await.map_err(|e| {
                GatekeeperError::Database(format!("Failed to begin transaction: {}", e))
            })?;

        let user_id = insert_user(&mut tx, &new_user).await?;
        grant_role_on(&mut tx, user_id, DEFAULT_ROLE, None, None)
            .await
            .map_err(|e| {
                GatekeeperError::InternalState(format!(
                    "Failed to grant default role '{}': {}",
                    DEFAULT_ROLE, e
                ))
            })?;

        tx.commit().await.map_err(|e| {
            GatekeeperError::Database(format!("Failed to commit registration: {}", e))
        })?;

        tracing::info!(user_id, email = %new_user.email, "User registered");

        let mut variables = Variables::new();
        variables.insert("name".to_string(), new_user.name.clone());
        variables.insert("app_url".to_string(), self.reset.app_base_url.clone());
        if let Err(e) = self
            .notifier
            .notify(&new_user.email, WELCOME_TEMPLATE, &variables)
            .await
        {
            tracing::warn!(user_id, error = %e, "Welcome email could not be sent");
        }

        self.session_for(user_id).await
    }

    /// Exchange credentials for a token. Unknown email and wrong password
    /// are indistinguishable to the caller.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let invalid = || GatekeeperError::Unauthorized(INVALID_CREDENTIALS.to_string());

        let email = self.validator.normalize_email(email).map_err(|_| invalid())?;
        let user = self.users.find_by_email(&email).await?.ok_or_else(invalid)?;

        if !self.passwords.verify(password, &user.password_hash)? {
            tracing::info!(user_id = user.id, "Login rejected: wrong password");
            return Err(invalid());
        }

        tracing::info!(user_id = user.id, "User logged in");
        self.session_for(user.id).await
    }

    async fn session_for(&self, user_id: i64) -> Result<AuthResponse> {
        let user = self.profile(user_id).await?;
        let issued = self.tokens.issue(user_id, &user.user.email)?;
        Ok(AuthResponse {
            token: issued.token,
            expires_at: issued.expires_at,
            user,
        })
    }

    /// The user with freshly resolved roles and permissions.
    pub async fn profile(&self, user_id: i64) -> Result<UserProfile> {
        load_profile(&self.users, &self.rbac, user_id).await
    }

    pub async fn update_profile(
        &self,
        user_id: i64,
        updates: Vec<UserUpdate>,
    ) -> Result<UserProfile> {
        let updates = self.validator.user_updates(updates)?;
        self.users.update_user(user_id, &updates).await?;
        self.profile(user_id).await
    }

    /// Change password after confirming the current one. Outstanding reset
    /// tokens are invalidated.
    pub async fn change_password(
        &self,
        user_id: i64,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let user = self.users.get_user(user_id).await?;
        if !self.passwords.verify(current_password, &user.password_hash)? {
            return Err(GatekeeperError::Validation(
                "current password is incorrect".to_string(),
            ));
        }
        self.validator.password(new_password)?;

        let hash = self.passwords.hash(new_password)?;
        self.users.set_password_hash(user_id, &hash).await?;

        tracing::info!(user_id, "Password changed");
        Ok(())
    }

    /// Start password recovery. Succeeds whether or not the account exists.
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        let email = self.validator.normalize_email(email)?;
        let Some(user) = self.users.find_by_email(&email).await? else {
            tracing::info!("Password reset requested for unknown email");
            return Ok(());
        };

        let token = generate_reset_token();
        let expires_at = Utc::now() + self.reset.token_ttl;
        self.users
            .replace_reset_token(user.id, &hash_reset_token(&token), expires_at)
            .await?;

        let mut variables = Variables::new();
        variables.insert("name".to_string(), user.name.clone());
        variables.insert(
            "reset_link".to_string(),
            format!("{}/reset-password?token={}", self.reset.app_base_url, token),
        );
        variables.insert(
            "expires_minutes".to_string(),
            self.reset.token_ttl.num_minutes().to_string(),
        );

        if let Err(e) = self
            .notifier
            .notify(&user.email, PASSWORD_RESET_TEMPLATE, &variables)
            .await
        {
            tracing::error!(user_id = user.id, error = %e, "Password reset email could not be sent");
        } else {
            tracing::info!(user_id = user.id, "Password reset email sent");
        }

        Ok(())
    }

    /// Complete password recovery with a token from [`Self::forgot_password`].
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<()> {
        self.validator.password(new_password)?;

        let record = self
            .users
            .find_reset_token(&hash_reset_token(token.trim()))
            .await?
            .ok_or_else(|| GatekeeperError::Validation(INVALID_RESET_TOKEN.to_string()))?;

        if record.expires_at <= Utc::now() {
            self.users.delete_reset_token(record.id).await?;
            return Err(GatekeeperError::Validation(INVALID_RESET_TOKEN.to_string()));
        }

        let hash = self.passwords.hash(new_password)?;
        self.users
            .set_password_hash(record.user_id, &hash)
            .await?;

        tracing::info!(user_id = record.user_id, "Password reset completed");
        Ok(())
    }
}

/// Load a user together with their current roles and permissions.
pub async fn load_profile(
    users: &UserStore,
    rbac: &RBACService,
    user_id: i64,
) -> Result<UserProfile> {
    let user = users.get_user(user_id).await?;
    let roles = rbac.get_roles_for_user(user_id).await?;
    let permissions = rbac.get_permission_names_for_user(user_id).await?;

    Ok(UserProfile {
        user,
        roles: roles.into_iter().collect(),
        permissions: permissions.into_iter().collect(),
    })
}

/// 32 random bytes, hex encoded.
fn generate_reset_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Only this digest is ever stored.
fn hash_reset_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
