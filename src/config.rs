//! Configuration loading from environment.
//!
//! Reads sensitive configuration (JWT secret, bootstrap admin credentials)
//! from environment variables, with defaults for everything else.

use std::env;

use crate::error::{GatekeeperError, Result};

/// Minimum accepted length of the token signing secret.
pub const MIN_JWT_SECRET_LEN: usize = 32;

pub const DEFAULT_DATABASE_PATH: &str = "gatekeeper.db";
pub const DEFAULT_WEB_PORT: u16 = 8080;
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;
pub const DEFAULT_RESET_TOKEN_TTL_MINUTES: i64 = 60;

/// Main configuration for the Gatekeeper service.
#[derive(Clone)]
pub struct GatekeeperConfig {
    /// Secret used to sign session tokens.
    pub jwt_secret: String,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Port for the HTTP API.
    pub web_port: u16,
    /// Lifetime of issued session tokens.
    pub token_ttl_hours: i64,
    /// Lifetime of password reset tokens.
    pub reset_token_ttl_minutes: i64,
    /// Public URL of the application, used to build reset links.
    pub app_base_url: String,
    /// Directory holding the built admin console.
    pub static_dir: String,
    /// Account created on first start if it does not exist yet.
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

/// Initial administrator credentials.
#[derive(Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
    pub name: String,
}

impl std::fmt::Debug for GatekeeperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatekeeperConfig")
            .field("jwt_secret", &"<redacted>")
            .field("database_path", &self.database_path)
            .field("web_port", &self.web_port)
            .field("token_ttl_hours", &self.token_ttl_hours)
            .field("reset_token_ttl_minutes", &self.reset_token_ttl_minutes)
            .field("app_base_url", &self.app_base_url)
            .field("static_dir", &self.static_dir)
            .field(
                "bootstrap_admin",
                &self.bootstrap_admin.as_ref().map(|a| &a.email),
            )
            .finish()
    }
}

impl GatekeeperConfig {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `JWT_SECRET`: token signing secret (at least 32 characters)
    ///
    /// Optional environment variables:
    /// - `DATABASE_PATH`: SQLite file (default: gatekeeper.db)
    /// - `WEB_PORT`: HTTP port (default: 8080)
    /// - `TOKEN_TTL_HOURS`: session token lifetime (default: 24)
    /// - `RESET_TOKEN_TTL_MINUTES`: reset token lifetime (default: 60)
    /// - `APP_BASE_URL`: public URL used in emails (default: http://localhost:8080)
    /// - `STATIC_DIR`: admin console build directory (default: web)
    /// - `BOOTSTRAP_ADMIN_EMAIL`, `BOOTSTRAP_ADMIN_PASSWORD`, `BOOTSTRAP_ADMIN_NAME`
    pub fn from_env() -> Result<Self> {
        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| GatekeeperError::Config("JWT_SECRET not set".to_string()))?;
        validate_secret(&jwt_secret)?;

        let token_ttl_hours = parse_or("TOKEN_TTL_HOURS", DEFAULT_TOKEN_TTL_HOURS);
        if token_ttl_hours <= 0 {
            return Err(GatekeeperError::Config(
                "TOKEN_TTL_HOURS must be positive".to_string(),
            ));
        }

        let reset_token_ttl_minutes =
            parse_or("RESET_TOKEN_TTL_MINUTES", DEFAULT_RESET_TOKEN_TTL_MINUTES);
        if reset_token_ttl_minutes <= 0 {
            return Err(GatekeeperError::Config(
                "RESET_TOKEN_TTL_MINUTES must be positive".to_string(),
            ));
        }

        Ok(Self {
            jwt_secret,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string()),
            web_port: parse_or("WEB_PORT", DEFAULT_WEB_PORT),
            token_ttl_hours,
            reset_token_ttl_minutes,
            app_base_url: env::var("APP_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| format!("http://localhost:{}", DEFAULT_WEB_PORT)),
            static_dir: env::var("STATIC_DIR").unwrap_or_else(|_| "web".to_string()),
            bootstrap_admin: load_bootstrap_admin()?,
        })
    }
}

fn validate_secret(secret: &str) -> Result<()> {
    if secret.len() < MIN_JWT_SECRET_LEN {
        return Err(GatekeeperError::Config(format!(
            "JWT_SECRET must be at least {} characters",
            MIN_JWT_SECRET_LEN
        )));
    }
    Ok(())
}

/// Parse an environment variable, falling back to a default when it is
/// missing or unparsable.
fn parse_or<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    env::var(var_name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Load bootstrap admin credentials. Email and password must be set together.
fn load_bootstrap_admin() -> Result<Option<BootstrapAdmin>> {
    let email = env::var("BOOTSTRAP_ADMIN_EMAIL").ok().filter(|s| !s.is_empty());
    let password = env::var("BOOTSTRAP_ADMIN_PASSWORD")
        .ok()
        .filter(|s| !s.is_empty());

    match (email, password) {
        (Some(email), Some(password)) => Ok(Some(BootstrapAdmin {
            email,
            password,
            name: env::var("BOOTSTRAP_ADMIN_NAME")
                .unwrap_or_else(|_| "Administrator".to_string()),
        })),
        (None, None) => Ok(None),
        _ => Err(GatekeeperError::Config(
            "BOOTSTRAP_ADMIN_EMAIL and BOOTSTRAP_ADMIN_PASSWORD must be set together".to_string(),
        )),
    }
}


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any integer written to the environment is read back unchanged.
        #[test]
        fn prop_parse_or_roundtrip(value in 1i64..1_000_000i64) {
            use std::env;

            let var_name = format!("TEST_PROP_TTL_{}", rand::random::<u32>());
            env::set_var(&var_name, value.to_string());

            let parsed = super::parse_or(&var_name, 0i64);

            env::remove_var(&var_name);

            prop_assert_eq!(parsed, value);
        }

        /// Secrets shorter than the minimum are always rejected.
        #[test]
        fn prop_short_secrets_rejected(secret in "[a-zA-Z0-9]{0,31}") {
            prop_assert!(super::validate_secret(&secret).is_err());
        }
    }
}
