//! Input validation rules.
//!
//! A [`Validator`] is built once at startup and shared (behind an `Arc`) with
//! every service that accepts user input. It holds only compiled patterns and
//! limits and is never mutated after construction.

use regex::Regex;

use crate::error::{GatekeeperError, Result};
use crate::models::{Pagination, PermissionUpdate, RoleUpdate, UserUpdate};

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;
const MAX_EMAIL_LEN: usize = 254;
const MAX_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;

/// Immutable set of validation rules.
#[derive(Debug, Clone)]
pub struct Validator {
    email: Regex,
    phone: Regex,
    role_name: Regex,
    permission_part: Regex,
    permission_name: Regex,
    template_name: Regex,
}

impl Validator {
    /// Compile all validation patterns.
    pub fn new() -> Result<Self> {
        Ok(Self {
            email: Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")?,
            phone: Regex::new(r"^\+?[0-9][0-9 ()\-]{3,19}$")?,
            role_name: Regex::new(r"^[a-z][a-z0-9_\-]{1,49}$")?,
            permission_part: Regex::new(r"^[a-z][a-z0-9_]{0,49}$")?,
            permission_name: Regex::new(r"^[a-z][a-z0-9_\-]*(\.[a-z][a-z0-9_\-]*)+$")?,
            template_name: Regex::new(r"^[a-z][a-z0-9_]{1,63}$")?,
        })
    }

    /// Trim, lowercase and check an email address.
    pub fn normalize_email(&self, email: &str) -> Result<String> {
        let email = email.trim().to_lowercase();
        if email.len() > MAX_EMAIL_LEN || !self.email.is_match(&email) {
            return Err(GatekeeperError::Validation(
                "invalid email address".to_string(),
            ));
        }
        Ok(email)
    }

    pub fn password(&self, password: &str) -> Result<()> {
        let len = password.chars().count();
        if len < MIN_PASSWORD_LEN {
            return Err(GatekeeperError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        if len > MAX_PASSWORD_LEN {
            return Err(GatekeeperError::Validation(format!(
                "password must be at most {} characters",
                MAX_PASSWORD_LEN
            )));
        }
        Ok(())
    }

    pub fn display_name(&self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatekeeperError::Validation(
                "name must not be empty".to_string(),
            ));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(GatekeeperError::Validation(format!(
                "name must be at most {} characters",
                MAX_NAME_LEN
            )));
        }
        Ok(name.to_string())
    }

    /// Validate an optional phone number. `None` means "no phone".
    pub fn phone(&self, phone: Option<&str>) -> Result<Option<String>> {
        match phone.map(str::trim) {
            None => Ok(None),
            Some(p) if self.phone.is_match(p) => Ok(Some(p.to_string())),
            Some(_) => Err(GatekeeperError::Validation(
                "invalid phone number".to_string(),
            )),
        }
    }

    /// Validate an optional company name. `None` means "no company".
    pub fn company(&self, company: Option<&str>) -> Result<Option<String>> {
        match company.map(str::trim) {
            None => Ok(None),
            Some("") => Err(GatekeeperError::Validation(
                "company must not be empty; use null to clear it".to_string(),
            )),
            Some(c) if c.chars().count() > MAX_NAME_LEN => Err(GatekeeperError::Validation(
                format!("company must be at most {} characters", MAX_NAME_LEN),
            )),
            Some(c) => Ok(Some(c.to_string())),
        }
    }

    pub fn description(&self, description: Option<&str>) -> Result<Option<String>> {
        match description.map(str::trim) {
            None | Some("") => Ok(None),
            Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => {
                Err(GatekeeperError::Validation(format!(
                    "description must be at most {} characters",
                    MAX_DESCRIPTION_LEN
                )))
            }
            Some(d) => Ok(Some(d.to_string())),
        }
    }

    pub fn role_name(&self, name: &str) -> Result<String> {
        let name = name.trim();
        if !self.role_name.is_match(name) {
            return Err(GatekeeperError::Validation(format!(
                "invalid role name '{}': use 2-50 lowercase letters, digits, '-' or '_'",
                name
            )));
        }
        Ok(name.to_string())
    }

    /// Validate a permission resource or action segment.
    pub fn permission_part(&self, field: &str, value: &str) -> Result<String> {
        let value = value.trim();
        if !self.permission_part.is_match(value) {
            return Err(GatekeeperError::Validation(format!(
                "invalid permission {} '{}'",
                field, value
            )));
        }
        Ok(value.to_string())
    }

    pub fn permission_name(&self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.len() > 100 || !self.permission_name.is_match(name) {
            return Err(GatekeeperError::Validation(format!(
                "invalid permission name '{}'",
                name
            )));
        }
        Ok(name.to_string())
    }

    pub fn template_name(&self, name: &str) -> Result<String> {
        let name = name.trim();
        if !self.template_name.is_match(name) {
            return Err(GatekeeperError::Validation(format!(
                "invalid template name '{}'",
                name
            )));
        }
        Ok(name.to_string())
    }

    /// Apply defaults and bounds to a page request.
    pub fn pagination(&self, page: Option<u32>, per_page: Option<u32>) -> Result<Pagination> {
        let page = page.unwrap_or(1);
        if page == 0 {
            return Err(GatekeeperError::Validation(
                "page must be at least 1".to_string(),
            ));
        }

        let per_page = per_page.unwrap_or(Pagination::DEFAULT_PER_PAGE);
        if per_page == 0 || per_page > Pagination::MAX_PER_PAGE {
            return Err(GatekeeperError::Validation(format!(
                "per_page must be between 1 and {}",
                Pagination::MAX_PER_PAGE
            )));
        }

        if (page - 1).checked_mul(per_page).is_none() {
            return Err(GatekeeperError::Validation(format!(
                "page {} is out of range",
                page
            )));
        }

        Ok(Pagination { page, per_page })
    }

    /// Validate and normalize a list of user field updates.
    pub fn user_updates(&self, updates: Vec<UserUpdate>) -> Result<Vec<UserUpdate>> {
        if updates.is_empty() {
            return Err(GatekeeperError::Validation(
                "no updates supplied".to_string(),
            ));
        }

        updates
            .into_iter()
            .map(|update| match update {
                UserUpdate::Email(email) => self.normalize_email(&email).map(UserUpdate::Email),
                UserUpdate::Name(name) => self.display_name(&name).map(UserUpdate::Name),
                UserUpdate::Phone(phone) => self.phone(phone.as_deref()).map(UserUpdate::Phone),
                UserUpdate::Company(company) => {
                    self.company(company.as_deref()).map(UserUpdate::Company)
                }
            })
            .collect()
    }

    pub fn role_updates(&self, updates: Vec<RoleUpdate>) -> Result<Vec<RoleUpdate>> {
        if updates.is_empty() {
            return Err(GatekeeperError::Validation(
                "no updates supplied".to_string(),
            ));
        }

        updates
            .into_iter()
            .map(|update| match update {
                RoleUpdate::Name(name) => self.role_name(&name).map(RoleUpdate::Name),
                RoleUpdate::Description(d) => {
                    self.description(d.as_deref()).map(RoleUpdate::Description)
                }
            })
            .collect()
    }

    pub fn permission_updates(
        &self,
        updates: Vec<PermissionUpdate>,
    ) -> Result<Vec<PermissionUpdate>> {
        if updates.is_empty() {
            return Err(GatekeeperError::Validation(
                "no updates supplied".to_string(),
            ));
        }

        updates
            .into_iter()
            .map(|update| match update {
                PermissionUpdate::Name(name) => {
                    self.permission_name(&name).map(PermissionUpdate::Name)
                }
                PermissionUpdate::Resource(r) => self
                    .permission_part("resource", &r)
                    .map(PermissionUpdate::Resource),
                PermissionUpdate::Action(a) => self
                    .permission_part("action", &a)
                    .map(PermissionUpdate::Action),
                PermissionUpdate::Description(d) => self
                    .description(d.as_deref())
                    .map(PermissionUpdate::Description),
            })
            .collect()
    }
}
