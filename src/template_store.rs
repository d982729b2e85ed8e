//! Persistent email templates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{format_timestamp, parse_timestamp, Database};
use crate::error::{GatekeeperError, Result};
use crate::models::{EmailTemplate, Page, Pagination, TemplateUpdate, TemplateVariable};
use crate::templates::{self, RenderedEmail, TemplateContent, TemplateSource, Variables};
use crate::validation::Validator;

const TEMPLATE_COLUMNS: &str =
    "id, name, subject, html_content, text_content, variables, created_at, updated_at";

/// Payload for a new template.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEmailTemplate {
    pub name: String,
    pub subject: String,
    pub html_content: String,
    pub text_content: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
}

pub struct TemplateStore {
    db: Arc<Database>,
    validator: Arc<Validator>,
}

impl TemplateStore {
    pub fn new(db: Arc<Database>, validator: Arc<Validator>) -> Self {
        Self { db, validator }
    }

    /// Create a template after checking that every part parses.
    pub async fn create(&self, new: NewEmailTemplate) -> Result<EmailTemplate> {
        let name = self.validator.template_name(&new.name)?;
        templates::validate(
            &new.subject,
            &new.html_content,
            &new.text_content,
            &new.variables,
        )?;

        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "INSERT INTO email_templates
                (name, subject, html_content, text_content, variables, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(&new.subject)
        .bind(&new.html_content)
        .bind(&new.text_content)
        .bind(serde_json::to_string(&new.variables)?)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            GatekeeperError::from_sqlx(e, "Failed to create template", || {
                format!("template '{}' already exists", name)
            })
        })?;

        tracing::info!(template = %name, "Email template created");
        self.get(result.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> Result<EmailTemplate> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM email_templates WHERE id = ? AND deleted_at IS NULL",
            TEMPLATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to get template: {}", e)))?;

        match row {
            Some(row) => template_from_row(&row),
            None => Err(GatekeeperError::NotFound(format!(
                "template {} not found",
                id
            ))),
        }
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<EmailTemplate>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM email_templates WHERE name = ? AND deleted_at IS NULL",
            TEMPLATE_COLUMNS
        ))
        .bind(name)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to get template: {}", e)))?;

        row.as_ref().map(template_from_row).transpose()
    }

    pub async fn list(&self, pagination: Pagination) -> Result<Page<EmailTemplate>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM email_templates WHERE deleted_at IS NULL")
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| {
                    GatekeeperError::Database(format!("Failed to count templates: {}", e))
                })?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM email_templates WHERE deleted_at IS NULL
             ORDER BY name LIMIT ? OFFSET ?",
            TEMPLATE_COLUMNS
        ))
        .bind(pagination.per_page as i64)
        .bind(pagination.offset() as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to list templates: {}", e)))?;

        let items = rows
            .iter()
            .map(template_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total as u64, pagination))
    }

    /// Apply updates and re-validate the resulting template before saving.
    pub async fn update(&self, id: i64, updates: Vec<TemplateUpdate>) -> Result<EmailTemplate> {
        if updates.is_empty() {
            return Err(GatekeeperError::Validation(
                "no updates supplied".to_string(),
            ));
        }

        let mut template = self.get(id).await?;
        for update in updates {
            match update {
                TemplateUpdate::Subject(subject) => template.subject = subject,
                TemplateUpdate::HtmlContent(html) => template.html_content = html,
                TemplateUpdate::TextContent(text) => template.text_content = text,
                TemplateUpdate::Variables(variables) => template.variables = variables,
            }
        }

        templates::validate(
            &template.subject,
            &template.html_content,
            &template.text_content,
            &template.variables,
        )?;

        sqlx::query(
            "UPDATE email_templates
             SET subject = ?, html_content = ?, text_content = ?, variables = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&template.subject)
        .bind(&template.html_content)
        .bind(&template.text_content)
        .bind(serde_json::to_string(&template.variables)?)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to update template: {}", e)))?;

        self.get(id).await
    }

    pub async fn soft_delete(&self, id: i64) -> Result<()> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE email_templates SET deleted_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| GatekeeperError::Database(format!("Failed to delete template: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(GatekeeperError::NotFound(format!(
                "template {} not found",
                id
            )));
        }

        tracing::info!(template_id = id, "Email template deleted");
        Ok(())
    }

    /// Render a stored template with caller-supplied values.
    pub async fn preview(&self, id: i64, variables: &Variables) -> Result<RenderedEmail> {
        let template = self.get(id).await?;
        templates::render(&TemplateContent::from(&template), variables)
    }
}

fn template_from_row(row: &SqliteRow) -> Result<EmailTemplate> {
    let variables: String = row.get("variables");
    Ok(EmailTemplate {
        id: row.get("id"),
        name: row.get("name"),
        subject: row.get("subject"),
        html_content: row.get("html_content"),
        text_content: row.get("text_content"),
        variables: serde_json::from_str(&variables)?,
        created_at: parse_timestamp(row.get("created_at"), "created_at")?,
        updated_at: parse_timestamp(row.get("updated_at"), "updated_at")?,
    })
}

/// Stored templates as the primary lookup source.
pub struct DatabaseTemplateSource {
    store: Arc<TemplateStore>,
}

impl DatabaseTemplateSource {
    pub fn new(store: Arc<TemplateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TemplateSource for DatabaseTemplateSource {
    fn label(&self) -> &'static str {
        "database"
    }

    async fn load(&self, name: &str) -> Result<Option<TemplateContent>> {
        Ok(self
            .store
            .get_by_name(name)
            .await?
            .as_ref()
            .map(TemplateContent::from))
    }
}
