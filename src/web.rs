//! REST API router and handlers.
//!
//! Authentication routes live under `/api/auth`, administration under
//! `/api/admin` (gated by the `admin.access` permission through the
//! [`Authenticated`] extractor). Anything else falls through to the static
//! admin console.

use std::path::Path as FsPath;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::{FromRef, Path, Query, Request, State},
    http::StatusCode,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};
use tower_http::services::{ServeDir, ServeFile};

use crate::admin::AdminService;
use crate::auth::{AuthResponse, AuthService, RegisterRequest, ResetSettings};
use crate::catalog::{NewPermission, RoleCatalog};
use crate::database::{AuditLogEntry, Database};
use crate::error::{ErrorContext, ErrorKind, GatekeeperError, Result};
use crate::health::health_handler;
use crate::models::{
    EmailTemplate, Page, Permission, PermissionUpdate, Role, RoleGrant, RoleSummary, RoleUpdate,
    TemplateUpdate, TemplateVariable, User, UserProfile, UserUpdate,
};
use crate::notification::{Mailer, Notifier};
use crate::password::PasswordManager;
use crate::rbac::{AdminPanel, AnyUser, Authenticated, RBACService};
use crate::template_store::{DatabaseTemplateSource, NewEmailTemplate, TemplateStore};
use crate::templates::{self, BuiltinTemplateSource, RenderedEmail, TemplateChain, Variables};
use crate::token::TokenIssuer;
use crate::users::UserStore;
use crate::validation::Validator;

pub type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<T, ApiError>;

/// Request logging middleware layer
#[derive(Clone)]
pub struct RequestLoggingLayer;

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggingService { inner }
    }
}

/// Service that logs all requests with method, path, status, and response time
#[derive(Clone)]
pub struct RequestLoggingService<S> {
    inner: S,
}

impl<S> Service<Request> for RequestLoggingService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let start = std::time::Instant::now();

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;
            let duration = start.elapsed();
            let status = response.status();

            tracing::info!(
                method = %method,
                path = %uri.path(),
                status = %status.as_u16(),
                duration_ms = %duration.as_millis(),
                "HTTP request"
            );

            Ok(response)
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub tokens: Arc<TokenIssuer>,
    pub passwords: Arc<PasswordManager>,
    pub validator: Arc<Validator>,
    pub users: Arc<UserStore>,
    pub catalog: Arc<RoleCatalog>,
    pub rbac: Arc<RBACService>,
    pub templates: Arc<TemplateStore>,
    pub auth: Arc<AuthService>,
    pub admin: Arc<AdminService>,
    pub static_dir: String,
}

impl AppState {
    /// Wire every service on top of one database.
    ///
    /// Notifications resolve templates from the database first and fall back
    /// to the built-in set.
    pub fn assemble(
        db: Arc<Database>,
        tokens: Arc<TokenIssuer>,
        passwords: Arc<PasswordManager>,
        mailer: Arc<dyn Mailer>,
        reset: ResetSettings,
        static_dir: impl Into<String>,
    ) -> Result<Self> {
        let validator = Arc::new(Validator::new()?);
        let users = Arc::new(UserStore::new(db.clone()));
        let catalog = Arc::new(RoleCatalog::new(db.clone()));
        let rbac = Arc::new(RBACService::new(db.clone()));
        let templates = Arc::new(TemplateStore::new(db.clone(), validator.clone()));

        let chain = TemplateChain::new(vec![
            Arc::new(DatabaseTemplateSource::new(templates.clone())),
            Arc::new(BuiltinTemplateSource),
        ]);
        let notifier = Arc::new(Notifier::new(chain, mailer));

        let auth = Arc::new(AuthService::new(
            db.clone(),
            users.clone(),
            rbac.clone(),
            tokens.clone(),
            passwords.clone(),
            validator.clone(),
            notifier,
            reset,
        ));
        let admin = Arc::new(AdminService::new(
            db.clone(),
            users.clone(),
            catalog.clone(),
            rbac.clone(),
            templates.clone(),
            validator.clone(),
        ));

        Ok(Self {
            db,
            tokens,
            passwords,
            validator,
            users,
            catalog,
            rbac,
            templates,
            auth,
            admin,
            static_dir: static_dir.into(),
        })
    }
}

impl FromRef<AppState> for Arc<Database> {
    fn from_ref(state: &AppState) -> Self {
        state.db.clone()
    }
}

impl FromRef<AppState> for Arc<TokenIssuer> {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

impl FromRef<AppState> for Arc<RBACService> {
    fn from_ref(state: &AppState) -> Self {
        state.rbac.clone()
    }
}

// ========== Errors ==========

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a GatekeeperError into an API error, logging it with context.
///
/// Internal errors carry the request ID so the log line can be found; the
/// message itself never exposes internal detail.
fn handle_error(error: GatekeeperError, context: ErrorContext) -> ApiError {
    error.log_with_context(&context);

    let kind = error.kind();
    let request_id = (kind == ErrorKind::Internal).then_some(context.request_id);

    (
        status_for(kind),
        Json(ErrorResponse {
            error: error.user_message(),
            kind,
            request_id,
        }),
    )
}

/// Convert an error raised outside any particular operation.
pub fn api_error(error: GatekeeperError) -> ApiError {
    handle_error(error, ErrorContext::new("request"))
}

fn failed(operation: &'static str) -> impl FnOnce(GatekeeperError) -> ApiError {
    move |e| handle_error(e, ErrorContext::new(operation))
}

fn failed_for(operation: &'static str, user_id: i64) -> impl FnOnce(GatekeeperError) -> ApiError {
    move |e| handle_error(e, ErrorContext::new(operation).with_user_id(user_id))
}

// ========== Request bodies ==========

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatesRequest<T> {
    pub updates: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct SetRolesRequest {
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct GrantRoleRequest {
    pub role: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SetPermissionsRequest {
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePermissionRequest {
    pub name: Option<String>,
    pub resource: String,
    pub action: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateTemplateRequest {
    pub subject: String,
    pub html_content: String,
    pub text_content: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

// ========== Router ==========

pub fn build_router(state: AppState) -> Router {
    let static_dir = state.static_dir.clone();

    let api_router = Router::new()
        .route("/health", get(health_handler))
        // Authentication
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(get_me).put(update_me))
        .route("/api/auth/change-password", post(change_password))
        .route("/api/auth/forgot-password", post(forgot_password))
        .route("/api/auth/reset-password", post(reset_password))
        // Users
        .route("/api/admin/users", get(list_users))
        .route(
            "/api/admin/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route(
            "/api/admin/users/{id}/roles",
            get(get_user_roles)
                .put(set_user_roles)
                .post(grant_user_role),
        )
        // Roles
        .route("/api/admin/roles", get(list_roles).post(create_role))
        .route(
            "/api/admin/roles/{id}",
            get(get_role).put(update_role).delete(delete_role),
        )
        .route(
            "/api/admin/roles/{id}/permissions",
            get(get_role_permissions).put(set_role_permissions),
        )
        // Permissions
        .route(
            "/api/admin/permissions",
            get(list_permissions).post(create_permission),
        )
        .route(
            "/api/admin/permissions/{id}",
            put(update_permission).delete(delete_permission),
        )
        // Email templates
        .route(
            "/api/admin/email-templates",
            get(list_templates).post(create_template),
        )
        .route(
            "/api/admin/email-templates/validate",
            post(validate_template),
        )
        .route(
            "/api/admin/email-templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route(
            "/api/admin/email-templates/{id}/preview",
            post(preview_template),
        )
        // Audit
        .route("/api/admin/audit-log", get(get_audit_log))
        .layer(RequestLoggingLayer)
        .with_state(state);

    let serve_dir = ServeDir::new(&static_dir)
        .not_found_service(ServeFile::new(FsPath::new(&static_dir).join("index.html")));

    // API routes take precedence, then static files
    api_router.fallback_service(serve_dir)
}

// ========== Auth handlers ==========

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let response = state
        .auth
        .register(body)
        .await
        .map_err(failed("auth.register"))?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let response = state
        .auth
        .login(&body.email, &body.password)
        .await
        .map_err(failed("auth.login"))?;
    Ok(Json(response))
}

async fn get_me(
    State(state): State<AppState>,
    auth: Authenticated<AnyUser>,
) -> ApiResult<Json<UserProfile>> {
    let profile = state
        .auth
        .profile(auth.user_id)
        .await
        .map_err(failed_for("auth.profile", auth.user_id))?;
    Ok(Json(profile))
}

async fn update_me(
    State(state): State<AppState>,
    auth: Authenticated<AnyUser>,
    Json(body): Json<UpdatesRequest<UserUpdate>>,
) -> ApiResult<Json<UserProfile>> {
    let profile = state
        .auth
        .update_profile(auth.user_id, body.updates)
        .await
        .map_err(failed_for("auth.update_profile", auth.user_id))?;
    Ok(Json(profile))
}

async fn change_password(
    State(state): State<AppState>,
    auth: Authenticated<AnyUser>,
    Json(body): Json<ChangePasswordRequest>,
) -> ApiResult<StatusCode> {
    state
        .auth
        .change_password(auth.user_id, &body.current_password, &body.new_password)
        .await
        .map_err(failed_for("auth.change_password", auth.user_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn forgot_password(
    State(state): State<AppState>,
    Json(body): Json<ForgotPasswordRequest>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    state
        .auth
        .forgot_password(&body.email)
        .await
        .map_err(failed("auth.forgot_password"))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "If the account exists, a reset link has been sent",
        }),
    ))
}

async fn reset_password(
    State(state): State<AppState>,
    Json(body): Json<ResetPasswordRequest>,
) -> ApiResult<StatusCode> {
    state
        .auth
        .reset_password(&body.token, &body.new_password)
        .await
        .map_err(failed("auth.reset_password"))?;
    Ok(StatusCode::NO_CONTENT)
}

// ========== Admin: users ==========

async fn list_users(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<User>>> {
    let pagination = state
        .validator
        .pagination(query.page, query.per_page)
        .map_err(failed_for("admin.list_users", auth.user_id))?;
    let page = state
        .admin
        .list_users(pagination, query.search.as_deref())
        .await
        .map_err(failed_for("admin.list_users", auth.user_id))?;
    Ok(Json(page))
}

async fn get_user(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<Json<UserProfile>> {
    let profile = state
        .admin
        .get_user(id)
        .await
        .map_err(failed_for("admin.get_user", auth.user_id))?;
    Ok(Json(profile))
}

async fn update_user(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
    Json(body): Json<UpdatesRequest<UserUpdate>>,
) -> ApiResult<Json<User>> {
    let user = state
        .admin
        .update_user(auth.user_id, id, body.updates)
        .await
        .map_err(failed_for("admin.update_user", auth.user_id))?;
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state
        .admin
        .delete_user(auth.user_id, id)
        .await
        .map_err(failed_for("admin.delete_user", auth.user_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_user_roles(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<RoleGrant>>> {
    let grants = state
        .admin
        .get_user_roles(id)
        .await
        .map_err(failed_for("admin.get_user_roles", auth.user_id))?;
    Ok(Json(grants))
}

async fn set_user_roles(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
    Json(body): Json<SetRolesRequest>,
) -> ApiResult<Json<Vec<RoleGrant>>> {
    let op = "admin.set_user_roles";
    state
        .admin
        .set_user_roles(auth.user_id, id, body.roles)
        .await
        .map_err(failed_for(op, auth.user_id))?;
    let grants = state
        .admin
        .get_user_roles(id)
        .await
        .map_err(failed_for(op, auth.user_id))?;
    Ok(Json(grants))
}

async fn grant_user_role(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
    Json(body): Json<GrantRoleRequest>,
) -> ApiResult<Json<Vec<RoleGrant>>> {
    let grants = state
        .admin
        .grant_user_role(auth.user_id, id, &body.role, body.expires_at)
        .await
        .map_err(failed_for("admin.grant_user_role", auth.user_id))?;
    Ok(Json(grants))
}

// ========== Admin: roles ==========

async fn list_roles(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
) -> ApiResult<Json<Vec<RoleSummary>>> {
    let roles = state
        .admin
        .list_roles()
        .await
        .map_err(failed_for("admin.list_roles", auth.user_id))?;
    Ok(Json(roles))
}

async fn create_role(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Json(body): Json<CreateRoleRequest>,
) -> ApiResult<(StatusCode, Json<Role>)> {
    let role = state
        .admin
        .create_role(auth.user_id, &body.name, body.description.as_deref())
        .await
        .map_err(failed_for("admin.create_role", auth.user_id))?;
    Ok((StatusCode::CREATED, Json(role)))
}

async fn get_role(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Role>> {
    let role = state
        .admin
        .get_role(id)
        .await
        .map_err(failed_for("admin.get_role", auth.user_id))?;
    Ok(Json(role))
}

async fn update_role(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
    Json(body): Json<UpdatesRequest<RoleUpdate>>,
) -> ApiResult<Json<Role>> {
    let role = state
        .admin
        .update_role(auth.user_id, id, body.updates)
        .await
        .map_err(failed_for("admin.update_role", auth.user_id))?;
    Ok(Json(role))
}

async fn delete_role(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state
        .admin
        .delete_role(auth.user_id, id)
        .await
        .map_err(failed_for("admin.delete_role", auth.user_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_role_permissions(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Permission>>> {
    let permissions = state
        .admin
        .get_role_permissions(id)
        .await
        .map_err(failed_for("admin.get_role_permissions", auth.user_id))?;
    Ok(Json(permissions))
}

async fn set_role_permissions(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
    Json(body): Json<SetPermissionsRequest>,
) -> ApiResult<Json<Vec<Permission>>> {
    let op = "admin.set_role_permissions";
    state
        .admin
        .set_role_permissions(auth.user_id, id, body.permissions)
        .await
        .map_err(failed_for(op, auth.user_id))?;
    let permissions = state
        .admin
        .get_role_permissions(id)
        .await
        .map_err(failed_for(op, auth.user_id))?;
    Ok(Json(permissions))
}

// ========== Admin: permissions ==========

async fn list_permissions(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
) -> ApiResult<Json<Vec<Permission>>> {
    let permissions = state
        .admin
        .list_permissions()
        .await
        .map_err(failed_for("admin.list_permissions", auth.user_id))?;
    Ok(Json(permissions))
}

async fn create_permission(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Json(body): Json<CreatePermissionRequest>,
) -> ApiResult<(StatusCode, Json<Permission>)> {
    let new = NewPermission {
        name: body.name,
        resource: body.resource,
        action: body.action,
        description: body.description,
    };
    let permission = state
        .admin
        .create_permission(auth.user_id, new)
        .await
        .map_err(failed_for("admin.create_permission", auth.user_id))?;
    Ok((StatusCode::CREATED, Json(permission)))
}

async fn update_permission(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
    Json(body): Json<UpdatesRequest<PermissionUpdate>>,
) -> ApiResult<Json<Permission>> {
    let permission = state
        .admin
        .update_permission(auth.user_id, id, body.updates)
        .await
        .map_err(failed_for("admin.update_permission", auth.user_id))?;
    Ok(Json(permission))
}

async fn delete_permission(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state
        .admin
        .delete_permission(auth.user_id, id)
        .await
        .map_err(failed_for("admin.delete_permission", auth.user_id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ========== Admin: email templates ==========

async fn list_templates(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<EmailTemplate>>> {
    let pagination = state
        .validator
        .pagination(query.page, query.per_page)
        .map_err(failed_for("admin.list_templates", auth.user_id))?;
    let page = state
        .templates
        .list(pagination)
        .await
        .map_err(failed_for("admin.list_templates", auth.user_id))?;
    Ok(Json(page))
}

async fn create_template(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Json(body): Json<NewEmailTemplate>,
) -> ApiResult<(StatusCode, Json<EmailTemplate>)> {
    let template = state
        .admin
        .create_template(auth.user_id, body)
        .await
        .map_err(failed_for("admin.create_template", auth.user_id))?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<Json<EmailTemplate>> {
    let template = state
        .templates
        .get(id)
        .await
        .map_err(failed_for("admin.get_template", auth.user_id))?;
    Ok(Json(template))
}

async fn update_template(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
    Json(body): Json<UpdatesRequest<TemplateUpdate>>,
) -> ApiResult<Json<EmailTemplate>> {
    let template = state
        .admin
        .update_template(auth.user_id, id, body.updates)
        .await
        .map_err(failed_for("admin.update_template", auth.user_id))?;
    Ok(Json(template))
}

async fn delete_template(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state
        .admin
        .delete_template(auth.user_id, id)
        .await
        .map_err(failed_for("admin.delete_template", auth.user_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn preview_template(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Path(id): Path<i64>,
    Json(body): Json<PreviewRequest>,
) -> ApiResult<Json<RenderedEmail>> {
    let rendered = state
        .templates
        .preview(id, &body.variables)
        .await
        .map_err(failed_for("admin.preview_template", auth.user_id))?;
    Ok(Json(rendered))
}

async fn validate_template(
    auth: Authenticated<AdminPanel>,
    Json(body): Json<ValidateTemplateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    templates::validate(
        &body.subject,
        &body.html_content,
        &body.text_content,
        &body.variables,
    )
    .map_err(failed_for("admin.validate_template", auth.user_id))?;
    Ok(Json(serde_json::json!({ "valid": true })))
}

// ========== Admin: audit log ==========

async fn get_audit_log(
    State(state): State<AppState>,
    auth: Authenticated<AdminPanel>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<AuditLogEntry>>> {
    let pagination = state
        .validator
        .pagination(query.page, query.per_page)
        .map_err(failed_for("admin.audit_log", auth.user_id))?;
    let page = state
        .admin
        .audit_log(pagination)
        .await
        .map_err(failed_for("admin.audit_log", auth.user_id))?;
    Ok(Json(page))
}
