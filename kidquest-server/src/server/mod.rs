mod acl;
pub mod auth;
mod config;

use crate::server::auth::AuthCtx;
use crate::storage::{NewRewardParams, NewTaskParams, RegisterUser, StorageError, models};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{Method, StatusCode, header},
    routing::{delete, get, post},
};
use bcrypt::verify;
use chrono::NaiveDateTime;
pub use config::AppConfig;
use kidquest_shared::api;
use kidquest_shared::auth::Role;
use kidquest_shared::domain::DomainError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: crate::storage::Store,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, store: crate::storage::Store) -> Self {
        Self {
            config,
            store,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    let private = Router::new()
        .route("/api/v1/auth/logout", post(api_auth_logout))
        .route("/api/v1/children", get(api_list_children))
        .route("/api/v1/children", post(api_create_child))
        .route("/api/v1/children/{id}", delete(api_delete_child))
        .route("/api/v1/children/{id}/balance", get(api_child_balance))
        .route("/api/v1/tasks", get(api_list_tasks))
        .route("/api/v1/tasks", post(api_create_task))
        .route("/api/v1/tasks/{id}", delete(api_delete_task))
        .route("/api/v1/tasks/{id}/submit", post(api_submit_task))
        .route("/api/v1/tasks/{id}/approve", post(api_approve_task))
        .route("/api/v1/tasks/{id}/reject", post(api_reject_task))
        .route("/api/v1/rewards", get(api_list_rewards))
        .route("/api/v1/rewards", post(api_create_reward))
        .route("/api/v1/rewards/{id}", delete(api_delete_reward))
        .route("/api/v1/rewards/{id}/claim", post(api_claim_reward))
        .route("/api/v1/rewards/{id}/fulfill", post(api_fulfill_reward))
        .with_state(state.clone())
        .layer(middleware::from_fn(set_auth_span_fields))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            acl::enforce_acl,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
            user_id = tracing::field::Empty,
            role = tracing::field::Empty,
            family_id = tracing::field::Empty
        )
    });

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/auth/register", post(api_auth_register))
        .route("/api/v1/auth/login", post(api_auth_login))
        .merge(private)
        .with_state(state.clone())
        .layer(trace)
        .layer(middleware::from_fn(add_security_headers))
        .layer(middleware::from_fn(add_request_id));

    // Optionally add CORS for dev if configured

    if let Some(origin) = &state.config.dev_cors_origin {
        let hv = header::HeaderValue::from_str(origin)
            .unwrap_or(header::HeaderValue::from_static("http://localhost:5173"));
        let cors = CorsLayer::new()
            .allow_origin(hv)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
        app.layer(cors)
    } else {
        app
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    // Put into request extensions for trace layer & handlers
    req.extensions_mut().insert(ReqId(rid.clone()));
    // Call next
    let mut resp = next.run(req).await;
    // Set header on response
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

async fn add_security_headers(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let path = req.uri().path().to_string();
    let mut resp = next.run(req).await;

    // General security headers for all responses
    let headers = resp.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("SAMEORIGIN"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    // HSTS is only honored on HTTPS; harmless otherwise
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    // Disable caching for API and health endpoints
    if path == "/healthz" || path.starts_with("/api/") || path == "/api" {
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        );
        headers.insert(
            HeaderName::from_static("pragma"),
            HeaderValue::from_static("no-cache"),
        );
        headers.insert(
            HeaderName::from_static("expires"),
            HeaderValue::from_static("0"),
        );
    }

    Ok(resp)
}

async fn set_auth_span_fields(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    if let Some(auth) = req.extensions().get::<AuthCtx>() {
        let span = Span::current();
        span.record("user_id", tracing::field::display(&auth.claims.sub));
        span.record("role", tracing::field::debug(&auth.claims.role));
        span.record("family_id", tracing::field::display(&auth.claims.family_id));
    }
    Ok(next.run(req).await)
}

// ---- auth ----

async fn api_auth_register(
    State(state): State<AppState>,
    Json(body): Json<api::RegisterReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    if body.email.trim().is_empty() {
        return Err(AppError::bad_request("email required"));
    }
    if body.password.is_empty() {
        return Err(AppError::bad_request("password required"));
    }
    if body.name.trim().is_empty() {
        return Err(AppError::bad_request("name required"));
    }
    if body.role == Role::Child && body.family_code.is_none() {
        return Err(AppError::bad_request("family code required"));
    }
    let password_hash =
        bcrypt::hash(&body.password, bcrypt::DEFAULT_COST).map_err(AppError::internal)?;
    let user = state
        .store
        .register_user(RegisterUser {
            email: body.email,
            name: body.name,
            password_hash,
            role: body.role,
            family_code: body.family_code,
            age: body.age,
        })
        .await?;
    let token = auth::issue_jwt_for_user(&state, &user).await?;
    Ok(Json(api::AuthResp {
        token,
        user: user_dto(user),
    }))
}

async fn api_auth_login(
    State(state): State<AppState>,
    Json(body): Json<api::AuthReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    // Unknown email and bad password are indistinguishable to the caller.
    let user = state
        .store
        .find_user_by_email(&body.email)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| {
            tracing::warn!(email=%body.email, "login: unknown email");
            AppError::unauthorized()
        })?;
    if !verify(&body.password, &user.password_hash).map_err(|e| {
        tracing::error!(email=%body.email, error=%e, "login: bcrypt verify failed");
        AppError::internal(e)
    })? {
        tracing::warn!(email=%body.email, "login: invalid password");
        return Err(AppError::unauthorized());
    }
    let token = auth::issue_jwt_for_user(&state, &user).await?;
    Ok(Json(api::AuthResp {
        token,
        user: user_dto(user),
    }))
}

/// Drops the server-side session; the bearer token is dead afterwards even
/// though its expiry lies in the future.
async fn api_auth_logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .delete_session(&auth.claims.jti)
        .await
        .map_err(AppError::internal)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- children ----

async fn api_list_children(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<Vec<api::ChildDto>>, AppError> {
    let rows = state
        .store
        .list_children_with_balances(&auth.claims.family_id)
        .await?;
    let items = rows
        .into_iter()
        .map(|(c, total, current)| api::ChildDto {
            id: c.id,
            name: c.name,
            age: c.age,
            avatar_url: c.avatar_url,
            total_points: total,
            current_points: current,
        })
        .collect();
    Ok(Json(items))
}

async fn api_create_child(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::NewChildReq>,
) -> Result<Json<api::ChildDto>, AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::bad_request("name required"));
    }
    let child = state
        .store
        .create_child(
            &auth.claims.family_id,
            &body.name,
            body.age,
            body.avatar_url.as_deref(),
        )
        .await?;
    Ok(Json(api::ChildDto {
        id: child.id,
        name: child.name,
        age: child.age,
        avatar_url: child.avatar_url,
        total_points: 0,
        current_points: 0,
    }))
}

async fn api_delete_child(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .store
        .delete_child(&auth.claims.family_id, &id)
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("child not found: {}", id)))
    }
}

async fn api_child_balance(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
) -> Result<Json<api::BalanceDto>, AppError> {
    let child = state
        .store
        .get_child(&auth.claims.family_id, &id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("child not found: {}", id)))?;
    let (total, current) = state.store.compute_balances(&child.id).await?;
    Ok(Json(api::BalanceDto {
        child_id: child.id,
        total_points: total,
        current_points: current,
    }))
}

// ---- tasks ----

async fn api_list_tasks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<Vec<api::TaskDto>>, AppError> {
    let rows = state.store.list_tasks(&auth.claims.family_id).await?;
    let items = rows
        .into_iter()
        .map(task_dto)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(items))
}

async fn api_create_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::CreateTaskReq>,
) -> Result<Json<api::TaskDto>, AppError> {
    if body.title.trim().is_empty() {
        return Err(AppError::bad_request("title required"));
    }
    if body.points <= 0 {
        return Err(AppError::bad_request("points must be positive"));
    }
    let due_date = parse_rfc3339_opt(body.due_date.as_deref())?;
    let task = state
        .store
        .create_task(
            &auth.claims.family_id,
            NewTaskParams {
                child_id: body.child_id,
                title: body.title,
                description: body.description.unwrap_or_default(),
                points: body.points,
                is_recurring: body.is_recurring,
                challenge_period: body.challenge_period.map(|p| p.as_str().to_string()),
                due_date,
                reward_id: body.reward_id,
            },
        )
        .await?;
    Ok(Json(task_dto(task)?))
}

async fn api_submit_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
    Json(body): Json<api::SubmitTaskReq>,
) -> Result<Json<api::TaskDto>, AppError> {
    let task = state
        .store
        .submit_task(&auth.claims.family_id, &id, body.photo_proof)
        .await?;
    Ok(Json(task_dto(task)?))
}

async fn api_approve_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
) -> Result<Json<api::TaskActionResp>, AppError> {
    let (task, successor) = state.store.approve_task(&auth.claims.family_id, &id).await?;
    let (total, current) = state.store.compute_balances(&task.child_id).await?;
    let balance = api::BalanceDto {
        child_id: task.child_id.clone(),
        total_points: total,
        current_points: current,
    };
    Ok(Json(api::TaskActionResp {
        task: task_dto(task)?,
        successor: successor.map(task_dto).transpose()?,
        balance,
    }))
}

async fn api_reject_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
) -> Result<Json<api::TaskDto>, AppError> {
    let task = state.store.reject_task(&auth.claims.family_id, &id).await?;
    Ok(Json(task_dto(task)?))
}

async fn api_delete_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = state.store.delete_task(&auth.claims.family_id, &id).await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("task not found: {}", id)))
    }
}

// ---- rewards ----

async fn api_list_rewards(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<Vec<api::RewardDto>>, AppError> {
    let rows = state.store.list_rewards(&auth.claims.family_id).await?;
    let items = rows
        .into_iter()
        .map(|(r, redemption)| reward_dto(r, redemption))
        .collect();
    Ok(Json(items))
}

async fn api_create_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::CreateRewardReq>,
) -> Result<Json<api::RewardDto>, AppError> {
    if body.title.trim().is_empty() {
        return Err(AppError::bad_request("title required"));
    }
    if body.points_required <= 0 {
        return Err(AppError::bad_request("points_required must be positive"));
    }
    let expires_at = parse_rfc3339_opt(body.expires_at.as_deref())?;
    let reward = state
        .store
        .create_reward(
            &auth.claims.family_id,
            NewRewardParams {
                title: body.title,
                description: body.description.unwrap_or_default(),
                points_required: body.points_required,
                expires_at,
            },
        )
        .await?;
    Ok(Json(reward_dto(reward, None)))
}

async fn api_claim_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
    Json(body): Json<api::ClaimReq>,
) -> Result<Json<api::ClaimResp>, AppError> {
    let (reward, redemption) = state
        .store
        .claim_reward(&auth.claims.family_id, &id, &body.child_id)
        .await?;
    let (total, current) = state.store.compute_balances(&redemption.child_id).await?;
    let balance = api::BalanceDto {
        child_id: redemption.child_id.clone(),
        total_points: total,
        current_points: current,
    };
    Ok(Json(api::ClaimResp {
        reward: reward_dto(reward, Some(redemption)),
        balance,
    }))
}

async fn api_fulfill_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
) -> Result<Json<api::RewardDto>, AppError> {
    let (reward, redemption) = state
        .store
        .fulfill_reward(&auth.claims.family_id, &id)
        .await?;
    Ok(Json(reward_dto(reward, Some(redemption))))
}

async fn api_delete_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .store
        .delete_reward(&auth.claims.family_id, &id)
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("reward not found: {}", id)))
    }
}

// ---- DTO mapping ----

fn rfc3339(dt: NaiveDateTime) -> String {
    chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(dt, chrono::Utc).to_rfc3339()
}

fn rfc3339_opt(dt: Option<NaiveDateTime>) -> Option<String> {
    dt.map(rfc3339)
}

fn parse_rfc3339_opt(s: Option<&str>) -> Result<Option<NaiveDateTime>, AppError> {
    s.map(|s| {
        chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.naive_utc())
            .map_err(|e| AppError::bad_request(format!("invalid timestamp {s:?}: {e}")))
    })
    .transpose()
}

fn user_dto(u: models::User) -> api::UserDto {
    api::UserDto {
        role: u.role.parse().unwrap_or(Role::Child),
        id: u.id,
        email: u.email,
        name: u.name,
        family_code: u.family_code,
        parent_id: u.parent_id,
        age: u.age,
        created_at: rfc3339(u.created_at),
    }
}

fn task_dto(t: models::Task) -> Result<api::TaskDto, AppError> {
    let status = t.status.parse().map_err(AppError::internal)?;
    let challenge_period = t
        .challenge_period
        .as_deref()
        .map(|p| p.parse().map_err(AppError::internal))
        .transpose()?;
    Ok(api::TaskDto {
        id: t.id,
        child_id: t.child_id,
        title: t.title,
        description: t.description,
        points: t.points,
        status,
        is_recurring: t.is_recurring,
        challenge_period,
        created_at: rfc3339(t.created_at),
        due_date: rfc3339_opt(t.due_date),
        completed_at: rfc3339_opt(t.completed_at),
        approved_at: rfc3339_opt(t.approved_at),
        last_recurred_at: rfc3339_opt(t.last_recurred_at),
        photo_proof: t.photo_proof,
        reward_id: t.reward_id,
    })
}

fn reward_dto(r: models::Reward, redemption: Option<models::Redemption>) -> api::RewardDto {
    api::RewardDto {
        id: r.id,
        title: r.title,
        description: r.description,
        points_required: r.points_required,
        claimed: redemption.is_some(),
        claimed_by: redemption.as_ref().map(|c| c.child_id.clone()),
        claimed_at: redemption.map(|c| rfc3339(c.redeemed_at)),
        expires_at: rfc3339_opt(r.expires_at),
        paid: r.paid,
        is_active: r.is_active,
    }
}

// ---- errors ----

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl AppError {
    fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }
    fn unauthorized() -> Self {
        Self::Unauthorized
    }
    fn forbidden() -> Self {
        Self::Forbidden
    }
    fn not_found<T: Into<String>>(msg: T) -> Self {
        Self::NotFound(msg.into())
    }
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<DomainError> for AppError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::DuplicateEmail
            | DomainError::AlreadyClaimed
            | DomainError::InvalidTransition { .. }
            | DomainError::InsufficientPoints { .. } => AppError::Conflict(e.to_string()),
            DomainError::InvalidFamilyCode => AppError::BadRequest(e.to_string()),
            DomainError::InvalidCredentials => AppError::Unauthorized,
            DomainError::InvalidChild(_) => AppError::NotFound(e.to_string()),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Domain(d) => d.into(),
            StorageError::NotFound(m) => AppError::NotFound(m),
            StorageError::InvalidInput(m) => AppError::BadRequest(m),
            other => AppError::internal(other),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, kind, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, "bad_request", None),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".into(),
                "unauthorized",
                None,
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".into(), "forbidden", None),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, "not_found", None),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m, "conflict", None),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".into(),
                "internal",
                Some(m),
            ),
        };
        // Log any error responses at ERROR level to file for troubleshooting
        if let Some(detail) = detail {
            tracing::error!(status = %status, kind = kind, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::error!(status = %status, kind = kind, message = %msg, "request failed");
        }
        let body = axum::Json(ErrorBody { error: msg });
        (status, body).into_response()
    }
}
