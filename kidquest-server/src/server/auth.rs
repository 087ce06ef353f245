use axum::http::{Request, header};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use kidquest_shared::jwt::{self, JwtClaims};
use tracing::error;

use super::{AppError, AppState};
use crate::storage::models::User;

/// How many days of inactivity before a session is considered expired.
const SESSION_IDLE_DAYS: i64 = 14;
/// How many days before mandatory re-login.
const TOKEN_TTL_DAYS: i64 = 30;

#[derive(Clone, Debug)]
pub struct AuthCtx {
    pub claims: JwtClaims,
}

pub async fn require_bearer(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let unauthorized = || Err(AppError::unauthorized());
    let header_val = match req.headers().get(header::AUTHORIZATION) {
        Some(v) => v,
        None => return unauthorized(),
    };
    let header_str = header_val.to_str().map_err(|_| AppError::unauthorized())?;
    let prefix = "Bearer ";
    if !header_str.starts_with(prefix) {
        return unauthorized();
    }
    let token = &header_str[prefix.len()..];

    let claims = match jwt::decode_and_verify(token, state.config.jwt_secret.as_bytes()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error=%e, "auth: jwt decode failed");
            return unauthorized();
        }
    };

    // The account must still exist and still match the token's scope; a
    // deleted or re-linked account logs the token out.
    let user = state
        .store
        .get_user(&claims.sub)
        .await
        .map_err(AppError::internal)?;
    let Some(user) = user else {
        tracing::warn!(user_id = %claims.sub, "auth: token for unknown account");
        return unauthorized();
    };
    if user.role != claims.role.as_str() || user.family_id() != claims.family_id {
        tracing::warn!(user_id = %claims.sub, "auth: token scope mismatch");
        return unauthorized();
    }

    let jti = claims.jti.clone();
    let cutoff = Utc::now() - Duration::days(SESSION_IDLE_DAYS);
    match state
        .store
        .touch_session_with_cutoff(&jti, cutoff.naive_utc())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(
                jti = %jti,
                user_id = %claims.sub,
                cutoff = %cutoff,
                "auth: session missing or expired (last_used_at < cutoff)"
            );
            return unauthorized();
        }
        Err(e) => {
            error!(jti = %jti, error=%e, "auth: touch_session_with_cutoff failed");
            return Err(AppError::internal(e));
        }
    }
    let auth = AuthCtx { claims };
    req.extensions_mut().insert(auth);
    Ok(next.run(req).await)
}

pub async fn issue_jwt_for_user(state: &AppState, user: &User) -> Result<String, AppError> {
    let jti = uuid::Uuid::new_v4().to_string();
    let exp = (Utc::now() + Duration::days(TOKEN_TTL_DAYS)).timestamp();
    let role = user.role.parse().map_err(|e| {
        error!(user_id = %user.id, error = %e, "issue_jwt: bad role in account record");
        AppError::internal(e)
    })?;
    let claims = JwtClaims {
        sub: user.id.clone(),
        jti: jti.clone(),
        exp,
        role,
        family_id: user.family_id().to_string(),
    };

    state
        .store
        .create_session(&jti, &user.id)
        .await
        .map_err(|e| {
            error!(user_id = %user.id, error=%e, "login/register: create_session failed");
            AppError::internal(e)
        })?;
    let token = jwt::encode(&claims, state.config.jwt_secret.as_bytes()).map_err(|e| {
        error!(user_id = %user.id, error=%e, "login/register: jwt encode failed");
        AppError::internal(e)
    })?;
    Ok(token)
}
