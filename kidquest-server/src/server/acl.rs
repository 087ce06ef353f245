use super::{AppError, AppState, auth::AuthCtx};
use axum::response::Response;
use axum::{
    extract::{OriginalUri, State},
    http::{Method, Request},
    middleware::Next,
};
use kidquest_shared::auth::Role;

/// Role gate over method + path. Family scoping itself happens in the
/// handlers: every storage call is keyed by the token's `family_id`, so a
/// request can never reach another family's rows regardless of what the ACL
/// lets through.
pub async fn enforce_acl(
    State(_state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|orig| orig.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().clone();
    let Some(auth) = req.extensions().get::<AuthCtx>() else {
        return Err(AppError::unauthorized());
    };
    let claims = &auth.claims;

    let segs = segmented(&path);
    let prefix = ["api", "v1"];
    if !segs.as_slice().starts_with(&prefix) {
        tracing::warn!(?segs, "ACL: path outside API scope");
        return Err(AppError::forbidden());
    }
    let rest = &segs[prefix.len()..];

    let decision = match claims.role {
        Role::Parent => allow_parent(&method, rest),
        Role::Child => allow_child(&method, rest),
    };

    if let Err(err) = decision {
        tracing::warn!(
            method = %method,
            path = %path,
            user_id = %claims.sub,
            role = ?claims.role,
            "ACL: no rule matched; denying"
        );
        return Err(err);
    }

    Ok(next.run(req).await)
}

fn allow_parent(method: &Method, rest: &[&str]) -> Result<(), AppError> {
    match rest {
        ["auth", "logout"] if *method == Method::POST => Ok(()),
        ["children"] if *method == Method::GET || *method == Method::POST => Ok(()),
        ["children", _] if *method == Method::DELETE => Ok(()),
        ["children", _, "balance"] if *method == Method::GET => Ok(()),
        ["tasks"] if *method == Method::GET || *method == Method::POST => Ok(()),
        ["tasks", _] if *method == Method::DELETE => Ok(()),
        ["tasks", _, action]
            if *method == Method::POST && (action == &"approve" || action == &"reject") =>
        {
            Ok(())
        }
        ["rewards"] if *method == Method::GET || *method == Method::POST => Ok(()),
        ["rewards", _] if *method == Method::DELETE => Ok(()),
        ["rewards", _, "fulfill"] if *method == Method::POST => Ok(()),
        ["rewards", _, "claim"] if *method == Method::POST => Ok(()),
        _ => Err(AppError::forbidden()),
    }
}

fn allow_child(method: &Method, rest: &[&str]) -> Result<(), AppError> {
    match rest {
        ["auth", "logout"] if *method == Method::POST => Ok(()),
        ["children"] if *method == Method::GET => Ok(()),
        ["children", _, "balance"] if *method == Method::GET => Ok(()),
        ["tasks"] if *method == Method::GET => Ok(()),
        ["tasks", _, "submit"] if *method == Method::POST => Ok(()),
        ["rewards"] if *method == Method::GET => Ok(()),
        ["rewards", _, "claim"] if *method == Method::POST => Ok(()),
        _ => Err(AppError::forbidden()),
    }
}

fn segmented(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
