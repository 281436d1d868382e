use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use crate::{
    auth::{
        cookies::access_token_from,
        error::AuthError,
        repo_types::User,
        services::{check_api_key, resolve_identity},
    },
    state::AppState,
};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Resolve the access token into a `User` and attach it to the request.
pub async fn identity_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = access_token_from(request.headers());
    let user = resolve_identity(&state, token.as_deref())
        .await
        .inspect_err(|e| match e {
            AuthError::Internal(_) => {}
            other => warn!(reason = %other, path = %request.uri().path(), "identity gate rejected request"),
        })?;

    debug!(user_id = %user.id, "authenticated");
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Require `x-api-key` to match the authenticated user's key.
/// Must run after [`identity_gate`].
pub async fn require_api_key(request: Request, next: Next) -> Result<Response, AuthError> {
    let user = request
        .extensions()
        .get::<User>()
        .ok_or(AuthError::NotLoggedIn)?;
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    if let Err(e) = check_api_key(user, presented) {
        warn!(user_id = %user.id, reason = %e, "api key gate rejected request");
        return Err(e);
    }
    Ok(next.run(request).await)
}
