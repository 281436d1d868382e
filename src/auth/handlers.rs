use axum::{
    extract::{rejection::JsonRejection, FromRef, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        cookies::{clear_token_cookies, read_cookie, set_token_cookies, REFRESH_COOKIE},
        dto::{ApiKeyData, LoginData, LoginRequest, PublicUser, RefreshData, RefreshRequest, RegisterRequest},
        error::AuthError,
        extractors::AuthUser,
        jwt::{JwtKeys, TokenPair},
        middleware::identity_gate,
        services,
    },
    error::ApiError,
    response::ApiResponse,
    state::AppState,
};

/// Routes reachable without an access token.
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh-token", post(refresh_token))
}

/// Routes behind the identity gate.
pub fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/api-key", post(api_key))
        .route("/auth/me", get(get_me))
        .route_layer(middleware::from_fn_with_state(state, identity_gate))
}

fn session_cookies(state: &AppState, pair: &TokenPair) -> HeaderMap {
    let keys = JwtKeys::from_ref(state);
    let mut headers = HeaderMap::new();
    set_token_cookies(
        &mut headers,
        &pair.access_token,
        keys.access_ttl,
        &pair.refresh_token,
        keys.refresh_ttl,
        state.config.production,
    );
    headers
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let (user, pair) = services::register(&state, payload).await?;

    Ok((
        StatusCode::CREATED,
        session_cookies(&state, &pair),
        ApiResponse::created("User registered successfully", PublicUser::from(&user)),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let (user, pair) = services::login(&state, payload).await?;

    let cookies = session_cookies(&state, &pair);
    Ok((
        cookies,
        ApiResponse::ok(
            "User logged in successfully",
            LoginData {
                user: PublicUser::from(&user),
                access_token: pair.access_token,
            },
        ),
    ))
}

/// The refresh cookie wins; a JSON `refreshToken` is accepted for non-browser clients.
#[instrument(skip(state, headers, body))]
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let presented = read_cookie(&headers, REFRESH_COOKIE)
        .or_else(|| body.and_then(|Json(b)| b.refresh_token))
        .filter(|t| !t.trim().is_empty());
    let Some(presented) = presented else {
        warn!("refresh without token");
        return Err(AuthError::MissingRefreshToken.into());
    };

    let (_, pair) = services::refresh(&state, presented.trim()).await?;

    let cookies = session_cookies(&state, &pair);
    Ok((
        cookies,
        ApiResponse::ok(
            "Access token refreshed",
            RefreshData {
                access_token: pair.access_token,
            },
        ),
    ))
}

#[instrument(skip(state, user), fields(user_id = %user.id))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    services::logout(&state, user.id).await?;

    let mut headers = HeaderMap::new();
    clear_token_cookies(&mut headers, state.config.production);
    Ok((headers, ApiResponse::ok("User logged out successfully", serde_json::json!({}))))
}

#[instrument(skip(state, user), fields(user_id = %user.id))]
pub async fn api_key(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let api_key = services::issue_api_key(&state, user.id).await?;
    info!("api key returned to client");
    Ok(ApiResponse::ok("API key generated successfully", ApiKeyData { api_key }))
}

#[instrument(skip(user), fields(user_id = %user.id))]
pub async fn get_me(AuthUser(user): AuthUser) -> impl IntoResponse {
    ApiResponse::ok("User fetched successfully", PublicUser::from(&user))
}
