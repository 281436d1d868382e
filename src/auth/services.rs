use anyhow::Context;
use axum::extract::FromRef;
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{normalize_email, LoginRequest, RegisterRequest},
        error::AuthError,
        jwt::{JwtKeys, TokenPair},
        password::{hash_password_async, verify_password_async, verify_unknown_account},
        repo::RepoError,
        repo_types::{NewUser, User},
    },
    state::AppState,
};

const API_KEY_BYTES: usize = 32;

/// Deterministic placeholder avatar for a new user.
pub fn placeholder_avatar(name: &str, gender: Option<&str>) -> String {
    match gender {
        Some("male") => "https://avatar.iran.liara.run/public/boy".to_string(),
        Some("female") => "https://avatar.iran.liara.run/public/girl".to_string(),
        _ => {
            let username: String = name
                .trim()
                .chars()
                .map(|c| if c.is_whitespace() { '+' } else { c })
                .collect();
            format!("https://avatar.iran.liara.run/username?username={username}")
        }
    }
}

/// Random key, 32 bytes of OS entropy, URL-safe base64.
pub fn generate_api_key() -> anyhow::Result<String> {
    let mut bytes = [0u8; API_KEY_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate api key")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Issue a pair and make its refresh token the only valid one for `user_id`.
async fn start_session(state: &AppState, user_id: Uuid) -> Result<TokenPair, AuthError> {
    let keys = JwtKeys::from_ref(state);
    let pair = keys.issue(user_id)?;
    let found = state
        .users
        .set_refresh_token(user_id, Some(&pair.refresh_token))
        .await?;
    if !found {
        return Err(AuthError::UserGone);
    }
    Ok(pair)
}

pub async fn register(
    state: &AppState,
    payload: RegisterRequest,
) -> Result<(User, TokenPair), AuthError> {
    let errors = payload.validate();
    if !errors.is_empty() {
        warn!(fields = ?errors.keys().collect::<Vec<_>>(), "registration validation failed");
        return Err(AuthError::Validation(errors));
    }

    let email = normalize_email(&payload.email);
    if payload.password != payload.confirm_password {
        warn!(email = %email, "password mismatch");
        return Err(AuthError::PasswordMismatch);
    }

    if state.users.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AuthError::DuplicateEmail);
    }

    let password_hash = hash_password_async(payload.password).await?;
    let name = payload.name.trim().to_string();
    let image = placeholder_avatar(&name, payload.gender.as_deref());

    let user = state
        .users
        .create(NewUser {
            name,
            email,
            password_hash,
            image,
            gender: payload.gender,
        })
        .await
        .map_err(|e| match e {
            // Lost a race with a concurrent registration.
            RepoError::DuplicateEmail => AuthError::DuplicateEmail,
            RepoError::Other(e) => AuthError::Internal(e),
        })?;

    let pair = start_session(state, user.id).await?;
    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((user, pair))
}

pub async fn login(
    state: &AppState,
    payload: LoginRequest,
) -> Result<(User, TokenPair), AuthError> {
    let errors = payload.validate();
    if !errors.is_empty() {
        return Err(AuthError::Validation(errors));
    }
    let email = normalize_email(&payload.email);

    let Some(user) = state.users.find_by_email(&email).await? else {
        warn!(email = %email, "login unknown email");
        verify_unknown_account(payload.password).await;
        return Err(AuthError::InvalidCredentials);
    };

    if !verify_password_async(payload.password, user.password_hash.clone()).await? {
        warn!(email = %email, user_id = %user.id, "login invalid password");
        return Err(AuthError::InvalidCredentials);
    }

    let pair = start_session(state, user.id).await?;
    info!(user_id = %user.id, "user logged in");
    Ok((user, pair))
}

/// Exchange a refresh token for a new pair. The presented token stops working.
pub async fn refresh(state: &AppState, presented: &str) -> Result<(User, TokenPair), AuthError> {
    let keys = JwtKeys::from_ref(state);
    let claims = keys
        .verify_refresh(presented)
        .map_err(|_| AuthError::InvalidRefreshToken)?;

    let Some(user) = state.users.find_by_id(claims.sub).await? else {
        warn!(user_id = %claims.sub, "refresh for missing user");
        return Err(AuthError::InvalidRefreshToken);
    };
    if user.refresh_token.as_deref() != Some(presented) {
        warn!(user_id = %user.id, "stale or revoked refresh token presented");
        return Err(AuthError::InvalidRefreshToken);
    }

    let pair = keys.issue(user.id)?;
    // Compare-and-swap: of two concurrent refreshes with one token, one wins.
    let rotated = state
        .users
        .rotate_refresh_token(user.id, presented, &pair.refresh_token)
        .await?;
    if !rotated {
        warn!(user_id = %user.id, "refresh token rotated concurrently");
        return Err(AuthError::InvalidRefreshToken);
    }

    info!(user_id = %user.id, "refresh token rotated");
    Ok((user, pair))
}

/// Drop the stored refresh token. Safe to call repeatedly.
pub async fn logout(state: &AppState, user_id: Uuid) -> Result<(), AuthError> {
    state.users.set_refresh_token(user_id, None).await?;
    info!(user_id = %user_id, "user logged out");
    Ok(())
}

/// Create (or replace) the user's API key and return it once.
pub async fn issue_api_key(state: &AppState, user_id: Uuid) -> Result<String, AuthError> {
    let api_key = generate_api_key()?;
    if !state.users.set_api_key(user_id, &api_key).await? {
        return Err(AuthError::UserNotFound);
    }
    info!(user_id = %user_id, "api key issued");
    Ok(api_key)
}

/// Resolve a presented access token into the stored user.
pub async fn resolve_identity(state: &AppState, token: Option<&str>) -> Result<User, AuthError> {
    let token = token.ok_or(AuthError::NotLoggedIn)?;
    let claims = JwtKeys::from_ref(state).verify_access(token)?;
    state
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or(AuthError::UserGone)
}

/// Compare a presented API key with the stored one in constant time.
pub fn check_api_key(user: &User, presented: Option<&str>) -> Result<(), AuthError> {
    let presented = presented.ok_or(AuthError::MissingApiKey)?;
    let Some(stored) = user.api_key.as_deref() else {
        return Err(AuthError::InvalidApiKey);
    };
    if constant_time_eq(stored.as_bytes(), presented.as_bytes()) {
        Ok(())
    } else {
        Err(AuthError::InvalidApiKey)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo::UserStore;

    fn register_req(email: &str) -> RegisterRequest {
        RegisterRequest {
            name: "Ann".into(),
            email: email.into(),
            password: "secret1".into(),
            confirm_password: "secret1".into(),
            gender: None,
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.into(),
            password: password.into(),
        }
    }

    #[test]
    fn avatar_depends_on_gender_then_name() {
        assert_eq!(
            placeholder_avatar("Ann", Some("female")),
            "https://avatar.iran.liara.run/public/girl"
        );
        assert_eq!(
            placeholder_avatar("Bob", Some("male")),
            "https://avatar.iran.liara.run/public/boy"
        );
        assert_eq!(
            placeholder_avatar("Ann Lee", Some("other")),
            "https://avatar.iran.liara.run/username?username=Ann+Lee"
        );
        assert_eq!(placeholder_avatar("Ann", None), placeholder_avatar("Ann", None));
    }

    #[test]
    fn api_keys_are_random_and_url_safe() {
        let a = generate_api_key().unwrap();
        let b = generate_api_key().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn register_once_then_duplicate() {
        let state = AppState::fake();
        let (user, pair) = register(&state, register_req("ann@x.com")).await.unwrap();
        assert_eq!(user.email, "ann@x.com");

        let stored = state.users.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some(pair.refresh_token.as_str()));
        assert_ne!(stored.password_hash, "secret1");

        let err = register(&state, register_req("ANN@x.com ")).await.unwrap_err();
        assert!(matches!(err, AuthError::DuplicateEmail));
    }

    #[tokio::test]
    async fn register_rejects_mismatch_and_invalid_fields() {
        let state = AppState::fake();
        let mut req = register_req("ann@x.com");
        req.confirm_password = "secret2".into();
        assert!(matches!(register(&state, req).await, Err(AuthError::PasswordMismatch)));

        let mut req = register_req("not-an-email");
        req.password = "123".into();
        match register(&state, req).await {
            Err(AuthError::Validation(fields)) => {
                assert!(fields.contains_key("email"));
                assert!(fields.contains_key("password"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(state.users.find_by_email("ann@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn login_is_uniform_for_unknown_email_and_wrong_password() {
        let state = AppState::fake();
        register(&state, register_req("ann@x.com")).await.unwrap();

        let unknown = login(&state, login_req("bob@x.com", "secret1")).await.unwrap_err();
        let wrong = login(&state, login_req("ann@x.com", "secret2")).await.unwrap_err();
        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test]
    async fn login_rotates_the_refresh_token() {
        let state = AppState::fake();
        let (_, first) = register(&state, register_req("ann@x.com")).await.unwrap();
        let (user, second) = login(&state, login_req("Ann@X.com", "secret1")).await.unwrap();
        assert_ne!(first.refresh_token, second.refresh_token);

        // The registration token was overwritten.
        assert!(matches!(
            refresh(&state, &first.refresh_token).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        let stored = state.users.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some(second.refresh_token.as_str()));
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_replay() {
        let state = AppState::fake();
        let (_, original) = register(&state, register_req("ann@x.com")).await.unwrap();

        let (_, rotated) = refresh(&state, &original.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, original.refresh_token);

        assert!(matches!(
            refresh(&state, &original.refresh_token).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        refresh(&state, &rotated.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_refresh_with_same_token_succeeds_once() {
        let state = AppState::fake();
        let (_, pair) = register(&state, register_req("ann@x.com")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            let token = pair.refresh_token.clone();
            handles.push(tokio::spawn(async move { refresh(&state, &token).await }));
        }
        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AuthError::InvalidRefreshToken) => rejected += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn logout_is_idempotent_and_kills_refresh() {
        let state = AppState::fake();
        let (user, pair) = register(&state, register_req("ann@x.com")).await.unwrap();

        logout(&state, user.id).await.unwrap();
        logout(&state, user.id).await.unwrap();

        assert!(matches!(
            refresh(&state, &pair.refresh_token).await,
            Err(AuthError::InvalidRefreshToken)
        ));
    }

    #[tokio::test]
    async fn refresh_rejects_access_token_and_garbage() {
        let state = AppState::fake();
        let (_, pair) = register(&state, register_req("ann@x.com")).await.unwrap();
        for bad in [pair.access_token.as_str(), "garbage", ""] {
            assert!(matches!(refresh(&state, bad).await, Err(AuthError::InvalidRefreshToken)));
        }
    }

    #[tokio::test]
    async fn identity_resolution_states() {
        let state = AppState::fake();
        let (user, pair) = register(&state, register_req("ann@x.com")).await.unwrap();

        assert!(matches!(resolve_identity(&state, None).await, Err(AuthError::NotLoggedIn)));
        assert!(matches!(
            resolve_identity(&state, Some("junk")).await,
            Err(AuthError::InvalidToken)
        ));
        let resolved = resolve_identity(&state, Some(&pair.access_token)).await.unwrap();
        assert_eq!(resolved.id, user.id);

        state.users.delete(user.id).await.unwrap();
        assert!(matches!(
            resolve_identity(&state, Some(&pair.access_token)).await,
            Err(AuthError::UserGone)
        ));
    }

    #[tokio::test]
    async fn api_key_issue_and_check() {
        let state = AppState::fake();
        let (user, _) = register(&state, register_req("ann@x.com")).await.unwrap();

        // No key stored yet: any presented key is forbidden.
        assert!(matches!(check_api_key(&user, Some("x")), Err(AuthError::InvalidApiKey)));

        let key = issue_api_key(&state, user.id).await.unwrap();
        let user = state.users.find_by_id(user.id).await.unwrap().unwrap();
        assert!(check_api_key(&user, Some(&key)).is_ok());
        assert!(matches!(check_api_key(&user, None), Err(AuthError::MissingApiKey)));
        assert!(matches!(check_api_key(&user, Some("wrong")), Err(AuthError::InvalidApiKey)));

        let replacement = issue_api_key(&state, user.id).await.unwrap();
        let user = state.users.find_by_id(user.id).await.unwrap().unwrap();
        assert!(matches!(check_api_key(&user, Some(&key)), Err(AuthError::InvalidApiKey)));
        assert!(check_api_key(&user, Some(&replacement)).is_ok());
    }
}
