use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use super::{error::AuthError, repo_types::User};

/// The user the identity gate attached to this request.
pub struct AuthUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<User>()
            .cloned()
            .map(AuthUser)
            .ok_or(AuthError::NotLoggedIn)
    }
}
