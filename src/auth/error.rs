use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::error::ApiError;

/// Failures of the auth core. Every variant maps to exactly one response.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Validation error")]
    Validation(BTreeMap<String, String>),

    #[error("Passwords do not match")]
    PasswordMismatch,

    #[error("User already exists")]
    DuplicateEmail,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("You are not logged in! Please log in to get access.")]
    NotLoggedIn,

    #[error("Invalid token. Please log in again.")]
    InvalidToken,

    #[error("The user belonging to this token no longer exists.")]
    UserGone,

    #[error("Refresh token is required")]
    MissingRefreshToken,

    #[error("Invalid or expired refresh token")]
    InvalidRefreshToken,

    #[error("API key is required for this route.")]
    MissingApiKey,

    #[error("Forbidden: Invalid API key.")]
    InvalidApiKey,

    #[error("User not found")]
    UserNotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation(_) | AuthError::PasswordMismatch => StatusCode::BAD_REQUEST,
            AuthError::DuplicateEmail => StatusCode::CONFLICT,
            AuthError::InvalidCredentials
            | AuthError::NotLoggedIn
            | AuthError::InvalidToken
            | AuthError::UserGone
            | AuthError::MissingRefreshToken
            | AuthError::InvalidRefreshToken
            | AuthError::MissingApiKey => StatusCode::UNAUTHORIZED,
            AuthError::InvalidApiKey => StatusCode::FORBIDDEN,
            AuthError::UserNotFound => StatusCode::NOT_FOUND,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = err.status();
        match err {
            AuthError::Validation(fields) => ApiError::validation("Validation error", fields),
            AuthError::Internal(source) => ApiError::internal(source),
            other => ApiError::new(status, other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(AuthError::Validation(BTreeMap::new()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AuthError::PasswordMismatch.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AuthError::DuplicateEmail.status(), StatusCode::CONFLICT);
        assert_eq!(AuthError::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::InvalidRefreshToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::MissingApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::InvalidApiKey.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AuthError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_message_is_not_leaked() {
        let api: ApiError = AuthError::Internal(anyhow::anyhow!("db password wrong")).into();
        assert_eq!(api.message, "Internal server error");
    }
}
