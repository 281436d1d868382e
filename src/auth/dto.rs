use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::User;

pub const MIN_PASSWORD_LEN: usize = 6;
pub const GENDERS: [&str; 3] = ["male", "female", "other"];

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Emails are compared case-insensitively: every lookup and insert goes through this.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Request body for user registration.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub gender: Option<String>,
}

impl RegisterRequest {
    /// Field → message for every rule that fails. Empty when valid.
    pub fn validate(&self) -> BTreeMap<String, String> {
        let mut errors = BTreeMap::new();
        if self.name.trim().is_empty() {
            errors.insert("name".into(), "Name is required".into());
        }
        if !is_valid_email(&normalize_email(&self.email)) {
            errors.insert("email".into(), "Invalid email address".into());
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            errors.insert(
                "password".into(),
                format!("Password must be at least {MIN_PASSWORD_LEN} characters long"),
            );
        }
        if self.confirm_password.chars().count() < MIN_PASSWORD_LEN {
            errors.insert(
                "confirmPassword".into(),
                format!("Confirm password must be at least {MIN_PASSWORD_LEN} characters long"),
            );
        }
        if let Some(gender) = &self.gender {
            if !GENDERS.contains(&gender.as_str()) {
                errors.insert(
                    "gender".into(),
                    "Gender must be one of: male, female, other".into(),
                );
            }
        }
        errors
    }
}

/// Request body for login.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn validate(&self) -> BTreeMap<String, String> {
        let mut errors = BTreeMap::new();
        if !is_valid_email(&normalize_email(&self.email)) {
            errors.insert("email".into(), "Invalid email address".into());
        }
        if self.password.is_empty() {
            errors.insert("password".into(), "Password is required".into());
        }
        errors
    }
}

/// Optional body for token refresh; the cookie wins when both are present.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

/// Public part of the user returned to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub image: Option<String>,
    pub gender: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            image: user.image.clone(),
            gender: user.gender.clone(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Body of login: the refresh token only travels as a cookie.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub user: PublicUser,
    pub access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshData {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyData {
    pub api_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RegisterRequest {
        RegisterRequest {
            name: "Ann".into(),
            email: "ann@x.com".into(),
            password: "secret1".into(),
            confirm_password: "secret1".into(),
            gender: None,
        }
    }

    #[test]
    fn valid_registration_has_no_errors() {
        assert!(valid().validate().is_empty());
    }

    #[test]
    fn each_broken_field_is_reported() {
        let req = RegisterRequest {
            name: " ".into(),
            email: "nope".into(),
            password: "123".into(),
            confirm_password: "".into(),
            gender: Some("robot".into()),
        };
        let errors = req.validate();
        for field in ["name", "email", "password", "confirmPassword", "gender"] {
            assert!(errors.contains_key(field), "missing error for {field}");
        }
    }

    #[test]
    fn camel_case_body_deserializes() {
        let req: RegisterRequest = serde_json::from_str(
            r#"{"name":"Ann","email":"ann@x.com","password":"secret1","confirmPassword":"secret1","gender":"female"}"#,
        )
        .unwrap();
        assert_eq!(req.confirm_password, "secret1");
        assert_eq!(req.gender.as_deref(), Some("female"));
    }

    #[test]
    fn missing_fields_fall_back_to_validation() {
        let req: RegisterRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.validate().len(), 4);
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  Ann@X.com "), "ann@x.com");
        assert!(is_valid_email("ann@x.com"));
        assert!(!is_valid_email("ann@x"));
        assert!(!is_valid_email("ann x@x.com"));
    }

    #[test]
    fn public_user_has_no_secret_fields() {
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            name: "Ann".into(),
            email: "ann@x.com".into(),
            password_hash: "$argon2id$secret".into(),
            image: None,
            gender: None,
            refresh_token: Some("refresh".into()),
            api_key: Some("key".into()),
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(PublicUser::from(&user)).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["password", "passwordHash", "password_hash", "refreshToken", "apiKey"] {
            assert!(!obj.contains_key(key), "{key} leaked");
        }
        assert!(!json.to_string().contains("argon2"));
    }
}
