use axum::http::{
    header::{AUTHORIZATION, COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use std::time::Duration;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

fn build_cookie(name: &str, value: &str, max_age: Duration, secure: bool) -> Option<HeaderValue> {
    let mut cookie = format!(
        "{name}={value}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).ok()
}

/// Append `Set-Cookie` for both tokens.
pub fn set_token_cookies(
    headers: &mut HeaderMap,
    access_token: &str,
    access_ttl: Duration,
    refresh_token: &str,
    refresh_ttl: Duration,
    secure: bool,
) {
    if let Some(c) = build_cookie(ACCESS_COOKIE, access_token, access_ttl, secure) {
        headers.append(SET_COOKIE, c);
    }
    if let Some(c) = build_cookie(REFRESH_COOKIE, refresh_token, refresh_ttl, secure) {
        headers.append(SET_COOKIE, c);
    }
}

/// Expire both token cookies.
pub fn clear_token_cookies(headers: &mut HeaderMap, secure: bool) {
    for name in [ACCESS_COOKIE, REFRESH_COOKIE] {
        if let Some(c) = build_cookie(name, "", Duration::ZERO, secure) {
            headers.append(SET_COOKIE, c);
        }
    }
}

/// Value of cookie `name`, if present and non-empty.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next().map(str::trim);
            let val = parts.next().map(str::trim);
            if let (Some(key), Some(val)) = (key, val) {
                if key == name && !val.is_empty() {
                    return Some(val.to_string());
                }
            }
        }
    }
    None
}

pub fn read_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Access token from the cookie, falling back to the bearer header.
pub fn access_token_from(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, ACCESS_COOKIE).or_else(|| read_bearer(headers))
}
