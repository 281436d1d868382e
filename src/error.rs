use std::collections::BTreeMap;

use axum::{
    body::{to_bytes, Body},
    extract::{rejection::JsonRejection, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

use crate::state::AppState;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub errors: serde_json::Value,
    pub source: Option<anyhow::Error>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    status_code: u16,
    message: &'a str,
    success: bool,
    errors: &'a serde_json::Value,
}

/// Debug rendering of an error's cause chain, carried on the response until
/// [`attach_error_stack`] decides whether the client may see it.
#[derive(Debug, Clone)]
pub struct ErrorStack(pub String);

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            errors: json!([]),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            errors: json!(fields),
            ..Self::new(StatusCode::BAD_REQUEST, message)
        }
    }

    pub fn too_many_requests() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many requests, please try again later.",
        )
    }

    pub fn internal(source: anyhow::Error) -> Self {
        Self {
            source: Some(source),
            ..Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("body".to_string(), rejection.body_text());
        Self::validation("Validation error", fields)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(source) = &self.source {
            error!(error = ?source, status = %self.status, "request failed");
        }

        let body = ErrorBody {
            status_code: self.status.as_u16(),
            message: &self.message,
            success: false,
            errors: &self.errors,
        };

        let mut response = (self.status, Json(body)).into_response();
        if let Some(source) = self.source {
            response
                .extensions_mut()
                .insert(ErrorStack(format!("{source:?}")));
        }
        response
    }
}

/// Adds `stack` to error envelopes outside production.
pub async fn attach_error_stack(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let Some(ErrorStack(stack)) = response.extensions_mut().remove::<ErrorStack>() else {
        return response;
    };
    if state.config.production {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to buffer error body");
            return Response::from_parts(parts, Body::empty());
        }
    };
    let mut envelope: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(_) => return Response::from_parts(parts, Body::from(bytes)),
    };
    if let Some(obj) = envelope.as_object_mut() {
        obj.insert("stack".into(), serde_json::Value::String(stack));
    }
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(envelope.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware::from_fn_with_state, routing::get, Router};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> (StatusCode, serde_json::Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn failing() -> Result<&'static str, ApiError> {
        Err(ApiError::internal(anyhow::anyhow!("db password=hunter2")))
    }

    fn app(production: bool) -> Router {
        let mut state = AppState::fake();
        let mut config = (*state.config).clone();
        config.production = production;
        state.config = Arc::new(config);

        Router::new()
            .route("/boom", get(failing))
            .layer(from_fn_with_state(state.clone(), attach_error_stack))
            .with_state(state)
    }

    fn boom() -> Request {
        axum::http::Request::builder()
            .uri("/boom")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn validation_error_carries_field_map() {
        let mut fields = BTreeMap::new();
        fields.insert("email".to_string(), "Invalid email address".to_string());
        let response = ApiError::validation("Validation error", fields).into_response();
        assert!(response.extensions().get::<ErrorStack>().is_none());
        let (status, json) = body_json(response).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["statusCode"], 400);
        assert_eq!(json["success"], false);
        assert_eq!(json["errors"]["email"], "Invalid email address");
        assert!(json.get("stack").is_none());
    }

    #[tokio::test]
    async fn internal_error_hides_cause_in_message() {
        let response = ApiError::internal(anyhow::anyhow!("connection refused")).into_response();
        let stack = response.extensions().get::<ErrorStack>().cloned().unwrap();
        assert!(stack.0.contains("connection refused"));

        let (status, json) = body_json(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["message"], "Internal server error");
        assert!(json.get("stack").is_none());
    }

    #[tokio::test]
    async fn production_never_sends_stack() {
        let response = app(true).oneshot(boom()).await.unwrap();
        assert!(response.extensions().get::<ErrorStack>().is_none());
        let (status, json) = body_json(response).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json.get("stack").is_none());
        assert!(!json.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn development_sends_stack() {
        let (status, json) = body_json(app(false).oneshot(boom()).await.unwrap()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["success"], false);
        assert!(json["stack"].as_str().unwrap().contains("hunter2"));
    }
}
