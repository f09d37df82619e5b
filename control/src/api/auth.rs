use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
    Extension, Json,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{json_body, ApiResult};
use super::AppState;
use crate::db::{execute_async, now_secs};
use crate::error::DeployError;
use crate::services::auth;
use crate::types::{
    LoginRequest, LoginResponse, RegisterUserRequest, User, ValidateSessionResponse,
};

/// The authenticated caller, attached by [`require_session`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

/// Bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Reject requests without a valid session.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| DeployError::Auth("missing bearer token".to_string()))?;
    let now = now_secs();
    let user = execute_async(&state.db, move |conn| {
        auth::validate_session(conn, &token, now)
    })
    .await?;
    debug!(user = %user.username, "Authenticated request");
    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}

/// POST /api/v1/auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterUserRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let req = json_body(payload)?;
    let user = execute_async(&state.db, move |conn| {
        auth::register_user(conn, &req, now_secs())
    })
    .await?;
    info!(user = %user.username, "User registered");
    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<LoginResponse>> {
    let req = json_body(payload)?;
    let ttl = state.settings.session_ttl_secs;
    let session = execute_async(&state.db, move |conn| {
        auth::login(conn, &req, now_secs(), ttl)
    })
    .await?;
    info!(user = %session.user.username, "User logged in");
    Ok(Json(session))
}

/// GET /api/v1/auth/validate
pub async fn validate(
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Json<ValidateSessionResponse> {
    Json(ValidateSessionResponse { valid: true, user })
}

/// POST /api/v1/auth/logout - Ends the session and drops the cached GitHub token
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    if let Some(token) = bearer_token(&headers) {
        execute_async(&state.db, move |conn| auth::end_session(conn, &token)).await?;
    }
    state.credentials.forget(&user.id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_app;
    use axum::http::Method;
    use serde_json::json;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));
        headers.insert(header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let app = test_app();
        let token = app.login().await;

        let (status, body) = app
            .call(Method::GET, "/api/v1/auth/validate", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);
        assert_eq!(body["user"]["username"], "ops");

        let (status, _) = app
            .call(Method::POST, "/api/v1/auth/logout", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = app
            .call(Method::GET, "/api/v1/auth/validate", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_register_validation_and_conflict() {
        let app = test_app();
        let (status, body) = app
            .call(
                Method::POST,
                "/api/v1/auth/register",
                None,
                Some(json!({"email": "x", "username": "ab", "password": "short"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "VALIDATION_ERROR");
        assert_eq!(body["details"].as_array().unwrap().len(), 3);

        app.login().await;
        let (status, body) = app
            .call(
                Method::POST,
                "/api/v1/auth/register",
                None,
                Some(json!({
                    "email": "ops@example.com",
                    "username": "ops2",
                    "password": "hunter2hunter2"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_bad_login_is_unauthorized() {
        let app = test_app();
        app.login().await;
        let (status, body) = app
            .call(
                Method::POST,
                "/api/v1/auth/login",
                None,
                Some(json!({"email": "ops@example.com", "password": "nope-nope"})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid email or password");
    }
}
