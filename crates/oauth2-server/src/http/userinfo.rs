//! Protected resource: the bearer's account details
//!
//! Resolves the `Authorization: Bearer <token>` header to a user. Returns 401
//! with a `WWW-Authenticate` challenge when the header is missing, malformed,
//! or carries an unknown or expired token.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::validator::ValidationError;
use crate::AppState;

use super::{internal_error, ErrorBody};

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub subscriber_id: String,
    pub country_code: String,
}

fn unauthorized(challenge: &'static str, description: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(ErrorBody {
            success: false,
            error: "invalid_token",
            error_description: description.to_string(),
        }),
    )
        .into_response()
}

/// Extract the token from a `Bearer` authorization header. The scheme name
/// is case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth_str = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = auth_str.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Handler for `GET /userinfo`
pub async fn handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        tracing::debug!("Missing or malformed Authorization header");
        return unauthorized("Bearer", "Missing bearer token");
    };

    match state.validator.resolve(token, state.clock.now()) {
        Ok(user) => Json(UserInfo {
            subscriber_id: user.subscriber_id,
            country_code: user.country,
        })
        .into_response(),
        Err(ValidationError::Unauthorized) => unauthorized(
            "Bearer error=\"invalid_token\"",
            "Invalid or expired token",
        ),
        Err(ValidationError::Store(e)) => internal_error("Token lookup failed", e),
    }
}
