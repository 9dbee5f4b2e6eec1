//! Token Endpoint
//!
//! Handles:
//! - Authorization code exchange
//! - Refresh token grants

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::Serialize;

use crate::grant::{GrantError, GrantRequest, TokenForm, TokenResponse};
use crate::AppState;

use super::{error_response, form_rejection, internal_error};

#[derive(Debug, Serialize)]
struct TokenSuccess {
    success: bool,
    #[serde(flatten)]
    token: TokenResponse,
}

/// Handler for `POST /auth/token`
pub async fn handler(
    State(state): State<Arc<AppState>>,
    form: Result<Form<TokenForm>, FormRejection>,
) -> Response {
    let Form(form) = match form {
        Ok(form) => form,
        Err(rejection) => return form_rejection(rejection),
    };
    let request = match GrantRequest::try_from(form) {
        Ok(r) => r,
        Err(e) => return grant_error(e),
    };

    // Secret verification is CPU-bound; keep it off the async workers
    let result = tokio::task::spawn_blocking(move || {
        let now = state.clock.now();
        state.grants.exchange(&request, now)
    })
    .await;

    match result {
        Ok(Ok(token)) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "no-store")],
            Json(TokenSuccess {
                success: true,
                token,
            }),
        )
            .into_response(),
        Ok(Err(e)) => grant_error(e),
        Err(e) => internal_error("Token exchange task failed", e),
    }
}

fn grant_error(err: GrantError) -> Response {
    let status = match &err {
        GrantError::InvalidClient => StatusCode::UNAUTHORIZED,
        GrantError::Lifetime(e) => return internal_error("Token lifetime misconfigured", e),
        GrantError::Internal(e) => return internal_error("Token exchange failed", e),
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, err.code(), err.to_string())
}
