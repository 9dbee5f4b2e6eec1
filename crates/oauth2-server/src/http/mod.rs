//! HTTP surface: login, token, and userinfo endpoints.
//!
//! Every JSON body carries a `success` flag. Failures add an RFC 6749 style
//! `error` code and a human-readable `error_description`.

pub mod html;
pub mod login;
pub mod token;
pub mod userinfo;

use axum::{
    extract::rejection::FormRejection,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Failure body shared by all endpoints
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub error_description: String,
}

pub fn error_response(status: StatusCode, error: &'static str, description: impl Into<String>) -> Response {
    (
        status,
        [(header::CACHE_CONTROL, "no-store")],
        Json(ErrorBody {
            success: false,
            error,
            error_description: description.into(),
        }),
    )
        .into_response()
}

/// Generic 500; details go to the log, never to the caller
pub fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    tracing::error!("{}: {}", context, err);
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "server_error",
        "Internal server error",
    )
}

/// A body the `Form` extractor refused (wrong content type, bad encoding)
pub fn form_rejection(rejection: FormRejection) -> Response {
    tracing::debug!("Rejected form body: {}", rejection);
    error_response(rejection.status(), "invalid_request", rejection.body_text())
}
