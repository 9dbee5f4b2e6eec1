//! Resource-owner login
//!
//! `GET /` renders the login form; `POST /auth/login` checks the credentials
//! and issues an authorization code for the requesting client. JSON callers
//! (`Accept: application/json`) get the code in the body; browsers are
//! redirected to the client's redirect URI with `code` and `state` appended.

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    Form, Json,
};
use serde::{Deserialize, Serialize};

use crate::authn::AuthnError;
use crate::issuer::{IssueError, IssuedCode};
use crate::AppState;

use super::{error_response, form_rejection, html, internal_error};

/// Login form (form-encoded)
#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Country selected on the login page; informational only
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Opaque client state, echoed back unchanged
    #[serde(default)]
    pub state: Option<String>,
    /// Must be "code"
    #[serde(default)]
    pub response_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub code: String,
}

/// Query parameters carried into the login page
#[derive(Debug, Default, Deserialize)]
pub struct LoginPageQuery {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub response_type: Option<String>,
}

/// Handler for `GET /`
pub async fn page_handler(Query(query): Query<LoginPageQuery>) -> Html<String> {
    Html(html::login_page(&query))
}

fn missing(field: &str) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        format!("{} is required", field),
    )
}

/// Handler for `POST /auth/login`
pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Response {
    let Form(form) = match form {
        Ok(form) => form,
        Err(rejection) => return form_rejection(rejection),
    };
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));

    if form.response_type.as_deref() != Some("code") {
        return error_response(
            StatusCode::BAD_REQUEST,
            "unsupported_response_type",
            "Only response_type=code is supported",
        );
    }
    let Some(client_id) = form.client_id.clone() else {
        return missing("client_id");
    };
    let Some(redirect_uri) = form.redirect_uri.clone() else {
        return missing("redirect_uri");
    };
    let (Some(username), Some(password)) = (form.username.clone(), form.password.clone()) else {
        return missing("username and password");
    };

    let worker_state = Arc::clone(&state);
    let issued = tokio::task::spawn_blocking(move || -> Result<IssuedCode, LoginError> {
        let now = worker_state.clock.now();
        let client = worker_state.authenticator.client(&client_id)?;
        // Checked before the password so a bad redirect never reaches the issuer
        if client.redirect_uri != redirect_uri {
            return Err(LoginError::Issue(IssueError::InvalidRedirect));
        }
        let user = worker_state.authenticator.authenticate(&username, &password)?;
        Ok(worker_state.issuer.issue(&client, &user, &redirect_uri, now)?)
    })
    .await;

    let IssuedCode { code, record } = match issued {
        Ok(Ok(issued)) => issued,
        Ok(Err(e)) => return login_error(e),
        Err(e) => return internal_error("Login task failed", e),
    };

    if let Some(country) = &form.country {
        tracing::debug!("Login for user {} from country {}", record.user_account_id, country);
    }

    if wants_json {
        return Json(LoginResponse {
            success: true,
            redirect_uri: record.redirect_uri,
            state: form.state,
            code,
        })
        .into_response();
    }

    match callback_url(&record.redirect_uri, &code, form.state.as_deref()) {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => internal_error("Registered redirect_uri is not a valid URL", e),
    }
}

enum LoginError {
    Authn(AuthnError),
    Issue(IssueError),
}

impl From<AuthnError> for LoginError {
    fn from(e: AuthnError) -> Self {
        LoginError::Authn(e)
    }
}

impl From<IssueError> for LoginError {
    fn from(e: IssueError) -> Self {
        LoginError::Issue(e)
    }
}

fn login_error(err: LoginError) -> Response {
    match err {
        // Unknown user and wrong password are indistinguishable to the caller
        LoginError::Authn(AuthnError::Failure(_)) => error_response(
            StatusCode::UNAUTHORIZED,
            "access_denied",
            "Invalid username or password",
        ),
        LoginError::Authn(AuthnError::UnknownClient) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_client",
            "Unknown client_id",
        ),
        LoginError::Authn(AuthnError::Store(e)) => internal_error("Login lookup failed", e),
        LoginError::Issue(IssueError::InvalidRedirect) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "redirect_uri does not match the registered value",
        ),
        LoginError::Issue(IssueError::Lifetime(e)) => {
            internal_error("Authorization code lifetime misconfigured", e)
        }
        LoginError::Issue(IssueError::Internal(e)) => {
            internal_error("Failed to issue authorization code", e)
        }
    }
}

/// Append `code` and `state` to the client's redirect URI
fn callback_url(redirect_uri: &str, code: &str, state: Option<&str>) -> Result<String, url::ParseError> {
    let mut url = url::Url::parse(redirect_uri)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", code);
        if let Some(s) = state {
            pairs.append_pair("state", s);
        }
    }
    Ok(url.to_string())
}
