//! OAuth2 authorization server
//!
//! Provides:
//! - Resource-owner login issuing single-use authorization codes
//! - Authorization code and refresh token grants
//! - Bearer token validation for protected resources (`/userinfo`)
//!
//! The grant engine (`authn`, `issuer`, `grant`, `validator`) is synchronous
//! and talks to persistence only through [`store::CredentialStore`]. The
//! `http` module is the axum surface over it.

pub mod authn;
pub mod clock;
pub mod config;
pub mod generator;
pub mod grant;
pub mod http;
pub mod issuer;
pub mod model;
pub mod secret;
pub mod store;
pub mod validator;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::authn::Authenticator;
use crate::clock::Clock;
use crate::config::Config;
use crate::generator::TokenGenerator;
use crate::grant::GrantProcessor;
use crate::issuer::CodeIssuer;
use crate::secret::SecretVerifier;
use crate::store::CredentialStore;
use crate::validator::TokenValidator;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn CredentialStore>,
    pub clock: Arc<dyn Clock>,
    pub authenticator: Authenticator,
    pub issuer: CodeIssuer,
    pub grants: GrantProcessor,
    pub validator: TokenValidator,
}

impl AppState {
    /// Wire the grant engine over its collaborators
    pub fn new(
        config: Config,
        store: Arc<dyn CredentialStore>,
        verifier: Arc<dyn SecretVerifier>,
        generator: Arc<dyn TokenGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tokens = config.tokens.clone();
        Self {
            authenticator: Authenticator::new(store.clone(), verifier.clone()),
            issuer: CodeIssuer::new(store.clone(), generator.clone(), tokens.clone()),
            grants: GrantProcessor::new(store.clone(), verifier, generator, tokens),
            validator: TokenValidator::new(store.clone()),
            config,
            store,
            clock,
        }
    }
}

/// Build the HTTP router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Login page
        .route("/", get(http::login::page_handler))
        // Resource-owner login, issues an authorization code
        .route("/auth/login", post(http::login::handler))
        // Token endpoint
        .route("/auth/token", post(http::token::handler))
        // Protected resource
        .route("/userinfo", get(http::userinfo::handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
