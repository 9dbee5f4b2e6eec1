//! Authorization code issuance

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::TokenConfig;
use crate::generator::{expires_after, LifetimeOverflow, TokenGenerator};
use crate::model::{AuthorizationCode, Client, NewAuthorizationCode, UserAccount};
use crate::store::{CredentialStore, StoreError};

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("redirect_uri does not match the registered value")]
    InvalidRedirect,
    #[error("cannot compute code expiry: {0}")]
    Lifetime(#[from] LifetimeOverflow),
    #[error("failed to store authorization code: {0}")]
    Internal(#[from] StoreError),
}

/// A newly issued code. `code` is the only copy of the raw string; the store
/// keeps its digest.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub record: AuthorizationCode,
}

pub struct CodeIssuer {
    store: Arc<dyn CredentialStore>,
    generator: Arc<dyn TokenGenerator>,
    config: TokenConfig,
}

impl CodeIssuer {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        generator: Arc<dyn TokenGenerator>,
        config: TokenConfig,
    ) -> Self {
        Self {
            store,
            generator,
            config,
        }
    }

    /// Issue a single-use code binding `client`, `user`, and `redirect_uri`.
    ///
    /// A code-string collision is retried once with a fresh string.
    pub fn issue(
        &self,
        client: &Client,
        user: &UserAccount,
        redirect_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, IssueError> {
        if redirect_uri != client.redirect_uri {
            return Err(IssueError::InvalidRedirect);
        }

        let expires_at = expires_after(now, self.config.authorization_code_lifetime_secs)?;
        let new_code = || NewAuthorizationCode {
            client_id: client.id,
            redirect_uri: client.redirect_uri.clone(),
            user_account_id: user.id,
            code: self.generator.random_string(self.config.token_length),
            expires_at,
        };

        let mut pending = new_code();
        let record = match self.store.insert_authorization_code(pending.clone()) {
            Err(e) if e.is_conflict() => {
                tracing::warn!("Authorization code collision, regenerating");
                pending = new_code();
                self.store.insert_authorization_code(pending.clone())?
            }
            other => other?,
        };

        tracing::info!(
            "Issued authorization code for client {} and user {}",
            client.client_id,
            user.id
        );
        Ok(IssuedCode {
            code: pending.code,
            record,
        })
    }
}
