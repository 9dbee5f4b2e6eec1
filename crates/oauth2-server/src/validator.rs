//! Bearer token resolution for protected resources

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::UserAccount;
use crate::store::{CredentialStore, StoreError};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid or expired token")]
    Unauthorized,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read-only: resolving a token never mutates the store.
pub struct TokenValidator {
    store: Arc<dyn CredentialStore>,
}

impl TokenValidator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolve an access token to the user it was issued for
    pub fn resolve(&self, bearer: &str, now: DateTime<Utc>) -> Result<UserAccount, ValidationError> {
        let Some(token) = self.store.find_token_by_access_token(bearer)? else {
            tracing::debug!("Unknown access token");
            return Err(ValidationError::Unauthorized);
        };

        if token.access_expired(now) {
            tracing::debug!("Expired access token for user {}", token.user_account_id);
            return Err(ValidationError::Unauthorized);
        }

        self.store
            .find_user(token.user_account_id)?
            .ok_or(ValidationError::Unauthorized)
    }
}
