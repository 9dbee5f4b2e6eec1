//! Persisted entities: user accounts, clients, authorization codes, and tokens.
//!
//! Every record carries a surrogate integer id assigned by the store. The
//! `New*` variants are what callers hand to the store before an id exists.
//! Codes and token strings arrive raw in the `New*` forms; stored records only
//! keep their digests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A resource owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    /// Login identifier, unique across accounts
    pub username: String,
    pub password_hash: String,
    /// Country code (e.g. "AR")
    pub country: String,
    /// Opaque external identifier handed to resource servers
    pub subscriber_id: String,
}

#[derive(Debug, Clone)]
pub struct NewUserAccount {
    pub username: String,
    pub password_hash: String,
    pub country: String,
    pub subscriber_id: String,
}

/// A registered application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    /// Public client identifier, unique across clients
    pub client_id: String,
    pub client_secret_hash: String,
    /// Compared byte-for-byte, never normalized
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    pub client_id: String,
    pub client_secret_hash: String,
    pub redirect_uri: String,
}

/// A single-use authorization code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub id: i64,
    /// Surrogate id of the owning client
    pub client_id: i64,
    /// Copied from the client at issuance
    pub redirect_uri: String,
    pub user_account_id: i64,
    /// Digest of the code string
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationCode {
    /// A code is usable only strictly before its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct NewAuthorizationCode {
    pub client_id: i64,
    pub redirect_uri: String,
    pub user_account_id: i64,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// An access/refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub client_id: i64,
    pub user_account_id: i64,
    pub access_token_hash: String,
    pub refresh_token_hash: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl Token {
    pub fn access_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.access_token_expires_at
    }

    pub fn refresh_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_token_expires_at
    }
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub client_id: i64,
    pub user_account_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}
