//! Grant processing: the `authorization_code` and `refresh_token` exchanges.
//!
//! Every exchange authenticates the client first, then inspects the code or
//! refresh token. A failed exchange never mutates the store: the code path
//! goes through a single atomic redeem, the refresh path through a single
//! in-place update.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TokenConfig;
use crate::generator::{expires_after, seconds_remaining, LifetimeOverflow, TokenGenerator};
use crate::model::{Client, NewToken, Token};
use crate::secret::{SecretVerifier, DUMMY_HASH};
use crate::store::{CredentialStore, StoreError};

pub const TOKEN_TYPE: &str = "Bearer";

/// Token request as posted by the client (form-encoded)
#[derive(Debug, Default, Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub grant_type: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// For authorization_code grant
    #[serde(default)]
    pub code: Option<String>,
    /// For authorization_code grant, must match the code's redirect URI
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// For refresh_token grant
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// A validated grant request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantRequest {
    AuthorizationCode {
        client: ClientCredentials,
        code: String,
        redirect_uri: String,
    },
    RefreshToken {
        client: ClientCredentials,
        refresh_token: String,
    },
}

impl GrantRequest {
    fn client(&self) -> &ClientCredentials {
        match self {
            GrantRequest::AuthorizationCode { client, .. } => client,
            GrantRequest::RefreshToken { client, .. } => client,
        }
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, GrantError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(GrantError::InvalidRequest(name))
}

impl TryFrom<TokenForm> for GrantRequest {
    type Error = GrantError;

    fn try_from(form: TokenForm) -> Result<Self, Self::Error> {
        let grant_type = required(form.grant_type, "grant_type")?;
        // Unknown grant types are rejected before any other field is examined
        if grant_type != "authorization_code" && grant_type != "refresh_token" {
            return Err(GrantError::UnsupportedGrantType(grant_type));
        }

        let client = ClientCredentials {
            client_id: required(form.client_id, "client_id")?,
            client_secret: required(form.client_secret, "client_secret")?,
        };

        if grant_type == "authorization_code" {
            Ok(GrantRequest::AuthorizationCode {
                client,
                code: required(form.code, "code")?,
                redirect_uri: required(form.redirect_uri, "redirect_uri")?,
            })
        } else {
            Ok(GrantRequest::RefreshToken {
                client,
                refresh_token: required(form.refresh_token, "refresh_token")?,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidGrantReason {
    NotFound,
    ClientMismatch,
    RedirectMismatch,
    Expired,
}

impl fmt::Display for InvalidGrantReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvalidGrantReason::NotFound => "grant is invalid or already used",
            InvalidGrantReason::ClientMismatch => "grant was issued to another client",
            InvalidGrantReason::RedirectMismatch => "redirect_uri does not match",
            InvalidGrantReason::Expired => "grant has expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("{0} is required")]
    InvalidRequest(&'static str),

    #[error("unsupported grant_type: {0}")]
    UnsupportedGrantType(String),

    #[error("client authentication failed")]
    InvalidClient,

    #[error("{0}")]
    InvalidGrant(InvalidGrantReason),

    #[error("cannot compute token expiry: {0}")]
    Lifetime(#[from] LifetimeOverflow),

    #[error("internal error: {0}")]
    Internal(#[from] StoreError),
}

impl GrantError {
    /// RFC 6749 error code
    pub fn code(&self) -> &'static str {
        match self {
            GrantError::InvalidRequest(_) => "invalid_request",
            GrantError::UnsupportedGrantType(_) => "unsupported_grant_type",
            GrantError::InvalidClient => "invalid_client",
            GrantError::InvalidGrant(_) => "invalid_grant",
            GrantError::Lifetime(_) | GrantError::Internal(_) => "server_error",
        }
    }
}

/// Successful token response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenResponse {
    pub token_type: &'static str,
    pub access_token: String,
    /// Seconds until the access token expires
    pub expires_in: u64,
    pub refresh_token: String,
    /// Seconds until the refresh token expires
    pub refresh_token_expires_in: u64,
}

impl TokenResponse {
    /// `token` only holds digests, so the raw strings are passed alongside it
    pub fn new(
        access_token: String,
        refresh_token: String,
        token: &Token,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            token_type: TOKEN_TYPE,
            access_token,
            expires_in: seconds_remaining(now, token.access_token_expires_at),
            refresh_token,
            refresh_token_expires_in: seconds_remaining(now, token.refresh_token_expires_at),
        }
    }
}

pub struct GrantProcessor {
    store: Arc<dyn CredentialStore>,
    verifier: Arc<dyn SecretVerifier>,
    generator: Arc<dyn TokenGenerator>,
    config: TokenConfig,
}

impl GrantProcessor {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        verifier: Arc<dyn SecretVerifier>,
        generator: Arc<dyn TokenGenerator>,
        config: TokenConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            generator,
            config,
        }
    }

    /// Run a grant to completion at instant `now`
    pub fn exchange(
        &self,
        request: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, GrantError> {
        let client = self.authenticate_client(request.client())?;

        match request {
            GrantRequest::AuthorizationCode {
                code, redirect_uri, ..
            } => self.redeem_code(&client, code, redirect_uri, now),
            GrantRequest::RefreshToken { refresh_token, .. } => {
                self.refresh(&client, refresh_token, now)
            }
        }
    }

    fn authenticate_client(&self, credentials: &ClientCredentials) -> Result<Client, GrantError> {
        let Some(client) = self.store.find_client_by_client_id(&credentials.client_id)? else {
            self.verifier.verify(&credentials.client_secret, DUMMY_HASH);
            tracing::debug!("Token request for unknown client");
            return Err(GrantError::InvalidClient);
        };

        if !self
            .verifier
            .verify(&credentials.client_secret, &client.client_secret_hash)
        {
            tracing::debug!("Client secret mismatch for client {}", client.client_id);
            return Err(GrantError::InvalidClient);
        }

        Ok(client)
    }

    fn redeem_code(
        &self,
        client: &Client,
        code: &str,
        redirect_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, GrantError> {
        let reject = |reason: InvalidGrantReason| {
            tracing::debug!("Rejected authorization code for client {}: {}", client.client_id, reason);
            GrantError::InvalidGrant(reason)
        };

        let Some(stored) = self.store.find_authorization_code(code)? else {
            return Err(reject(InvalidGrantReason::NotFound));
        };
        if stored.client_id != client.id {
            return Err(reject(InvalidGrantReason::ClientMismatch));
        }
        if stored.redirect_uri != redirect_uri {
            return Err(reject(InvalidGrantReason::RedirectMismatch));
        }
        if stored.is_expired(now) {
            return Err(reject(InvalidGrantReason::Expired));
        }

        let access_token_expires_at = expires_after(now, self.config.access_token_lifetime_secs)?;
        let refresh_token_expires_at = expires_after(now, self.config.refresh_token_lifetime_secs)?;
        let new_token = || NewToken {
            client_id: stored.client_id,
            user_account_id: stored.user_account_id,
            access_token: self.generator.random_string(self.config.token_length),
            refresh_token: self.generator.random_string(self.config.token_length),
            access_token_expires_at,
            refresh_token_expires_at,
        };

        let mut pending = new_token();
        let redeemed = match self.store.redeem_authorization_code(code, pending.clone()) {
            Err(e) if e.is_conflict() => {
                tracing::warn!("Token string collision, regenerating");
                pending = new_token();
                self.store.redeem_authorization_code(code, pending.clone())?
            }
            other => other?,
        };

        // A concurrent exchange consumed the code between lookup and redeem
        let token = redeemed.ok_or_else(|| reject(InvalidGrantReason::NotFound))?;

        tracing::info!(
            "Issued access token for client {} and user {}",
            client.client_id,
            token.user_account_id
        );
        Ok(TokenResponse::new(
            pending.access_token,
            pending.refresh_token,
            &token,
            now,
        ))
    }

    fn refresh(
        &self,
        client: &Client,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, GrantError> {
        let reject = |reason: InvalidGrantReason| {
            tracing::debug!("Rejected refresh token for client {}: {}", client.client_id, reason);
            GrantError::InvalidGrant(reason)
        };

        let Some(stored) = self.store.find_token_by_refresh_token(refresh_token)? else {
            return Err(reject(InvalidGrantReason::NotFound));
        };
        if stored.client_id != client.id {
            return Err(reject(InvalidGrantReason::ClientMismatch));
        }
        if stored.refresh_expired(now) {
            return Err(reject(InvalidGrantReason::Expired));
        }

        let expires_at = expires_after(now, self.config.access_token_lifetime_secs)?;
        let generate = || self.generator.random_string(self.config.token_length);

        // Refresh token and its expiry stay as they are; only the access side rotates
        let mut access_token = generate();
        let token = match self
            .store
            .reissue_access_token(stored.id, access_token.clone(), expires_at)
        {
            Err(e) if e.is_conflict() => {
                tracing::warn!("Access token collision on refresh, regenerating");
                access_token = generate();
                self.store
                    .reissue_access_token(stored.id, access_token.clone(), expires_at)?
            }
            other => other?,
        };

        tracing::info!(
            "Refreshed access token for client {} and user {}",
            client.client_id,
            token.user_account_id
        );
        Ok(TokenResponse::new(
            access_token,
            refresh_token.to_string(),
            &token,
            now,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::tests::{PlainVerifier, RecordingVerifier};
    use crate::generator::RandomGenerator;
    use crate::issuer::tests::ScriptedGenerator;
    use crate::issuer::{CodeIssuer, IssuedCode};
    use crate::model::{NewClient, NewUserAccount, UserAccount};
    use crate::store::MemoryStore;
    use chrono::Duration;

    const REDIRECT: &str = "https://example.org/cb";

    struct Fixture {
        store: Arc<MemoryStore>,
        user: UserAccount,
        client: Client,
        other_client: Client,
        issuer: CodeIssuer,
        processor: GrantProcessor,
    }

    fn fixture_with(generator: Arc<dyn TokenGenerator>) -> Fixture {
        fixture_custom(generator, Arc::new(PlainVerifier), TokenConfig::default())
    }

    fn fixture_custom(
        generator: Arc<dyn TokenGenerator>,
        verifier: Arc<dyn SecretVerifier>,
        config: TokenConfig,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let user = store
            .insert_user(NewUserAccount {
                username: "user1@example.com".into(),
                password_hash: "secret".into(),
                country: "AR".into(),
                subscriber_id: "subscriber1".into(),
            })
            .unwrap();
        let client = store
            .insert_client(NewClient {
                name: "client name".into(),
                client_id: "client1".into(),
                client_secret_hash: "secret".into(),
                redirect_uri: REDIRECT.into(),
            })
            .unwrap();
        let other_client = store
            .insert_client(NewClient {
                name: "other".into(),
                client_id: "client2".into(),
                client_secret_hash: "secret2".into(),
                redirect_uri: REDIRECT.into(),
            })
            .unwrap();

        let issuer = CodeIssuer::new(
            store.clone(),
            Arc::new(RandomGenerator),
            TokenConfig::default(),
        );
        let processor = GrantProcessor::new(store.clone(), verifier, generator, config);

        Fixture {
            store,
            user,
            client,
            other_client,
            issuer,
            processor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(RandomGenerator))
    }

    impl Fixture {
        fn issue(&self, now: DateTime<Utc>) -> IssuedCode {
            self.issuer
                .issue(&self.client, &self.user, REDIRECT, now)
                .unwrap()
        }
    }

    fn creds(client_id: &str, secret: &str) -> ClientCredentials {
        ClientCredentials {
            client_id: client_id.into(),
            client_secret: secret.into(),
        }
    }

    fn code_request(code: &str, redirect_uri: &str) -> GrantRequest {
        GrantRequest::AuthorizationCode {
            client: creds("client1", "secret"),
            code: code.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    fn refresh_request(refresh_token: &str) -> GrantRequest {
        GrantRequest::RefreshToken {
            client: creds("client1", "secret"),
            refresh_token: refresh_token.into(),
        }
    }

    fn assert_invalid_grant(result: Result<TokenResponse, GrantError>, expected: InvalidGrantReason) {
        match result {
            Err(GrantError::InvalidGrant(reason)) => assert_eq!(reason, expected),
            other => panic!("Expected InvalidGrant({:?}), got {:?}", expected, other),
        }
    }

    #[test]
    fn test_code_exchange_succeeds_exactly_once() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);

        let response = f
            .processor
            .exchange(&code_request(&code.code, REDIRECT), now)
            .unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, 86400);
        assert_eq!(response.refresh_token_expires_in, 2628288);
        assert_ne!(response.access_token, response.refresh_token);

        let replay = f.processor.exchange(&code_request(&code.code, REDIRECT), now);
        assert_invalid_grant(replay, InvalidGrantReason::NotFound);
    }

    #[test]
    fn test_token_copies_client_and_user_from_code() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);

        let response = f
            .processor
            .exchange(&code_request(&code.code, REDIRECT), now)
            .unwrap();
        let token = f
            .store
            .find_token_by_access_token(&response.access_token)
            .unwrap()
            .unwrap();
        assert_eq!(token.client_id, f.client.id);
        assert_eq!(token.user_account_id, f.user.id);
        assert!(token.access_token_expires_at < token.refresh_token_expires_at);
    }

    #[test]
    fn test_expired_code_rejected_and_not_consumed() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);

        let later = code.record.expires_at;
        let result = f.processor.exchange(&code_request(&code.code, REDIRECT), later);
        assert_invalid_grant(result, InvalidGrantReason::Expired);
        assert!(f.store.find_authorization_code(&code.code).unwrap().is_some());
    }

    #[test]
    fn test_code_valid_one_second_before_expiry() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);

        let just_before = code.record.expires_at - Duration::seconds(1);
        f.processor
            .exchange(&code_request(&code.code, REDIRECT), just_before)
            .unwrap();
    }

    #[test]
    fn test_redirect_mismatch_issues_nothing() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);

        for wrong in ["https://example.org/cb/", "https://EXAMPLE.org/cb", "https://evil.example/cb"] {
            let result = f.processor.exchange(&code_request(&code.code, wrong), now);
            assert_invalid_grant(result, InvalidGrantReason::RedirectMismatch);
        }

        // The code survives the failed attempts and still redeems once
        f.processor
            .exchange(&code_request(&code.code, REDIRECT), now)
            .unwrap();
    }

    #[test]
    fn test_code_bound_to_issuing_client() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);

        let request = GrantRequest::AuthorizationCode {
            client: creds(&f.other_client.client_id, "secret2"),
            code: code.code.clone(),
            redirect_uri: REDIRECT.into(),
        };
        assert_invalid_grant(
            f.processor.exchange(&request, now),
            InvalidGrantReason::ClientMismatch,
        );
    }

    #[test]
    fn test_client_auth_precedes_code_inspection() {
        let f = fixture();
        let now = Utc::now();

        let bad_secret = GrantRequest::AuthorizationCode {
            client: creds("client1", "wrong"),
            code: "does-not-exist".into(),
            redirect_uri: REDIRECT.into(),
        };
        assert!(matches!(
            f.processor.exchange(&bad_secret, now),
            Err(GrantError::InvalidClient)
        ));

        let unknown = GrantRequest::RefreshToken {
            client: creds("nobody", "secret"),
            refresh_token: "does-not-exist".into(),
        };
        assert!(matches!(
            f.processor.exchange(&unknown, now),
            Err(GrantError::InvalidClient)
        ));
    }

    #[test]
    fn test_unknown_client_costs_one_verification() {
        let verifier = Arc::new(RecordingVerifier::default());
        let f = fixture_custom(
            Arc::new(RandomGenerator),
            verifier.clone(),
            TokenConfig::default(),
        );
        let unknown = GrantRequest::RefreshToken {
            client: creds("nobody", "secret"),
            refresh_token: "does-not-exist".into(),
        };

        assert!(matches!(
            f.processor.exchange(&unknown, Utc::now()),
            Err(GrantError::InvalidClient)
        ));
        assert_eq!(verifier.hashes(), vec![DUMMY_HASH.to_string()]);
    }

    #[test]
    fn test_out_of_range_lifetime_is_an_error_and_keeps_the_code() {
        let config = TokenConfig {
            refresh_token_lifetime_secs: 1_000_000_000_000_000,
            ..TokenConfig::default()
        };
        let f = fixture_custom(Arc::new(RandomGenerator), Arc::new(PlainVerifier), config);
        let now = Utc::now();
        let code = f.issue(now);

        let err = f
            .processor
            .exchange(&code_request(&code.code, REDIRECT), now)
            .unwrap_err();
        assert!(matches!(err, GrantError::Lifetime(_)));
        assert_eq!(err.code(), "server_error");
        assert!(f.store.find_authorization_code(&code.code).unwrap().is_some());
    }

    #[test]
    fn test_stored_token_holds_digests_only() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);
        let response = f
            .processor
            .exchange(&code_request(&code.code, REDIRECT), now)
            .unwrap();

        let token = f
            .store
            .find_token_by_refresh_token(&response.refresh_token)
            .unwrap()
            .unwrap();
        assert_eq!(token.access_token_hash, crate::store::hash_token(&response.access_token));
        assert_ne!(token.access_token_hash, response.access_token);
        assert_ne!(token.refresh_token_hash, response.refresh_token);
    }

    #[test]
    fn test_unknown_code_rejected() {
        let f = fixture();
        let result = f
            .processor
            .exchange(&code_request("nope", REDIRECT), Utc::now());
        assert_invalid_grant(result, InvalidGrantReason::NotFound);
    }

    #[test]
    fn test_refresh_keeps_refresh_token_and_rotates_access() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);
        let first = f
            .processor
            .exchange(&code_request(&code.code, REDIRECT), now)
            .unwrap();

        let later = now + Duration::seconds(3600);
        let second = f
            .processor
            .exchange(&refresh_request(&first.refresh_token), later)
            .unwrap();
        let third = f
            .processor
            .exchange(&refresh_request(&first.refresh_token), later)
            .unwrap();

        assert_eq!(second.refresh_token, first.refresh_token);
        assert_eq!(third.refresh_token, first.refresh_token);
        assert_ne!(second.access_token, first.access_token);
        assert_ne!(third.access_token, second.access_token);
        assert_eq!(second.expires_in, 86400);
        // Refresh expiry was not extended
        assert_eq!(second.refresh_token_expires_in, 2628288 - 3600);

        // Old access strings no longer resolve to the record
        assert!(
            f.store
                .find_token_by_access_token(&first.access_token)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_refresh_rejected_for_other_client() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);
        let issued = f
            .processor
            .exchange(&code_request(&code.code, REDIRECT), now)
            .unwrap();

        let request = GrantRequest::RefreshToken {
            client: creds("client2", "secret2"),
            refresh_token: issued.refresh_token,
        };
        assert_invalid_grant(
            f.processor.exchange(&request, now),
            InvalidGrantReason::ClientMismatch,
        );
    }

    #[test]
    fn test_expired_refresh_token_rejected() {
        let f = fixture();
        let now = Utc::now();
        let code = f.issue(now);
        let issued = f
            .processor
            .exchange(&code_request(&code.code, REDIRECT), now)
            .unwrap();

        let at_expiry = now + Duration::seconds(2628288);
        let result = f
            .processor
            .exchange(&refresh_request(&issued.refresh_token), at_expiry);
        assert_invalid_grant(result, InvalidGrantReason::Expired);

        // Nothing was rotated by the failed attempt
        assert!(
            f.store
                .find_token_by_access_token(&issued.access_token)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_unknown_refresh_token_rejected() {
        let f = fixture();
        let result = f.processor.exchange(&refresh_request("nope"), Utc::now());
        assert_invalid_grant(result, InvalidGrantReason::NotFound);
    }

    #[test]
    fn test_token_collision_regenerates_once() {
        let f = fixture_with(Arc::new(ScriptedGenerator::new(&[
            "access-1", "refresh-1", // first exchange
            "access-1", "refresh-2", // collides on access
            "access-2", "refresh-3", // retry
        ])));
        let now = Utc::now();

        let first = f.issue(now);
        f.processor
            .exchange(&code_request(&first.code, REDIRECT), now)
            .unwrap();

        let second = f.issue(now);
        let response = f
            .processor
            .exchange(&code_request(&second.code, REDIRECT), now)
            .unwrap();
        assert_eq!(response.access_token, "access-2");
        assert_eq!(response.refresh_token, "refresh-3");
    }

    #[test]
    fn test_parse_authorization_code_form() {
        let form = TokenForm {
            grant_type: Some("authorization_code".into()),
            client_id: Some("client1".into()),
            client_secret: Some("secret".into()),
            code: Some("abc".into()),
            redirect_uri: Some(REDIRECT.into()),
            refresh_token: None,
        };
        assert_eq!(
            GrantRequest::try_from(form).unwrap(),
            code_request("abc", REDIRECT)
        );
    }

    #[test]
    fn test_parse_rejects_unknown_grant_type() {
        let form = TokenForm {
            grant_type: Some("password".into()),
            ..Default::default()
        };
        let err = GrantRequest::try_from(form).unwrap_err();
        assert!(matches!(err, GrantError::UnsupportedGrantType(ref g) if g == "password"));
        assert_eq!(err.code(), "unsupported_grant_type");
    }

    #[test]
    fn test_parse_reports_missing_field() {
        let form = TokenForm {
            grant_type: Some("refresh_token".into()),
            client_id: Some("client1".into()),
            client_secret: Some("secret".into()),
            ..Default::default()
        };
        let err = GrantRequest::try_from(form).unwrap_err();
        assert!(matches!(err, GrantError::InvalidRequest("refresh_token")));
    }
}
