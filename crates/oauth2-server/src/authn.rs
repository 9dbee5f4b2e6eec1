//! Resource-owner authentication and client lookup for the login path.

use std::sync::Arc;

use thiserror::Error;

use crate::model::{Client, UserAccount};
use crate::secret::{SecretVerifier, DUMMY_HASH};
use crate::store::{CredentialStore, StoreError};

/// Why a username/password pair was rejected.
///
/// The distinction exists for logging only; callers must surface both as the
/// same generic failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("no such user")]
    NotFound,
    #[error("bad credentials")]
    BadCredentials,
}

#[derive(Debug, Error)]
pub enum AuthnError {
    #[error(transparent)]
    Failure(#[from] AuthFailure),
    #[error("unknown client")]
    UnknownClient,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    verifier: Arc<dyn SecretVerifier>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, verifier: Arc<dyn SecretVerifier>) -> Self {
        Self { store, verifier }
    }

    /// Verify a username/password pair
    pub fn authenticate(&self, username: &str, password: &str) -> Result<UserAccount, AuthnError> {
        let Some(user) = self.store.find_user_by_username(username)? else {
            // Same hashing work as a wrong password, so timing does not reveal the account
            self.verifier.verify(password, DUMMY_HASH);
            tracing::debug!("Login rejected: unknown username");
            return Err(AuthFailure::NotFound.into());
        };

        if !self.verifier.verify(password, &user.password_hash) {
            tracing::debug!("Login rejected: password mismatch for user {}", user.id);
            return Err(AuthFailure::BadCredentials.into());
        }

        Ok(user)
    }

    /// Look up a registered client by its public identifier
    pub fn client(&self, client_id: &str) -> Result<Client, AuthnError> {
        self.store
            .find_client_by_client_id(client_id)?
            .ok_or(AuthnError::UnknownClient)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{NewClient, NewUserAccount};
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    /// Treats the stored hash as the plaintext itself
    pub(crate) struct PlainVerifier;

    impl SecretVerifier for PlainVerifier {
        fn verify(&self, plaintext: &str, hash: &str) -> bool {
            plaintext == hash
        }
    }

    /// `PlainVerifier` that records every hash it was asked to check
    #[derive(Default)]
    pub(crate) struct RecordingVerifier(Mutex<Vec<String>>);

    impl RecordingVerifier {
        pub(crate) fn hashes(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl SecretVerifier for RecordingVerifier {
        fn verify(&self, plaintext: &str, hash: &str) -> bool {
            self.0.lock().unwrap().push(hash.to_string());
            plaintext == hash
        }
    }

    fn authenticator() -> Authenticator {
        authenticator_with(Arc::new(PlainVerifier))
    }

    fn authenticator_with(verifier: Arc<dyn SecretVerifier>) -> Authenticator {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_user(NewUserAccount {
                username: "user1@example.com".into(),
                password_hash: "secret".into(),
                country: "AR".into(),
                subscriber_id: "subscriber1".into(),
            })
            .unwrap();
        store
            .insert_client(NewClient {
                name: "client name".into(),
                client_id: "client1".into(),
                client_secret_hash: "secret".into(),
                redirect_uri: "https://example.org/cb".into(),
            })
            .unwrap();
        Authenticator::new(store, verifier)
    }

    #[test]
    fn test_authenticate_success() {
        let user = authenticator()
            .authenticate("user1@example.com", "secret")
            .unwrap();
        assert_eq!(user.subscriber_id, "subscriber1");
        assert_eq!(user.country, "AR");
    }

    #[test]
    fn test_authenticate_unknown_user() {
        let err = authenticator()
            .authenticate("nobody@example.com", "secret")
            .unwrap_err();
        assert!(matches!(err, AuthnError::Failure(AuthFailure::NotFound)));
    }

    #[test]
    fn test_authenticate_bad_password() {
        let err = authenticator()
            .authenticate("user1@example.com", "wrong")
            .unwrap_err();
        assert!(matches!(err, AuthnError::Failure(AuthFailure::BadCredentials)));
    }

    #[test]
    fn test_unknown_user_costs_one_verification() {
        let verifier = Arc::new(RecordingVerifier::default());
        let authn = authenticator_with(verifier.clone());

        authn.authenticate("user1@example.com", "wrong").unwrap_err();
        authn.authenticate("nobody@example.com", "wrong").unwrap_err();

        assert_eq!(verifier.hashes(), vec!["secret".to_string(), DUMMY_HASH.to_string()]);
    }

    #[test]
    fn test_client_lookup() {
        let authn = authenticator();
        assert_eq!(authn.client("client1").unwrap().redirect_uri, "https://example.org/cb");
        assert!(matches!(authn.client("nope"), Err(AuthnError::UnknownClient)));
    }
}
