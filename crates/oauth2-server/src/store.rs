//! Credential store: user accounts, clients, authorization codes, and tokens.
//!
//! `CredentialStore` is the contract the grant engine relies on. Besides plain
//! lookups and inserts it provides two compound operations that must be atomic:
//! redeeming an authorization code into a token, and reissuing a token's access
//! string in place.
//!
//! `MemoryStore` keeps each relation in its own `RwLock`. When opened on a
//! directory it writes each relation back to a JSON file after every mutation;
//! a failed write rolls the in-memory change back. Locks are always taken in
//! the order users, clients, codes, tokens.
//!
//! Codes and token strings are never stored raw: lookups and inserts take the
//! raw value and the store keeps its [`hash_token`] digest.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::Engine;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{
    AuthorizationCode, Client, NewAuthorizationCode, NewClient, NewToken, NewUserAccount, Token,
    UserAccount,
};

const USERS_FILE: &str = "user_accounts.json";
const CLIENTS_FILE: &str = "clients.json";
const CODES_FILE: &str = "authorization_codes.json";
const TOKENS_FILE: &str = "tokens.json";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique column already holds this value
    #[error("Unique constraint violated: {0}")]
    Conflict(&'static str),

    #[error("Foreign key violated: no such {0}")]
    MissingReference(&'static str),

    #[error("Record not found: {0}")]
    NotFound(&'static str),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Data directory {0:?} is locked by another process")]
    Locked(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Counts returned by [`CredentialStore::delete_expired`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Purged {
    pub authorization_codes: usize,
    pub tokens: usize,
}

/// Persistence contract for the grant engine.
///
/// Returned entities are copies; mutating them has no effect on the store.
/// Every mutation either applies completely or, on `Err`, leaves the store as
/// it was.
pub trait CredentialStore: Send + Sync {
    fn insert_user(&self, user: NewUserAccount) -> Result<UserAccount>;

    fn find_user(&self, id: i64) -> Result<Option<UserAccount>>;

    fn find_user_by_username(&self, username: &str) -> Result<Option<UserAccount>>;

    fn insert_client(&self, client: NewClient) -> Result<Client>;

    fn find_client_by_client_id(&self, client_id: &str) -> Result<Option<Client>>;

    /// Fails with `Conflict` if the code string is already in use.
    fn insert_authorization_code(&self, code: NewAuthorizationCode) -> Result<AuthorizationCode>;

    fn find_authorization_code(&self, code: &str) -> Result<Option<AuthorizationCode>>;

    /// Atomically delete the code and insert `token` in its place.
    ///
    /// Returns `Ok(None)` if the code no longer exists (already redeemed or
    /// never issued). On `Err` nothing has changed: the code is still present
    /// and no token was written.
    fn redeem_authorization_code(&self, code: &str, token: NewToken) -> Result<Option<Token>>;

    /// Fails with `Conflict` if either token string is already in use.
    fn insert_token(&self, token: NewToken) -> Result<Token>;

    fn find_token_by_access_token(&self, access_token: &str) -> Result<Option<Token>>;

    fn find_token_by_refresh_token(&self, refresh_token: &str) -> Result<Option<Token>>;

    /// Replace the access string and its expiry on an existing record. The
    /// refresh string and its expiry are left untouched.
    fn reissue_access_token(
        &self,
        id: i64,
        access_token: String,
        access_token_expires_at: DateTime<Utc>,
    ) -> Result<Token>;

    /// Remove expired codes and tokens whose refresh token has expired.
    /// Each relation is purged on its own.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<Purged>;
}

/// Hash a token/code for storage (we don't store raw tokens)
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result)
}

/// Rows addressable by unique string keys
trait Keyed {
    fn keys(&self) -> Vec<&str>;
}

impl Keyed for UserAccount {
    fn keys(&self) -> Vec<&str> {
        vec![self.username.as_str()]
    }
}

impl Keyed for Client {
    fn keys(&self) -> Vec<&str> {
        vec![self.client_id.as_str()]
    }
}

impl Keyed for AuthorizationCode {
    fn keys(&self) -> Vec<&str> {
        vec![self.code_hash.as_str()]
    }
}

// Access and refresh digests share one key space, so neither string can
// ever stand in for the other.
impl Keyed for Token {
    fn keys(&self) -> Vec<&str> {
        vec![self.access_token_hash.as_str(), self.refresh_token_hash.as_str()]
    }
}

/// A relation with a surrogate id sequence
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
struct Table<T> {
    next_id: i64,
    rows: BTreeMap<i64, T>,
    /// Unique key -> row id, rebuilt on load
    #[serde(skip)]
    index: HashMap<String, i64>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            rows: BTreeMap::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Keyed> Table<T> {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn reindex(&mut self) {
        self.index = self
            .rows
            .iter()
            .flat_map(|(id, row)| row.keys().into_iter().map(move |k| (k.to_string(), *id)))
            .collect();
    }

    fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    fn get_by_key(&self, key: &str) -> Option<&T> {
        self.index.get(key).and_then(|id| self.rows.get(id))
    }

    fn insert(&mut self, id: i64, row: T) {
        for key in row.keys() {
            self.index.insert(key.to_string(), id);
        }
        self.rows.insert(id, row);
    }

    fn remove(&mut self, id: i64) -> Option<T> {
        let row = self.rows.remove(&id)?;
        for key in row.keys() {
            self.index.remove(key);
        }
        Some(row)
    }

    /// Swap in a new version of a row, returning the old one
    fn replace(&mut self, id: i64, row: T) -> Option<T> {
        let old = self.remove(id);
        self.insert(id, row);
        old
    }

    /// Take back the most recent `allocate_id` + `insert`
    fn undo_insert(&mut self, id: i64) {
        self.remove(id);
        if self.next_id == id {
            self.next_id -= 1;
        }
    }

    /// Remove every row matching `pred`
    fn remove_where(&mut self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let ids: Vec<i64> = self
            .rows
            .iter()
            .filter(|(_, row)| pred(row))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// In-memory store with optional JSON persistence
pub struct MemoryStore {
    data_dir: Option<PathBuf>,
    /// Held for the lifetime of the store to keep other processes out
    _lock: Option<File>,
    users: RwLock<Table<UserAccount>>,
    clients: RwLock<Table<Client>>,
    codes: RwLock<Table<AuthorizationCode>>,
    tokens: RwLock<Table<Token>>,
}

impl MemoryStore {
    /// A store that lives only as long as the process
    pub fn new() -> Self {
        Self {
            data_dir: None,
            _lock: None,
            users: RwLock::default(),
            clients: RwLock::default(),
            codes: RwLock::default(),
            tokens: RwLock::default(),
        }
    }

    /// Open (or create) a persisted store in `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let lock = File::create(data_dir.join(LOCK_FILE))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(data_dir));
        }

        let users: Table<UserAccount> = load(&data_dir, USERS_FILE)?;
        let clients: Table<Client> = load(&data_dir, CLIENTS_FILE)?;
        let codes: Table<AuthorizationCode> = load(&data_dir, CODES_FILE)?;
        let tokens: Table<Token> = load(&data_dir, TOKENS_FILE)?;

        tracing::info!(
            "Loaded {} user accounts, {} clients, {} authorization codes, {} tokens from {:?}",
            users.rows.len(),
            clients.rows.len(),
            codes.rows.len(),
            tokens.rows.len(),
            data_dir
        );

        Ok(Self {
            data_dir: Some(data_dir),
            _lock: Some(lock),
            users: RwLock::new(users),
            clients: RwLock::new(clients),
            codes: RwLock::new(codes),
            tokens: RwLock::new(tokens),
        })
    }

    fn persist<T: Serialize>(&self, file: &str, table: &Table<T>) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(table)?;
        // Write-then-rename so a crash never leaves a truncated relation
        let tmp = dir.join(format!("{}.tmp", file));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, dir.join(file))?;
        Ok(())
    }

    /// Persist a freshly inserted row, taking it back out if the write fails
    fn commit_insert<T: Keyed + Serialize>(
        &self,
        file: &str,
        table: &mut Table<T>,
        id: i64,
    ) -> Result<()> {
        self.persist(file, table)
            .inspect_err(|_| table.undo_insert(id))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn load<T: DeserializeOwned + Keyed>(dir: &Path, file: &str) -> Result<Table<T>> {
    let path = dir.join(file);
    if !path.exists() {
        return Ok(Table::default());
    }
    let content = std::fs::read_to_string(&path)?;
    let mut table: Table<T> = serde_json::from_str(&content)?;
    table.reindex();
    Ok(table)
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
}

fn check_references(store: &MemoryStore, user_account_id: i64, client_id: i64) -> Result<()> {
    if !read(&store.users)?.rows.contains_key(&user_account_id) {
        return Err(StoreError::MissingReference("user_account"));
    }
    if !read(&store.clients)?.rows.contains_key(&client_id) {
        return Err(StoreError::MissingReference("client"));
    }
    Ok(())
}

/// Digest a new token pair, rejecting strings that are already in use
fn token_row(tokens: &Table<Token>, id: i64, token: NewToken) -> Result<Token> {
    let access_token_hash = hash_token(&token.access_token);
    let refresh_token_hash = hash_token(&token.refresh_token);
    if access_token_hash == refresh_token_hash
        || tokens.contains_key(&access_token_hash)
        || tokens.contains_key(&refresh_token_hash)
    {
        return Err(StoreError::Conflict("tokens.access_token/refresh_token"));
    }
    Ok(Token {
        id,
        client_id: token.client_id,
        user_account_id: token.user_account_id,
        access_token_hash,
        refresh_token_hash,
        access_token_expires_at: token.access_token_expires_at,
        refresh_token_expires_at: token.refresh_token_expires_at,
    })
}

impl CredentialStore for MemoryStore {
    fn insert_user(&self, user: NewUserAccount) -> Result<UserAccount> {
        let mut users = write(&self.users)?;
        if users.contains_key(&user.username) {
            return Err(StoreError::Conflict("user_accounts.username"));
        }
        let id = users.allocate_id();
        let row = UserAccount {
            id,
            username: user.username,
            password_hash: user.password_hash,
            country: user.country,
            subscriber_id: user.subscriber_id,
        };
        users.insert(id, row.clone());
        self.commit_insert(USERS_FILE, &mut users, id)?;
        Ok(row)
    }

    fn find_user(&self, id: i64) -> Result<Option<UserAccount>> {
        Ok(read(&self.users)?.rows.get(&id).cloned())
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<UserAccount>> {
        Ok(read(&self.users)?.get_by_key(username).cloned())
    }

    fn insert_client(&self, client: NewClient) -> Result<Client> {
        let mut clients = write(&self.clients)?;
        if clients.contains_key(&client.client_id) {
            return Err(StoreError::Conflict("clients.client_id"));
        }
        let id = clients.allocate_id();
        let row = Client {
            id,
            name: client.name,
            client_id: client.client_id,
            client_secret_hash: client.client_secret_hash,
            redirect_uri: client.redirect_uri,
        };
        clients.insert(id, row.clone());
        self.commit_insert(CLIENTS_FILE, &mut clients, id)?;
        Ok(row)
    }

    fn find_client_by_client_id(&self, client_id: &str) -> Result<Option<Client>> {
        Ok(read(&self.clients)?.get_by_key(client_id).cloned())
    }

    fn insert_authorization_code(&self, code: NewAuthorizationCode) -> Result<AuthorizationCode> {
        check_references(self, code.user_account_id, code.client_id)?;

        let mut codes = write(&self.codes)?;
        let code_hash = hash_token(&code.code);
        if codes.contains_key(&code_hash) {
            return Err(StoreError::Conflict("authorization_codes.code"));
        }
        let id = codes.allocate_id();
        let row = AuthorizationCode {
            id,
            client_id: code.client_id,
            redirect_uri: code.redirect_uri,
            user_account_id: code.user_account_id,
            code_hash,
            expires_at: code.expires_at,
        };
        codes.insert(id, row.clone());
        self.commit_insert(CODES_FILE, &mut codes, id)?;
        Ok(row)
    }

    fn find_authorization_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        Ok(read(&self.codes)?.get_by_key(&hash_token(code)).cloned())
    }

    fn redeem_authorization_code(&self, code: &str, token: NewToken) -> Result<Option<Token>> {
        let mut codes = write(&self.codes)?;
        let mut tokens = write(&self.tokens)?;

        let Some(code_id) = codes.index.get(&hash_token(code)).copied() else {
            return Ok(None);
        };
        let id = tokens.next_id + 1;
        let row = token_row(&tokens, id, token)?;

        let Some(consumed) = codes.remove(code_id) else {
            return Ok(None);
        };
        tokens.allocate_id();
        tokens.insert(id, row.clone());

        let written = self
            .persist(CODES_FILE, &codes)
            .and_then(|()| self.persist(TOKENS_FILE, &tokens));
        if let Err(e) = written {
            tokens.undo_insert(id);
            codes.insert(code_id, consumed);
            // The codes file may already have been rewritten without the code
            if let Err(restore) = self.persist(CODES_FILE, &codes) {
                tracing::error!("Failed to restore {} after aborted redeem: {}", CODES_FILE, restore);
            }
            return Err(e);
        }
        Ok(Some(row))
    }

    fn insert_token(&self, token: NewToken) -> Result<Token> {
        check_references(self, token.user_account_id, token.client_id)?;

        let mut tokens = write(&self.tokens)?;
        let row = token_row(&tokens, tokens.next_id + 1, token)?;
        let id = tokens.allocate_id();
        tokens.insert(id, row.clone());
        self.commit_insert(TOKENS_FILE, &mut tokens, id)?;
        Ok(row)
    }

    fn find_token_by_access_token(&self, access_token: &str) -> Result<Option<Token>> {
        let hash = hash_token(access_token);
        Ok(read(&self.tokens)?
            .get_by_key(&hash)
            .filter(|t| t.access_token_hash == hash)
            .cloned())
    }

    fn find_token_by_refresh_token(&self, refresh_token: &str) -> Result<Option<Token>> {
        let hash = hash_token(refresh_token);
        Ok(read(&self.tokens)?
            .get_by_key(&hash)
            .filter(|t| t.refresh_token_hash == hash)
            .cloned())
    }

    fn reissue_access_token(
        &self,
        id: i64,
        access_token: String,
        access_token_expires_at: DateTime<Utc>,
    ) -> Result<Token> {
        let mut tokens = write(&self.tokens)?;
        let access_token_hash = hash_token(&access_token);
        if tokens.contains_key(&access_token_hash) {
            return Err(StoreError::Conflict("tokens.access_token"));
        }

        let current = tokens
            .rows
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("token"))?;
        let updated = Token {
            access_token_hash,
            access_token_expires_at,
            ..current.clone()
        };
        tokens.replace(id, updated.clone());

        if let Err(e) = self.persist(TOKENS_FILE, &tokens) {
            tokens.replace(id, current);
            return Err(e);
        }
        Ok(updated)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<Purged> {
        let mut purged = Purged::default();

        {
            let mut codes = write(&self.codes)?;
            let removed = codes.remove_where(|c| c.is_expired(now));
            if !removed.is_empty() {
                if let Err(e) = self.persist(CODES_FILE, &codes) {
                    for row in removed {
                        codes.insert(row.id, row);
                    }
                    return Err(e);
                }
            }
            purged.authorization_codes = removed.len();
        }

        {
            let mut tokens = write(&self.tokens)?;
            let removed = tokens.remove_where(|t| t.refresh_expired(now));
            if !removed.is_empty() {
                if let Err(e) = self.persist(TOKENS_FILE, &tokens) {
                    for row in removed {
                        tokens.insert(row.id, row);
                    }
                    return Err(e);
                }
            }
            purged.tokens = removed.len();
        }

        Ok(purged)
    }
}
