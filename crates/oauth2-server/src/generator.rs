//! Random credential strings and expiry computation.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Source of unguessable identifiers for codes and tokens.
pub trait TokenGenerator: Send + Sync {
    fn random_string(&self, len: usize) -> String;
}

/// Draws from the thread-local CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomGenerator;

impl TokenGenerator for RandomGenerator {
    fn random_string(&self, len: usize) -> String {
        generate_random_string(len)
    }
}

/// Generate a cryptographically secure alphanumeric string
pub fn generate_random_string(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// A configured lifetime that does not fit the timestamp range
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("lifetime of {0} seconds is out of range")]
pub struct LifetimeOverflow(pub u64);

/// `now` plus a lifetime given in seconds
pub fn expires_after(
    now: DateTime<Utc>,
    lifetime_secs: u64,
) -> Result<DateTime<Utc>, LifetimeOverflow> {
    i64::try_from(lifetime_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or(LifetimeOverflow(lifetime_secs))
}

/// Whole seconds left until `expires_at`, floored at zero
pub fn seconds_remaining(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> u64 {
    (expires_at - now).num_seconds().max(0) as u64
}
