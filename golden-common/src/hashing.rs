//! Identity and freshness hashes
//!
//! Identity is a pure function of the artifact locator, so the same
//! artifact keeps its id across refreshes. Freshness tokens are random and
//! only exist to give every re-fetch a new URL.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Number of digest bytes kept in an identity hash (32 hex chars)
const IDENTITY_BYTES: usize = 16;

/// Stable identity hash of a locator string
pub fn stable_id(locator: &str) -> String {
    let digest = Sha256::digest(locator.as_bytes());
    hex::encode(&digest[..IDENTITY_BYTES])
}

/// New random freshness token, distinct on every call
pub fn freshness_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
