//! Dialback key derivation and challenge generation.
//!
//! The chained hash in [`dialback_key`] is the sole authentication
//! primitive of the protocol: two parties holding the same shared secret
//! and the same (target domain, challenge) pair derive the same value,
//! and nobody without the secret can.
//!
//! [`Keygen`] issues the random correlation ids that double as challenge
//! nonces, and remembers what it issued so the outbound handler can tell
//! when a peer echoes one of our own ids back — a same-process loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::RngCore;

/// Hex-encoded BLAKE3 of a byte slice.
fn hash_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Derive the response token proving possession of `secret`.
///
/// Chained construction:
///
/// ```text
/// k1 = hex(b3(secret))
/// k2 = hex(b3(k1 || target_domain))
/// key = hex(b3(k2 || challenge))
/// ```
///
/// Pure — equal inputs always yield equal output, and both the claiming
/// and the verifying side must compute it identically.
pub fn dialback_key(secret: &str, target_domain: &str, challenge: &str) -> String {
    let k1 = hash_hex(secret.as_bytes());
    let k2 = hash_hex(format!("{k1}{target_domain}").as_bytes());
    hash_hex(format!("{k2}{challenge}").as_bytes())
}

/// Generates unpredictable challenge / correlation id strings.
///
/// Each id is the hash of a random per-process seed and an advancing
/// counter, so ids never repeat within a process and cannot be predicted
/// without the seed.
pub struct Keygen {
    seed: [u8; 32],
    counter: AtomicU64,
    issued: Mutex<HashSet<String>>,
}

impl Keygen {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministic construction for tests.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            seed,
            counter: AtomicU64::new(0),
            issued: Mutex::new(HashSet::new()),
        }
    }

    /// A fresh, unpredictable token. Remembered until [`Keygen::forget`].
    pub fn random_challenge(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut input = [0u8; 40];
        input[..32].copy_from_slice(&self.seed);
        input[32..].copy_from_slice(&n.to_le_bytes());
        let id = hash_hex(&input);
        self.issued
            .lock()
            .expect("keygen mutex poisoned")
            .insert(id.clone());
        id
    }

    /// Did this process generate `id`? True means a peer advertising it
    /// is this server talking to itself.
    pub fn is_ours(&self, id: &str) -> bool {
        self.issued
            .lock()
            .expect("keygen mutex poisoned")
            .contains(id)
    }

    /// Release an id once the stream it was issued for is gone.
    pub fn forget(&self, id: &str) {
        self.issued
            .lock()
            .expect("keygen mutex poisoned")
            .remove(id);
    }
}

impl Default for Keygen {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a random shared secret for servers started without one.
/// Peers will only validate against this process's lifetime.
pub fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
