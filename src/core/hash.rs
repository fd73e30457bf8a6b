//! State hashing.
//!
//! SHA-256 digests of session state and turn logs. Tests and the demo use
//! them to check that an undo or redo landed on exactly the expected state.

use serde::Serialize;
use sha2::{Sha256, Digest};

/// 32-byte digest.
pub type StateHash = [u8; 32];

/// Incremental hasher over the primitive fields of game state.
///
/// Callers feed fields in a fixed order; the order is part of the hash.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Start a hash under a domain tag.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for session state.
    pub fn for_session_state() -> Self {
        Self::new(b"CROSSWORD_STATE_V1")
    }

    /// Feed a byte.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Feed a u32, little-endian.
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Feed an i32, little-endian.
    #[inline]
    pub fn update_i32(&mut self, value: i32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Feed a flag.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.update_u8(value as u8);
    }

    /// Length-prefixed, so adjacent strings cannot run together.
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Feed the bincode encoding of a value.
    ///
    /// Only for types with a canonical encoding (no HashMap).
    pub fn update_serialized<T: Serialize>(&mut self, value: &T) -> Result<(), bincode::Error> {
        let bytes = bincode::serialize(value)?;
        self.update_u32(bytes.len() as u32);
        self.hasher.update(&bytes);
        Ok(())
    }

    /// Finish the digest.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Hash session state: the turn count first, then whatever `add_state` feeds.
pub fn compute_state_hash<F>(turn_count: u32, add_state: F) -> StateHash
where
    F: FnOnce(&mut StateHasher),
{
    let mut hasher = StateHasher::for_session_state();
    hasher.update_u32(turn_count);
    add_state(&mut hasher);
    hasher.finalize()
}
