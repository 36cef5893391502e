//! Sync key management. The sync key is a client-generated UUIDv4, never
//! sent to the server; the server identifies records by its SHA-256 hex
//! digest. Grounded in the same `hex::encode(Sha256::digest(...))` shape the
//! teacher uses for `WatermarkConfig::current_dynamic_code` and
//! `identity_hash::hmac_hex16`, simplified here to a plain hash since the
//! spec calls for `SHA-256(key)`, not an HMAC.

use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const SYNC_KEY_HEADER: &str = "X-Sync-Key-Hash";

/// Generates a new client-side sync key (UUIDv4).
pub fn generate_sync_key() -> Uuid {
    Uuid::new_v4()
}

/// The header value sent with every sync request: `SHA-256(key)` hex,
/// never the key itself.
pub fn key_hash_hex(key: Uuid) -> String {
    let digest = Sha256::digest(key.to_string().as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_deterministic_and_hex() {
        let key = Uuid::new_v4();
        let a = key_hash_hex(key);
        let b = key_hash_hex(key);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_keys_hash_differently() {
        assert_ne!(key_hash_hex(Uuid::new_v4()), key_hash_hex(Uuid::new_v4()));
    }
}
