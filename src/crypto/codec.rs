//! AES-256-GCM + PBKDF2-HMAC-SHA256 codec. Wire format: a base64 string
//! whose decoded bytes are `salt(16) || iv(12) || ciphertext`. A legacy
//! JSON form `{salt, iv, encrypted}` (each base64) is accepted on read,
//! mirroring the teacher's `decryptor.rs` dispatch-on-shape approach to
//! save-format backward compatibility.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::EngineError;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Legacy wire form accepted on read: `{salt, iv, encrypted}`, each base64.
#[derive(Debug, Serialize, Deserialize)]
struct LegacyEnvelope {
    salt: String,
    iv: String,
    encrypted: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypts `plaintext` under `passphrase`, returning the canonical base64
/// wire form (`salt || iv || ciphertext`, base64-encoded as one string).
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<String, EngineError> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| EngineError::Crypto(e.to_string()))?;
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| EngineError::Crypto("encryption failed".to_string()))?;

    let mut wire = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    wire.extend_from_slice(&salt);
    wire.extend_from_slice(&iv);
    wire.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(wire))
}

/// Decrypts either the canonical base64 form or the legacy JSON envelope.
/// Per spec.md §7, a decrypt failure never retries with a different key
/// automatically and always surfaces the same generic error.
pub fn decrypt(payload: &str, passphrase: &str) -> Result<Vec<u8>, EngineError> {
    if let Ok(envelope) = serde_json::from_str::<LegacyEnvelope>(payload) {
        return decrypt_legacy(&envelope, passphrase);
    }
    decrypt_canonical(payload, passphrase)
}

fn decrypt_canonical(payload: &str, passphrase: &str) -> Result<Vec<u8>, EngineError> {
    let wire = BASE64
        .decode(payload.trim())
        .map_err(|_| generic_crypto_error())?;
    if wire.len() < SALT_LEN + IV_LEN {
        return Err(generic_crypto_error());
    }
    let (salt, rest) = wire.split_at(SALT_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);
    open(salt, iv, ciphertext, passphrase)
}

fn decrypt_legacy(envelope: &LegacyEnvelope, passphrase: &str) -> Result<Vec<u8>, EngineError> {
    let salt = BASE64.decode(&envelope.salt).map_err(|_| generic_crypto_error())?;
    let iv = BASE64.decode(&envelope.iv).map_err(|_| generic_crypto_error())?;
    let ciphertext = BASE64.decode(&envelope.encrypted).map_err(|_| generic_crypto_error())?;
    open(&salt, &iv, &ciphertext, passphrase)
}

fn open(salt: &[u8], iv: &[u8], ciphertext: &[u8], passphrase: &str) -> Result<Vec<u8>, EngineError> {
    if iv.len() != IV_LEN {
        return Err(generic_crypto_error());
    }
    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| generic_crypto_error())?;
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| generic_crypto_error())
}

/// Spec.md §7: "decrypt failure -> propagate a generic 'key invalid or
/// data corrupted' message". All decrypt failure paths fold into this.
fn generic_crypto_error() -> EngineError {
    EngineError::Crypto("key invalid or data corrupted".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let plaintext = b"hello askesis";
        let wire = encrypt(plaintext, "correct horse").unwrap();
        let recovered = decrypt(&wire, "correct horse").unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn wrong_passphrase_yields_generic_error() {
        let wire = encrypt(b"secret", "right").unwrap();
        let err = decrypt(&wire, "wrong").unwrap_err();
        assert!(matches!(err, EngineError::Crypto(_)));
    }

    #[test]
    fn legacy_envelope_form_is_accepted_on_read() {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);
        let key = derive_key("pw", &salt);
        let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = cipher.encrypt(nonce, Payload { msg: b"legacy payload", aad: &[] }).unwrap();

        let envelope = LegacyEnvelope {
            salt: BASE64.encode(salt),
            iv: BASE64.encode(iv),
            encrypted: BASE64.encode(ciphertext),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let recovered = decrypt(&json, "pw").unwrap();
        assert_eq!(recovered, b"legacy payload");
    }
}
