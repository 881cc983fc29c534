//! Codec for the `v1:<salt>:<iv>:<ciphertext>:<tag>` encrypted session
//! format stored under the `telegram_session` settings key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use scrypt::{scrypt, Params};

use crate::SecretsError;

const FORMAT_PREFIX: &str = "v1:";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

fn derive_key(secret: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], SecretsError> {
    let params = Params::new(15, 8, 1, KEY_LEN).map_err(|e| SecretsError::Encryption(e.to_string()))?;
    let mut key = [0u8; KEY_LEN];
    scrypt(secret.as_bytes(), salt, &params, &mut key).map_err(|e| SecretsError::Encryption(e.to_string()))?;
    Ok(key)
}

/// Parses and decrypts a `v1:`-prefixed encrypted session string, returning
/// the plaintext session bytes (a `grammers-session` blob, opaque to this
/// crate).
pub fn decrypt_session(stored: &str, encryption_secret: &str) -> Result<Vec<u8>, SecretsError> {
    let rest = stored
        .strip_prefix(FORMAT_PREFIX)
        .ok_or_else(|| SecretsError::Format("unsupported session format version".to_string()))?;

    let parts: Vec<&str> = rest.split(':').collect();
    let [salt_b64, iv_b64, ciphertext_b64, tag_b64] = parts.as_slice() else {
        return Err(SecretsError::Format(format!(
            "expected 4 colon-separated fields, got {}",
            parts.len()
        )));
    };

    let salt = BASE64
        .decode(salt_b64)
        .map_err(|e| SecretsError::Format(format!("invalid salt base64: {e}")))?;
    let iv = BASE64
        .decode(iv_b64)
        .map_err(|e| SecretsError::Format(format!("invalid iv base64: {e}")))?;
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| SecretsError::Format(format!("invalid ciphertext base64: {e}")))?;
    let tag = BASE64
        .decode(tag_b64)
        .map_err(|e| SecretsError::Format(format!("invalid tag base64: {e}")))?;

    if iv.len() != NONCE_LEN {
        return Err(SecretsError::Format(format!("iv must be {NONCE_LEN} bytes, got {}", iv.len())));
    }
    if tag.len() != TAG_LEN {
        return Err(SecretsError::Format(format!("tag must be {TAG_LEN} bytes, got {}", tag.len())));
    }

    let key = derive_key(encryption_secret, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| SecretsError::Encryption(e.to_string()))?;
    let nonce = Nonce::from_slice(&iv);

    let mut combined = ciphertext;
    combined.extend_from_slice(&tag);

    cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|_| SecretsError::DecryptionFailed)
}

/// Encrypts `plaintext` into the `v1:` format. Used by operator tooling
/// that writes the initial session and by this crate's own tests.
pub fn encrypt_session(plaintext: &[u8], encryption_secret: &str) -> Result<String, SecretsError> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut iv = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(encryption_secret, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| SecretsError::Encryption(e.to_string()))?;
    let nonce = Nonce::from_slice(&iv);

    let combined = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| SecretsError::Encryption(e.to_string()))?;
    let (ciphertext, tag) = combined.split_at(combined.len() - TAG_LEN);

    Ok(format!(
        "v1:{}:{}:{}:{}",
        BASE64.encode(salt),
        BASE64.encode(iv),
        BASE64.encode(ciphertext),
        BASE64.encode(tag),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_and_decrypt() {
        let plaintext = b"a grammers session blob";
        let stored = encrypt_session(plaintext, "correct horse battery staple").unwrap();
        let decrypted = decrypt_session(&stored, "correct horse battery staple").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_secret_fails_decryption() {
        let stored = encrypt_session(b"session", "right-secret").unwrap();
        let err = decrypt_session(&stored, "wrong-secret").unwrap_err();
        assert!(matches!(err, SecretsError::DecryptionFailed));
    }

    #[test]
    fn rejects_unknown_format_prefix() {
        let err = decrypt_session("v2:abc", "secret").unwrap_err();
        assert!(matches!(err, SecretsError::Format(_)));
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = decrypt_session("v1:onlyonefield", "secret").unwrap_err();
        assert!(matches!(err, SecretsError::Format(_)));
    }
}
