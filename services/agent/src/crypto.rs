//! End-to-end encryption support.
//!
//! # Envelope layout
//! `base64( version | tag[16] | iv[12] | ciphertext[*] )` where `version`
//! is the single byte `0x31` (ASCII '1').
//!
//! # Key derivation
//! PBKDF2-HMAC-SHA256, 30000 iterations, salt = UTF-8 bytes of the user
//! iden, 256-bit output used as an AES-256-GCM key (128-bit tag).
//!
//! Decryption failures never destroy the envelope; callers keep the push
//! and surface a diagnostic instead.

use aes_gcm::aead::{Aead, AeadCore, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::Sha256;

use crate::error::DecryptError;

const ENVELOPE_VERSION: u8 = 0x31;
const TAG_LEN: usize = 16;
const IV_LEN: usize = 12;
const PBKDF2_ITERATIONS: u32 = 30_000;

/// A derived AES-256-GCM key.
///
/// Deliberately opaque: no Debug/Display, so key material cannot end up in
/// logs by accident.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Derive the decrypt key from the user's password and iden.
    pub fn derive(password: &str, user_iden: &str) -> Self {
        let mut out = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            user_iden.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut out,
        );
        Self(out)
    }
}

/// Decrypt a framed envelope to its UTF-8 JSON plaintext.
pub fn decrypt_envelope(ciphertext_b64: &str, key: &EncryptionKey) -> Result<String, DecryptError> {
    let raw = BASE64
        .decode(ciphertext_b64)
        .map_err(|_| DecryptError::Base64)?;
    if raw.len() < 1 + TAG_LEN + IV_LEN {
        return Err(DecryptError::TooShort(raw.len()));
    }
    if raw[0] != ENVELOPE_VERSION {
        return Err(DecryptError::UnsupportedVersion(raw[0]));
    }
    let tag = &raw[1..1 + TAG_LEN];
    let iv = &raw[1 + TAG_LEN..1 + TAG_LEN + IV_LEN];
    let body = &raw[1 + TAG_LEN + IV_LEN..];

    // The aead crate expects ciphertext || tag.
    let mut combined = Vec::with_capacity(body.len() + TAG_LEN);
    combined.extend_from_slice(body);
    combined.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: &combined,
                aad: &[],
            },
        )
        .map_err(|_| DecryptError::BadCiphertext)?;

    String::from_utf8(plaintext).map_err(|_| DecryptError::BadPlaintext)
}

/// Encrypt a plaintext into a framed envelope.
///
/// The agent itself only decrypts; this exists for the round-trip tests
/// and for the mock servers to fabricate encrypted pushes.
pub fn encrypt_envelope(plaintext: &str, key: &EncryptionKey) -> String {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    // encrypt() never fails for in-memory buffers.
    let mut sealed = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .unwrap_or_default();
    let tag = sealed.split_off(sealed.len().saturating_sub(TAG_LEN));

    let mut framed = Vec::with_capacity(1 + TAG_LEN + IV_LEN + sealed.len());
    framed.push(ENVELOPE_VERSION);
    framed.extend_from_slice(&tag);
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&sealed);
    BASE64.encode(framed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EncryptionKey {
        EncryptionKey::derive("hunter2", "ujpah72o0")
    }

    #[test]
    fn round_trip_arbitrary_json() {
        let k = key();
        for plaintext in [
            r#"{"type":"note","title":"Hi","body":"secret"}"#,
            r#"{"type":"link","url":"https://example.com/?q=é"}"#,
            "{}",
        ] {
            let envelope = encrypt_envelope(plaintext, &k);
            assert_eq!(decrypt_envelope(&envelope, &k).unwrap(), plaintext);
        }
    }

    #[test]
    fn wrong_password_fails_tag_check() {
        let envelope = encrypt_envelope(r#"{"type":"note"}"#, &key());
        let wrong = EncryptionKey::derive("hunter3", "ujpah72o0");
        assert_eq!(
            decrypt_envelope(&envelope, &wrong).unwrap_err(),
            DecryptError::BadCiphertext
        );
    }

    #[test]
    fn wrong_salt_fails_tag_check() {
        let envelope = encrypt_envelope(r#"{"type":"note"}"#, &key());
        let wrong = EncryptionKey::derive("hunter2", "other-iden");
        assert_eq!(
            decrypt_envelope(&envelope, &wrong).unwrap_err(),
            DecryptError::BadCiphertext
        );
    }

    #[test]
    fn malformed_envelopes_are_classified() {
        let k = key();
        assert_eq!(
            decrypt_envelope("!!!not-base64!!!", &k).unwrap_err(),
            DecryptError::Base64
        );
        let short = BASE64.encode([ENVELOPE_VERSION, 1, 2, 3]);
        assert!(matches!(
            decrypt_envelope(&short, &k).unwrap_err(),
            DecryptError::TooShort(_)
        ));
        let mut raw = vec![0x32u8];
        raw.extend_from_slice(&[0u8; TAG_LEN + IV_LEN + 4]);
        assert_eq!(
            decrypt_envelope(&BASE64.encode(raw), &k).unwrap_err(),
            DecryptError::UnsupportedVersion(0x32)
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let k = key();
        let envelope = encrypt_envelope(r#"{"type":"note","body":"x"}"#, &k);
        let mut raw = BASE64.decode(&envelope).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert_eq!(
            decrypt_envelope(&BASE64.encode(raw), &k).unwrap_err(),
            DecryptError::BadCiphertext
        );
    }
}
