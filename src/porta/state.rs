//! Sealed login state carried across the provider redirect.
//!
//! The CSRF token and the post-login redirect are serialized as JSON,
//! sealed with AES-256-GCM under a key derived from the cookie secret and
//! encoded as `base64url(nonce || ciphertext || tag)` without padding.
//! The GCM tag covers the whole plaintext, so any modification in transit
//! surfaces as [`StateError::Integrity`].

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64ct::{Base64UrlUnpadded, Encoding};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Lifetime of a sealed state, matching the cookie `Max-Age`.
pub const STATE_TTL: Duration = Duration::from_secs(3600);

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("sealed state is shorter than the nonce")]
    Truncated,
    #[error("invalid base64url encoding")]
    Decode,
    #[error("sealed state failed authentication")]
    Integrity,
    #[error("invalid state payload")]
    Payload(#[source] serde_json::Error),
    #[error("sealed state expired")]
    Expired,
    #[error("failed to seal state")]
    Seal,
}

/// Per-login data recovered from the state cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginState {
    pub csrf_token: String,
    pub redirect: String,
}

#[derive(Serialize, Deserialize)]
struct SealedPayload {
    state: String,
    redirect: String,
    exp: u64,
}

pub struct StateCodec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCodec").finish_non_exhaustive()
    }
}

impl StateCodec {
    /// Build a codec from the process-wide cookie secret.
    ///
    /// The AES key is `SHA-256(secret)`, so secrets of any length are accepted.
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let key = Sha256::digest(secret.expose_secret().as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Seal `csrf_token` and `redirect` into an opaque cookie value.
    ///
    /// # Errors
    /// Returns an error if serialization or encryption fails.
    pub fn encrypt(&self, csrf_token: &str, redirect: &str) -> Result<String, StateError> {
        self.encrypt_at(csrf_token, redirect, unix_now())
    }

    fn encrypt_at(&self, csrf_token: &str, redirect: &str, now: u64) -> Result<String, StateError> {
        let payload = SealedPayload {
            state: csrf_token.to_string(),
            redirect: redirect.to_string(),
            exp: now.saturating_add(STATE_TTL.as_secs()),
        };
        let plaintext = serde_json::to_vec(&payload).map_err(StateError::Payload)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| StateError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(Base64UrlUnpadded::encode_string(&sealed))
    }

    /// Open a cookie value produced by [`Self::encrypt`].
    ///
    /// # Errors
    /// Returns [`StateError::Decode`] for a malformed envelope,
    /// [`StateError::Truncated`] when shorter than a nonce,
    /// [`StateError::Integrity`] when authentication fails and
    /// [`StateError::Expired`] once the embedded expiry has passed.
    pub fn decrypt(&self, sealed: &str) -> Result<LoginState, StateError> {
        self.decrypt_at(sealed, unix_now())
    }

    fn decrypt_at(&self, sealed: &str, now: u64) -> Result<LoginState, StateError> {
        let raw = Base64UrlUnpadded::decode_vec(sealed).map_err(|_| StateError::Decode)?;
        if raw.len() < NONCE_LEN {
            return Err(StateError::Truncated);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StateError::Integrity)?;

        let payload: SealedPayload =
            serde_json::from_slice(&plaintext).map_err(StateError::Payload)?;
        if payload.exp <= now {
            return Err(StateError::Expired);
        }

        Ok(LoginState {
            csrf_token: payload.state,
            redirect: payload.redirect,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn codec(secret: &str) -> StateCodec {
        StateCodec::new(&SecretString::from(secret.to_string()))
    }

    #[test]
    fn round_trip() -> Result<(), StateError> {
        let codec = codec("cookie-secret");
        let cases = [
            ("abc", "https://a.example.com/home"),
            ("", ""),
            ("tok/with+chars=", "https://a.example.com/cb?x=1&y=%20z#frag"),
            ("ünïcode", "https://ä.example.com/päth"),
        ];

        for (csrf, redirect) in cases {
            let sealed = codec.encrypt_at(csrf, redirect, NOW)?;
            let opened = codec.decrypt_at(&sealed, NOW)?;
            assert_eq!(opened.csrf_token, csrf);
            assert_eq!(opened.redirect, redirect);
        }
        Ok(())
    }

    #[test]
    fn output_is_url_safe_and_unpadded() -> Result<(), StateError> {
        let sealed = codec("s").encrypt("abc", "https://a.example.com/")?;
        assert!(sealed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        Ok(())
    }

    #[test]
    fn fresh_nonce_per_call() -> Result<(), StateError> {
        let codec = codec("s");
        let first = codec.encrypt("abc", "https://a.example.com/")?;
        let second = codec.encrypt("abc", "https://a.example.com/")?;
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn any_flipped_byte_fails_authentication() -> Result<(), StateError> {
        let codec = codec("s");
        let sealed = codec.encrypt_at("abc", "https://a.example.com/home", NOW)?;
        let raw = Base64UrlUnpadded::decode_vec(&sealed).map_err(|_| StateError::Decode)?;

        for index in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[index] ^= 0x01;
            let encoded = Base64UrlUnpadded::encode_string(&tampered);
            assert!(
                matches!(codec.decrypt_at(&encoded, NOW), Err(StateError::Integrity)),
                "byte {index} flip was not detected"
            );
        }
        Ok(())
    }

    #[test]
    fn wrong_secret_fails_authentication() -> Result<(), StateError> {
        let sealed = codec("one").encrypt_at("abc", "https://a.example.com/", NOW)?;
        assert!(matches!(
            codec("two").decrypt_at(&sealed, NOW),
            Err(StateError::Integrity)
        ));
        Ok(())
    }

    #[test]
    fn malformed_and_truncated_input() {
        let codec = codec("s");
        assert!(matches!(codec.decrypt("not base64!"), Err(StateError::Decode)));
        assert!(matches!(
            codec.decrypt(&Base64UrlUnpadded::encode_string(&[0u8; 11])),
            Err(StateError::Truncated)
        ));
        assert!(matches!(
            codec.decrypt(&Base64UrlUnpadded::encode_string(&[0u8; 12])),
            Err(StateError::Integrity)
        ));
    }

    #[test]
    fn expired_state_is_rejected() -> Result<(), StateError> {
        let codec = codec("s");
        let sealed = codec.encrypt_at("abc", "https://a.example.com/", NOW)?;

        assert!(codec.decrypt_at(&sealed, NOW + STATE_TTL.as_secs() - 1).is_ok());
        assert!(matches!(
            codec.decrypt_at(&sealed, NOW + STATE_TTL.as_secs()),
            Err(StateError::Expired)
        ));
        Ok(())
    }
}
