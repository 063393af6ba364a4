//! RS256 identity tokens and the JSON Web Key Set that verifies them.
//!
//! A tenant signs with exactly one key and publishes exactly one JWK under
//! its `kid`. Verification goes through [`CompactJws`], which splits a
//! token once and keeps the raw signing input so the signature is checked
//! over the bytes that were actually received.

use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const ALGORITHM: &str = "RS256";

#[derive(Debug, Error)]
pub enum TokenError {
    /// The token is not three base64url JSON segments; names the bad part.
    #[error("malformed token {0}")]
    Malformed(&'static str),
    #[error("token uses {0}, only RS256 is accepted")]
    UnsupportedAlgorithm(String),
    #[error("no published key for kid {0:?}")]
    UnknownKeyId(String),
    #[error("signing key is not an RSA private key in PKCS#1 or PKCS#8")]
    PrivateKey,
    #[error("published key is not a usable RSA public key")]
    PublicKey(#[source] rsa::Error),
    #[error("failed to encode token: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signing failed")]
    Signing,
    #[error("signature does not verify")]
    InvalidSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default)]
    pub typ: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
}

/// Claims asserted to the protected application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    #[must_use]
    pub fn key(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|key| key.kid == kid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    pub kid: String,
    pub n: String,
    pub e: String,
}

impl Jwk {
    /// Public half of a tenant key, advertised for RS256 signature checks.
    #[must_use]
    pub fn rs256_signing(public_key: &RsaPublicKey, kid: impl Into<String>) -> Self {
        Self {
            kty: "RSA".to_string(),
            alg: Some(ALGORITHM.to_string()),
            key_use: Some("sig".to_string()),
            kid: kid.into(),
            n: Base64UrlUnpadded::encode_string(&public_key.n().to_bytes_be()),
            e: Base64UrlUnpadded::encode_string(&public_key.e().to_bytes_be()),
        }
    }

    /// # Errors
    ///
    /// Returns an error if `n`/`e` are not base64url or do not form a valid key.
    pub fn public_key(&self) -> Result<RsaPublicKey, TokenError> {
        let modulus = Base64UrlUnpadded::decode_vec(&self.n)
            .map_err(|_| TokenError::Malformed("jwk modulus"))?;
        let exponent = Base64UrlUnpadded::decode_vec(&self.e)
            .map_err(|_| TokenError::Malformed("jwk exponent"))?;
        RsaPublicKey::new(
            BigUint::from_bytes_be(&modulus),
            BigUint::from_bytes_be(&exponent),
        )
        .map_err(TokenError::PublicKey)
    }
}

/// A tenant's private signing key, its key id and the matching public key set.
pub struct TenantSigner {
    kid: String,
    signing_key: SigningKey<Sha256>,
    jwks: Jwks,
}

impl std::fmt::Debug for TenantSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSigner")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl TenantSigner {
    /// Load a signer from an RSA private key (PKCS#1 or PKCS#8, PEM or DER).
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::PrivateKey`] if no encoding accepts the bytes.
    pub fn from_pem_or_der(private_key: &[u8], kid: impl Into<String>) -> Result<Self, TokenError> {
        Ok(Self::from_private_key(read_private_key(private_key)?, kid))
    }

    #[must_use]
    pub fn from_private_key(private_key: RsaPrivateKey, kid: impl Into<String>) -> Self {
        let kid = kid.into();
        let jwks = Jwks {
            keys: vec![Jwk::rs256_signing(&private_key.to_public_key(), kid.clone())],
        };

        Self {
            kid,
            signing_key: SigningKey::<Sha256>::new(private_key),
            jwks,
        }
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Single-entry key set publishing this signer's public key.
    #[must_use]
    pub const fn jwks(&self) -> &Jwks {
        &self.jwks
    }

    /// Produce a compact RS256 JWS over `claims` with this signer's `kid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the claims cannot be serialized or signing fails.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, TokenError> {
        let header = TokenHeader {
            alg: ALGORITHM.to_string(),
            typ: Some("JWT".to_string()),
            kid: Some(self.kid.clone()),
        };
        let mut token = format!("{}.{}", encode_segment(&header)?, encode_segment(claims)?);

        let signature: Signature = self
            .signing_key
            .try_sign(token.as_bytes())
            .map_err(|_| TokenError::Signing)?;
        token.push('.');
        token.push_str(&Base64UrlUnpadded::encode_string(&signature.to_bytes()));
        Ok(token)
    }
}

/// A compact JWS split into its parts, not yet verified.
#[derive(Debug)]
pub struct CompactJws<'a> {
    pub header: TokenHeader,
    signing_input: &'a str,
    claims: &'a str,
    signature: Vec<u8>,
}

impl<'a> CompactJws<'a> {
    /// # Errors
    ///
    /// Returns [`TokenError::Malformed`] unless `token` is exactly three
    /// base64url segments with a JSON header.
    pub fn parse(token: &'a str) -> Result<Self, TokenError> {
        let (signing_input, signature) = token
            .rsplit_once('.')
            .ok_or(TokenError::Malformed("segments"))?;
        let (header, claims) = signing_input
            .split_once('.')
            .filter(|(_, claims)| !claims.contains('.'))
            .ok_or(TokenError::Malformed("segments"))?;

        Ok(Self {
            header: decode_segment(header, "header")?,
            signing_input,
            claims,
            signature: Base64UrlUnpadded::decode_vec(signature)
                .map_err(|_| TokenError::Malformed("signature"))?,
        })
    }

    /// The `kid` header, empty when absent.
    #[must_use]
    pub fn key_id(&self) -> &str {
        self.header.kid.as_deref().unwrap_or_default()
    }

    /// Check the RS256 signature against the key in `jwks` matching `kid`.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-RS256 header, an unknown `kid` or a bad
    /// signature.
    pub fn verify(&self, jwks: &Jwks) -> Result<(), TokenError> {
        if self.header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlgorithm(self.header.alg.clone()));
        }
        let jwk = jwks
            .key(self.key_id())
            .ok_or_else(|| TokenError::UnknownKeyId(self.key_id().to_string()))?;

        let signature = Signature::try_from(self.signature.as_slice())
            .map_err(|_| TokenError::InvalidSignature)?;
        VerifyingKey::<Sha256>::new(jwk.public_key()?)
            .verify(self.signing_input.as_bytes(), &signature)
            .map_err(|_| TokenError::InvalidSignature)
    }

    /// Decode the claims segment. Call [`Self::verify`] first.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Malformed`] if the claims do not decode into `T`.
    pub fn claims<T: DeserializeOwned>(&self) -> Result<T, TokenError> {
        decode_segment(self.claims, "claims")
    }
}

/// Verify an RS256 compact JWS against `jwks` and return its claims.
///
/// Only the signature is checked; claim validation is up to the caller.
///
/// # Errors
///
/// Returns an error if the token is malformed, the `kid` is unknown or the
/// signature does not verify.
pub fn verify_rs256<T: DeserializeOwned>(token: &str, jwks: &Jwks) -> Result<T, TokenError> {
    let jws = CompactJws::parse(token)?;
    jws.verify(jwks)?;
    jws.claims()
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, TokenError> {
    Ok(Base64UrlUnpadded::encode_string(&serde_json::to_vec(value)?))
}

fn decode_segment<T: DeserializeOwned>(segment: &str, part: &'static str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(segment).map_err(|_| TokenError::Malformed(part))?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed(part))
}

fn read_private_key(bytes: &[u8]) -> Result<RsaPrivateKey, TokenError> {
    let pem = std::str::from_utf8(bytes)
        .ok()
        .filter(|text| text.trim_start().starts_with("-----BEGIN"));

    match pem {
        Some(pem) => RsaPrivateKey::from_pkcs1_pem(pem)
            .ok()
            .or_else(|| RsaPrivateKey::from_pkcs8_pem(pem).ok()),
        None => RsaPrivateKey::from_pkcs1_der(bytes)
            .ok()
            .or_else(|| RsaPrivateKey::from_pkcs8_der(bytes).ok()),
    }
    .ok_or(TokenError::PrivateKey)
}
