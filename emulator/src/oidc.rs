//! OIDC token signing for HTTP tasks
//!
//! Tasks configured with an `oidc_token` get an `Authorization: Bearer`
//! header carrying a self-signed JWT. The signer generates one RSA-2048 key
//! pair at process start and publishes the public half as a JWK set, so task
//! handlers can verify the tokens exactly as they would verify real ones.
//! The signer accepts any service account email and audience without
//! checking that the account exists or that the caller may act for it.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use tracing::info;

use crate::clock;

/// Issuer used when no `openid_issuer` is configured
pub const DEFAULT_ISSUER: &str = "http://cloud-tasks-emulator";

/// Lifetime of minted tokens, matching the managed product
const TOKEN_LIFETIME_SECONDS: i64 = 3600;

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    email: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Holds the process-lifetime key pair and mints tokens on demand.
///
/// Key material is generated once in [`OidcSigner::new`] and is read-only
/// afterwards, so the signer is freely shareable across dispatch tasks.
pub struct OidcSigner {
    encoding_key: EncodingKey,
    issuer: String,
    kid: String,
    /// JWK fields of the public key, base64url without padding
    jwk_n: String,
    jwk_e: String,
}

impl OidcSigner {
    /// Generates the key pair and derives the key ID.
    pub fn new(issuer: Option<String>) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key =
            RsaPrivateKey::new(&mut rng, 2048).context("Failed to generate RSA key pair")?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_der = private_key
            .to_pkcs1_der()
            .context("Failed to encode RSA private key")?;
        let encoding_key = EncodingKey::from_rsa_der(private_der.as_bytes());

        // The key ID is a stable fingerprint of the public key so that
        // restarts with a persisted key (not currently supported) would keep
        // the same JWKS entry.
        let public_der = public_key
            .to_pkcs1_der()
            .context("Failed to encode RSA public key")?;
        let kid = blake3::hash(public_der.as_bytes()).to_hex()[..16].to_string();

        let jwk_n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let jwk_e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());

        let issuer = issuer.unwrap_or_else(|| DEFAULT_ISSUER.to_string());
        info!(issuer = %issuer, kid = %kid, "OIDC signer initialized");

        Ok(Self {
            encoding_key,
            issuer,
            kid,
            jwk_n,
            jwk_e,
        })
    }

    #[allow(dead_code)]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[allow(dead_code)]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Base64url modulus and exponent of the public key, as published in the
    /// JWK set.
    #[allow(dead_code)]
    pub fn public_components(&self) -> (&str, &str) {
        (&self.jwk_n, &self.jwk_e)
    }

    /// Mints a signed token for the given service account email and
    /// audience.
    pub fn sign(&self, email: &str, audience: &str) -> Result<String> {
        let now = clock::unix_seconds(clock::now());
        let claims = Claims {
            iss: &self.issuer,
            sub: email,
            email,
            aud: audience,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECONDS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());

        encode(&header, &claims, &self.encoding_key).context("Failed to sign OIDC token")
    }

    /// The JWK set served at `/jwks`.
    pub fn jwks(&self) -> serde_json::Value {
        serde_json::json!({
            "keys": [
                {
                    "kty": "RSA",
                    "use": "sig",
                    "alg": "RS256",
                    "kid": self.kid,
                    "n": self.jwk_n,
                    "e": self.jwk_e,
                }
            ]
        })
    }

    /// The OpenID discovery document served at
    /// `/.well-known/openid-configuration`.
    pub fn discovery_document(&self) -> serde_json::Value {
        let base = self.issuer.trim_end_matches('/');
        serde_json::json!({
            "issuer": self.issuer,
            "jwks_uri": format!("{}/jwks", base),
            "id_token_signing_alg_values_supported": ["RS256"],
            "response_types_supported": ["id_token"],
            "subject_types_supported": ["public"],
            "claims_supported": ["iss", "sub", "aud", "iat", "exp", "email"],
        })
    }
}
