//! Tests for the OIDC signer: JWK publication, discovery document and the
//! mint-then-verify law

use super::test_utils::shared_signer;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::oidc::{OidcSigner, DEFAULT_ISSUER};

#[derive(Debug, Deserialize)]
struct TokenClaims {
    iss: String,
    sub: String,
    email: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[test]
fn jwks_contains_a_single_signing_key() {
    let signer = shared_signer();
    let jwks = signer.jwks();
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    let key = &keys[0];
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["use"], "sig");
    assert_eq!(key["alg"], "RS256");
    assert_eq!(key["kid"], signer.kid());
    assert!(!key["n"].as_str().unwrap().is_empty());
    assert!(!key["e"].as_str().unwrap().is_empty());
}

#[test]
fn discovery_document_points_at_the_jwks() {
    let signer = OidcSigner::new(Some("http://localhost:9999".to_string())).unwrap();
    let document = signer.discovery_document();
    assert_eq!(document["issuer"], "http://localhost:9999");
    assert_eq!(document["jwks_uri"], "http://localhost:9999/jwks");
    assert_eq!(
        document["id_token_signing_alg_values_supported"],
        serde_json::json!(["RS256"])
    );
    assert_eq!(
        document["response_types_supported"],
        serde_json::json!(["id_token"])
    );
    assert_eq!(
        document["subject_types_supported"],
        serde_json::json!(["public"])
    );
    assert_eq!(
        document["claims_supported"],
        serde_json::json!(["iss", "sub", "aud", "iat", "exp", "email"])
    );
}

#[test]
fn unconfigured_issuer_falls_back_to_the_default_literal() {
    let signer = shared_signer();
    assert_eq!(signer.issuer(), DEFAULT_ISSUER);
    assert_eq!(signer.issuer(), "http://cloud-tasks-emulator");
}

#[test]
fn minted_tokens_verify_against_the_published_key() {
    let signer = shared_signer();
    let token = signer
        .sign("service@project.test", "https://target.example/handler")
        .unwrap();

    let header = decode_header(&token).unwrap();
    assert_eq!(header.alg, Algorithm::RS256);
    assert_eq!(header.kid.as_deref(), Some(signer.kid()));

    let (n, e) = signer.public_components();
    let key = DecodingKey::from_rsa_components(n, e).unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&["https://target.example/handler"]);
    validation.set_issuer(&[DEFAULT_ISSUER]);

    let data = decode::<TokenClaims>(&token, &key, &validation).unwrap();
    assert_eq!(data.claims.iss, DEFAULT_ISSUER);
    assert_eq!(data.claims.sub, "service@project.test");
    assert_eq!(data.claims.email, "service@project.test");
    assert_eq!(data.claims.aud, "https://target.example/handler");
    assert_eq!(data.claims.exp - data.claims.iat, 3600);
    assert!(data.claims.iat <= crate::clock::unix_seconds(crate::clock::now()));
}

#[test]
fn tokens_from_another_key_do_not_verify() {
    let signer = shared_signer();
    let other = OidcSigner::new(None).unwrap();
    let token = other.sign("intruder@example.test", "https://aud").unwrap();

    let (n, e) = signer.public_components();
    let key = DecodingKey::from_rsa_components(n, e).unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&["https://aud"]);

    assert!(decode::<TokenClaims>(&token, &key, &validation).is_err());
}
