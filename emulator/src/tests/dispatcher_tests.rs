//! Tests for the HTTP dispatcher: header fidelity, OIDC tokens, App Engine
//! target resolution and error classification

use super::test_utils::*;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use shared::api::{
    headers, AppEngineHttpRequest, AppEngineRouting, HttpMethod, HttpRequest, OidcToken,
    PayloadType,
};
use std::collections::HashMap;
use tokio::time::Duration;

use crate::dispatcher::{DispatchOutcome, DispatchRequest, HttpDispatcher};

fn dispatch_request(payload: PayloadType) -> DispatchRequest {
    DispatchRequest {
        task_name: format!("{}/tasks/direct-task", QUEUE_NAME),
        queue_name: QUEUE_NAME.to_string(),
        payload,
        routing_override: None,
        retry_count: 2,
        execution_count: 1,
        eta_unix: 1_700_000_000,
        deadline: Duration::from_secs(10),
    }
}

fn plain_dispatcher() -> HttpDispatcher {
    HttpDispatcher::new(None, shared_signer()).unwrap()
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    iss: String,
    sub: String,
    email: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[tokio::test]
async fn http_dispatch_attaches_the_contract_headers() {
    let server = TargetServer::start().await;
    let dispatcher = plain_dispatcher();

    let mut user_headers = HashMap::new();
    user_headers.insert("X-Custom-Header".to_string(), "kept".to_string());
    let payload = PayloadType::HttpRequest(HttpRequest {
        url: server.url("/payload"),
        http_method: HttpMethod::Post,
        headers: user_headers,
        body: BASE64_STANDARD.encode("hello world"),
        oidc_token: None,
    });

    let outcome = dispatcher.dispatch(&dispatch_request(payload)).await;
    assert!(matches!(outcome, DispatchOutcome::Response { status: 200 }));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/payload");
    assert_eq!(request.body, b"hello world");
    assert_eq!(request.header("X-Custom-Header"), Some("kept"));
    assert_eq!(request.header(headers::TASK_NAME), Some("direct-task"));
    assert_eq!(request.header(headers::QUEUE_NAME), Some("primary"));
    assert_eq!(request.header(headers::TASK_RETRY_COUNT), Some("2"));
    assert_eq!(request.header(headers::TASK_EXECUTION_COUNT), Some("1"));
    assert_eq!(request.header(headers::TASK_ETA), Some("1700000000"));
}

#[tokio::test]
async fn oidc_token_is_minted_and_verifiable_against_the_jwks() {
    let server = TargetServer::start().await;
    let dispatcher = plain_dispatcher();
    let signer = shared_signer();

    let payload = PayloadType::HttpRequest(HttpRequest {
        url: server.url("/secure"),
        http_method: HttpMethod::Get,
        oidc_token: Some(OidcToken {
            service_account_email: "robot@example.test".to_string(),
            audience: "http://audience.example".to_string(),
        }),
        ..Default::default()
    });

    let outcome = dispatcher.dispatch(&dispatch_request(payload)).await;
    assert!(matches!(outcome, DispatchOutcome::Response { status: 200 }));

    let requests = server.requests();
    let authorization = requests[0].header("authorization").unwrap();
    let token = authorization.strip_prefix("Bearer ").unwrap();

    // The key id in the token header matches the published JWK.
    let header = decode_header(token).unwrap();
    assert_eq!(header.kid.as_deref(), Some(signer.kid()));

    let (n, e) = signer.public_components();
    let key = DecodingKey::from_rsa_components(n, e).unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&["http://audience.example"]);
    validation.set_issuer(&[signer.issuer()]);
    let data = decode::<TokenClaims>(token, &key, &validation).unwrap();

    assert_eq!(data.claims.iss, crate::oidc::DEFAULT_ISSUER);
    assert_eq!(data.claims.sub, "robot@example.test");
    assert_eq!(data.claims.email, "robot@example.test");
    assert_eq!(data.claims.aud, "http://audience.example");
    assert_eq!(data.claims.exp - data.claims.iat, 3600);
}

#[tokio::test]
async fn oidc_audience_defaults_to_the_target_url() {
    let server = TargetServer::start().await;
    let dispatcher = plain_dispatcher();
    let signer = shared_signer();
    let url = server.url("/default-audience");

    let payload = PayloadType::HttpRequest(HttpRequest {
        url: url.clone(),
        http_method: HttpMethod::Get,
        oidc_token: Some(OidcToken {
            service_account_email: "robot@example.test".to_string(),
            audience: String::new(),
        }),
        ..Default::default()
    });

    dispatcher.dispatch(&dispatch_request(payload)).await;

    let requests = server.requests();
    let token = requests[0]
        .header("authorization")
        .unwrap()
        .strip_prefix("Bearer ")
        .unwrap()
        .to_string();

    let (n, e) = signer.public_components();
    let key = DecodingKey::from_rsa_components(n, e).unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[url.as_str()]);
    let data = decode::<TokenClaims>(&token, &key, &validation).unwrap();
    assert_eq!(data.claims.aud, url);
}

#[tokio::test]
async fn app_engine_target_is_rewritten_against_the_emulator_host() {
    let server = TargetServer::start().await;
    let dispatcher = HttpDispatcher::new(Some(server.authority()), shared_signer()).unwrap();

    let payload = PayloadType::AppEngineHttpRequest(AppEngineHttpRequest {
        relative_uri: "/background-work".to_string(),
        ..Default::default()
    });

    let outcome = dispatcher.dispatch(&dispatch_request(payload)).await;
    assert!(matches!(outcome, DispatchOutcome::Response { status: 200 }));

    let requests = server.requests();
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/background-work");
    assert_eq!(request.header("host"), Some(server.authority().as_str()));
    assert_eq!(
        request.header(headers::APP_ENGINE_TASK_NAME),
        Some("direct-task")
    );
    assert_eq!(
        request.header(headers::APP_ENGINE_QUEUE_NAME),
        Some("primary")
    );
    assert_eq!(
        request.header(headers::APP_ENGINE_TASK_RETRY_COUNT),
        Some("2")
    );
    assert_eq!(
        request.header(headers::APP_ENGINE_TASK_EXECUTION_COUNT),
        Some("1")
    );
    assert_eq!(
        request.header(headers::APP_ENGINE_TASK_ETA),
        Some("1700000000")
    );
}

#[tokio::test]
async fn empty_relative_uri_resolves_to_root() {
    let server = TargetServer::start().await;
    let dispatcher = HttpDispatcher::new(Some(server.authority()), shared_signer()).unwrap();

    let payload = PayloadType::AppEngineHttpRequest(AppEngineHttpRequest::default());
    let outcome = dispatcher.dispatch(&dispatch_request(payload)).await;
    assert!(matches!(outcome, DispatchOutcome::Response { status: 200 }));
    assert_eq!(server.requests()[0].path, "/");
}

#[tokio::test]
async fn routing_service_prefixes_the_host() {
    let server = TargetServer::start().await;
    let dispatcher = HttpDispatcher::new(Some(server.authority()), shared_signer()).unwrap();

    let mut request = dispatch_request(PayloadType::AppEngineHttpRequest(
        AppEngineHttpRequest {
            app_engine_routing: Some(AppEngineRouting {
                service: "background".to_string(),
                ..Default::default()
            }),
            relative_uri: "/via-service".to_string(),
            ..Default::default()
        },
    ));
    request.deadline = Duration::from_secs(2);

    // `background.127.0.0.1` does not resolve, which is exactly the point:
    // the request went to the service-prefixed host, not the bare authority.
    let outcome = dispatcher.dispatch(&request).await;
    assert!(!matches!(outcome, DispatchOutcome::Response { .. }));
    assert_eq!(server.request_count(), 0);
}

#[tokio::test]
async fn app_engine_dispatch_without_a_host_is_not_retried() {
    let dispatcher = plain_dispatcher();
    let payload = PayloadType::AppEngineHttpRequest(AppEngineHttpRequest::default());
    let outcome = dispatcher.dispatch(&dispatch_request(payload)).await;
    assert!(matches!(outcome, DispatchOutcome::NotDispatchable { .. }));
}

#[tokio::test]
async fn connection_failure_is_a_transport_error() {
    let dispatcher = plain_dispatcher();
    let payload = PayloadType::HttpRequest(HttpRequest {
        url: "http://127.0.0.1:1/unreachable".to_string(),
        http_method: HttpMethod::Get,
        ..Default::default()
    });
    let outcome = dispatcher.dispatch(&dispatch_request(payload)).await;
    assert!(matches!(outcome, DispatchOutcome::TransportError { .. }));
}

#[tokio::test]
async fn failure_status_is_reported_verbatim() {
    let server = TargetServer::start().await;
    let dispatcher = plain_dispatcher();
    let payload = PayloadType::HttpRequest(HttpRequest {
        url: server.url("/status/405"),
        http_method: HttpMethod::Post,
        ..Default::default()
    });
    let outcome = dispatcher.dispatch(&dispatch_request(payload)).await;
    assert!(matches!(outcome, DispatchOutcome::Response { status: 405 }));
}

#[tokio::test]
async fn dispatch_deadline_cuts_off_slow_targets() {
    let server = TargetServer::start().await;
    let dispatcher = plain_dispatcher();
    let mut request = dispatch_request(PayloadType::HttpRequest(HttpRequest {
        url: server.url("/slow/2000"),
        http_method: HttpMethod::Get,
        ..Default::default()
    }));
    request.deadline = Duration::from_millis(200);

    let outcome = dispatcher.dispatch(&request).await;
    assert!(matches!(outcome, DispatchOutcome::TransportError { .. }));
}
