//! Outbound HTTP dispatch for tasks
//!
//! The dispatcher turns a claimed task into exactly one outbound HTTP
//! request: it resolves the target (App Engine targets are rewritten against
//! the configured emulator host), attaches the compatibility headers and the
//! OIDC bearer token, sends the request with the task's deadline, and
//! reduces the result to an outcome the queue's retry machine can interpret.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use shared::api::{headers, AppEngineRouting, HttpMethod, PayloadType};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use crate::oidc::OidcSigner;

/// Everything the dispatcher needs to fire one attempt.
///
/// Built by the queue under its lock and consumed without it, so a slow
/// target never blocks queue bookkeeping.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Fully qualified task name
    pub task_name: String,
    /// Fully qualified parent queue name
    pub queue_name: String,
    pub payload: PayloadType,
    /// Queue-level App Engine routing, applied when the task has none
    pub routing_override: Option<AppEngineRouting>,
    /// Attempts before this one
    pub retry_count: i32,
    /// Attempts that received an HTTP response
    pub execution_count: i32,
    /// Scheduled time of this attempt, in Unix seconds
    pub eta_unix: i64,
    /// Per-attempt timeout
    pub deadline: Duration,
}

impl DispatchRequest {
    /// Short task ID, i.e. the last segment of the task name.
    fn task_id(&self) -> &str {
        self.task_name.rsplit('/').next().unwrap_or(&self.task_name)
    }

    /// Short queue ID, i.e. the last segment of the queue name.
    fn queue_id(&self) -> &str {
        self.queue_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.queue_name)
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The target produced an HTTP response
    Response { status: u16 },
    /// The request was sent (or sending was attempted) but no HTTP response
    /// came back: connection refused, timeout, etc. Retried like a failure
    /// status.
    TransportError { message: String },
    /// The request could not be constructed at all: unresolvable App Engine
    /// target, invalid payload, signer failure. Never retried.
    NotDispatchable { message: String },
}

/// Issues outbound requests for every queue in the process.
pub struct HttpDispatcher {
    client: reqwest::Client,
    /// Authority of the App Engine emulator, e.g. `localhost:8080`
    app_engine_authority: Option<String>,
    signer: Arc<OidcSigner>,
}

impl HttpDispatcher {
    pub fn new(
        app_engine_authority: Option<String>,
        signer: Arc<OidcSigner>,
    ) -> anyhow::Result<Self> {
        // One shared client; per-attempt deadlines are applied per request.
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create dispatch HTTP client: {}", e))?;
        Ok(Self {
            client,
            app_engine_authority,
            signer,
        })
    }

    /// Fires one attempt and reduces the result to an outcome.
    pub async fn dispatch(&self, request: &DispatchRequest) -> DispatchOutcome {
        let builder = match self.prepare(request) {
            Ok(builder) => builder,
            Err(message) => {
                debug!(task = %request.task_name, %message, "Task is not dispatchable");
                return DispatchOutcome::NotDispatchable { message };
            }
        };

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                // Drain the body so the connection can be reused; the
                // emulator records only the status.
                let _ = response.bytes().await;
                DispatchOutcome::Response { status }
            }
            Err(e) if e.is_builder() => DispatchOutcome::NotDispatchable {
                message: e.to_string(),
            },
            Err(e) => DispatchOutcome::TransportError {
                message: e.to_string(),
            },
        }
    }

    /// Builds the outbound request, or explains why it cannot be built.
    fn prepare(&self, request: &DispatchRequest) -> Result<reqwest::RequestBuilder, String> {
        match &request.payload {
            PayloadType::HttpRequest(http) => self.prepare_http(request, http),
            PayloadType::AppEngineHttpRequest(app_engine) => {
                self.prepare_app_engine(request, app_engine)
            }
        }
    }

    fn prepare_http(
        &self,
        request: &DispatchRequest,
        http: &shared::api::HttpRequest,
    ) -> Result<reqwest::RequestBuilder, String> {
        let body = decode_body(&http.body)?;

        let mut builder = self
            .client
            .request(to_reqwest_method(http.http_method), &http.url)
            .timeout(request.deadline);

        for (name, value) in &http.headers {
            builder = builder.header(name, value);
        }
        builder = builder
            .header(headers::TASK_NAME, request.task_id())
            .header(headers::QUEUE_NAME, request.queue_id())
            .header(headers::TASK_RETRY_COUNT, request.retry_count.to_string())
            .header(
                headers::TASK_EXECUTION_COUNT,
                request.execution_count.to_string(),
            )
            .header(headers::TASK_ETA, request.eta_unix.to_string());

        if let Some(oidc) = &http.oidc_token {
            let audience = if oidc.audience.is_empty() {
                &http.url
            } else {
                &oidc.audience
            };
            let token = self
                .signer
                .sign(&oidc.service_account_email, audience)
                .map_err(|e| format!("OIDC signing failed: {}", e))?;
            builder = builder.bearer_auth(token);
        }

        Ok(builder.body(body))
    }

    fn prepare_app_engine(
        &self,
        request: &DispatchRequest,
        app_engine: &shared::api::AppEngineHttpRequest,
    ) -> Result<reqwest::RequestBuilder, String> {
        let authority = self
            .app_engine_authority
            .as_deref()
            .ok_or_else(|| "App Engine target support is not configured".to_string())?;

        let body = decode_body(&app_engine.body)?;

        // Task-level routing wins over the queue-level override.
        let service = app_engine
            .app_engine_routing
            .as_ref()
            .or(request.routing_override.as_ref())
            .map(|routing| routing.service.as_str())
            .unwrap_or("");
        let host = if service.is_empty() {
            authority.to_string()
        } else {
            format!("{}.{}", service, authority)
        };

        let relative_uri = if app_engine.relative_uri.is_empty() {
            "/"
        } else {
            &app_engine.relative_uri
        };
        let url = format!("http://{}{}", host, relative_uri);

        let mut builder = self
            .client
            .request(to_reqwest_method(app_engine.http_method), url)
            .timeout(request.deadline);

        for (name, value) in &app_engine.headers {
            builder = builder.header(name, value);
        }
        builder = builder
            .header(headers::APP_ENGINE_TASK_NAME, request.task_id())
            .header(headers::APP_ENGINE_QUEUE_NAME, request.queue_id())
            .header(
                headers::APP_ENGINE_TASK_RETRY_COUNT,
                request.retry_count.to_string(),
            )
            .header(
                headers::APP_ENGINE_TASK_EXECUTION_COUNT,
                request.execution_count.to_string(),
            )
            .header(headers::APP_ENGINE_TASK_ETA, request.eta_unix.to_string());

        Ok(builder.body(body))
    }
}

fn decode_body(body: &str) -> Result<Vec<u8>, String> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(body)
        .map_err(|e| format!("Task body is not valid base64: {}", e))
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::HttpMethodUnspecified | HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}
