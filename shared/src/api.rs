//! Cloud Tasks v2 wire types
//!
//! This module defines the JSON representations of queues, tasks and their
//! nested messages as they appear on the v2 REST surface. Field names are
//! camelCase, timestamps are RFC 3339 strings and protobuf durations are
//! `"3.5s"`-style strings, so that clients generated against the real API can
//! talk to the emulator unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::defaults::*;

/// Operational state of a queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    #[default]
    StateUnspecified,
    Running,
    Paused,
    /// Reserved by the API; the emulator never enters this state.
    Disabled,
}

/// A queue resource as it travels over the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Queue {
    /// Fully qualified name: `projects/<P>/locations/<L>/queues/<Q>`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// App Engine routing applied to every task in the queue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_engine_routing_override: Option<AppEngineRouting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    pub state: QueueState,
}

/// Dispatch rate limits of a queue.
///
/// Missing fields deserialize to the documented defaults of the managed
/// product, so a bare `{}` yields a fully usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimits {
    pub max_dispatches_per_second: f64,
    pub max_burst_size: i32,
    pub max_concurrent_dispatches: i32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_dispatches_per_second: default_max_dispatches_per_second(),
            max_burst_size: default_max_burst_size(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
        }
    }
}

/// Retry configuration of a queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Maximum attempts per task; `-1` means unlimited
    pub max_attempts: i32,
    /// Time limit for retrying a task, measured from its first attempt
    #[serde(with = "duration_secs_opt", skip_serializing_if = "Option::is_none")]
    pub max_retry_duration: Option<f64>,
    #[serde(with = "duration_secs")]
    pub min_backoff: f64,
    #[serde(with = "duration_secs")]
    pub max_backoff: f64,
    pub max_doublings: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_retry_duration: None,
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            max_doublings: default_max_doublings(),
        }
    }
}

/// App Engine routing of a task: service, version and instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppEngineRouting {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instance: String,
    /// Output-only on the real API; the emulator leaves it empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
}

/// HTTP method of an outbound dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HttpMethod {
    HttpMethodUnspecified,
    #[default]
    Post,
    Get,
    Head,
    Put,
    Delete,
    Patch,
    Options,
}

impl HttpMethod {
    /// The method name as sent on the wire; unspecified maps to POST.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::HttpMethodUnspecified | HttpMethod::Post => "POST",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// OIDC token configuration of an HTTP task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OidcToken {
    pub service_account_email: String,
    /// Defaults to the task's target URL when empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub audience: String,
}

/// Payload of a task targeting an arbitrary HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRequest {
    pub url: String,
    pub http_method: HttpMethod,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Request body, base64-encoded on the wire
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oidc_token: Option<OidcToken>,
}

/// Payload of a task targeting an App Engine-style service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppEngineHttpRequest {
    pub http_method: HttpMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_engine_routing: Option<AppEngineRouting>,
    /// Defaults to `/` when empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub relative_uri: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Request body, base64-encoded on the wire
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
}

/// The tagged payload variant of a task.
///
/// Serialized externally tagged and flattened into [`Task`], which yields the
/// protobuf oneof JSON shape: `{"httpRequest": {...}}` or
/// `{"appEngineHttpRequest": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum PayloadType {
    HttpRequest(HttpRequest),
    AppEngineHttpRequest(AppEngineHttpRequest),
}

/// Status of a dispatch attempt, in canonical RPC code terms
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RpcStatus {
    pub code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl RpcStatus {
    /// Maps an HTTP response status onto the canonical code space.
    pub fn from_http(status: u16) -> Self {
        let code = match status {
            200..=299 => 0,
            400 => 3,
            401 => 16,
            403 => 7,
            404 => 5,
            408 => 4,
            409 => 10,
            412 => 9,
            429 => 8,
            499 => 1,
            500 => 13,
            501 => 12,
            502..=504 => 14,
            _ => 2,
        };
        let message = if (200..=299).contains(&status) {
            String::new()
        } else {
            format!("HTTP status code {}", status)
        };
        Self { code, message }
    }

    /// Status recorded when the request never produced an HTTP response.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            code: 14,
            message: message.into(),
        }
    }

    /// Status recorded when the dispatch could not be constructed at all.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: 13,
            message: message.into(),
        }
    }
}

/// Descriptor of a single dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Attempt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<RpcStatus>,
}

/// A task resource as it travels over the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    /// Fully qualified name: `.../queues/<Q>/tasks/<T>`; assigned by the
    /// emulator when the client leaves it empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(flatten)]
    pub payload: Option<PayloadType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    /// Deadline of a single outbound request; defaults to 10 minutes
    #[serde(with = "duration_secs_opt", skip_serializing_if = "Option::is_none")]
    pub dispatch_deadline: Option<f64>,
    pub dispatch_count: i32,
    pub response_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_attempt: Option<Attempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<Attempt>,
}

/// Request body of `CreateTask`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTaskRequest {
    pub task: Task,
    /// Accepted for compatibility; the emulator always returns the full view
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_view: String,
}

/// Response body of `ListQueues`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ListQueuesResponse {
    pub queues: Vec<Queue>,
}

/// Response body of `ListTasks`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
}

/// Headers attached to every outbound dispatch.
///
/// These names are part of the compatibility contract: handlers written
/// against the managed product key off them.
pub mod headers {
    pub const TASK_NAME: &str = "X-CloudTasks-TaskName";
    pub const QUEUE_NAME: &str = "X-CloudTasks-QueueName";
    pub const TASK_RETRY_COUNT: &str = "X-CloudTasks-TaskRetryCount";
    pub const TASK_EXECUTION_COUNT: &str = "X-CloudTasks-TaskExecutionCount";
    pub const TASK_ETA: &str = "X-CloudTasks-TaskETA";

    pub const APP_ENGINE_TASK_NAME: &str = "X-AppEngine-TaskName";
    pub const APP_ENGINE_QUEUE_NAME: &str = "X-AppEngine-QueueName";
    pub const APP_ENGINE_TASK_RETRY_COUNT: &str = "X-AppEngine-TaskRetryCount";
    pub const APP_ENGINE_TASK_EXECUTION_COUNT: &str = "X-AppEngine-TaskExecutionCount";
    pub const APP_ENGINE_TASK_ETA: &str = "X-AppEngine-TaskETA";
}

/// Serde adapter for protobuf JSON durations carried as fractional seconds.
///
/// The wire format is a decimal-seconds string with an `s` suffix
/// (`"0.1s"`, `"3600s"`); bare numbers are accepted on input for
/// convenience.
pub mod duration_secs {
    use serde::de::{Error, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(SecondsVisitor)
    }

    pub(super) struct SecondsVisitor;

    impl Visitor<'_> for SecondsVisitor {
        type Value = f64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like \"3.5s\" or a number of seconds")
        }

        fn visit_str<E: Error>(self, value: &str) -> Result<f64, E> {
            let digits = value.strip_suffix('s').unwrap_or(value);
            digits
                .parse::<f64>()
                .map_err(|_| E::custom(format!("invalid duration '{}'", value)))
        }

        fn visit_f64<E: Error>(self, value: f64) -> Result<f64, E> {
            Ok(value)
        }

        fn visit_u64<E: Error>(self, value: u64) -> Result<f64, E> {
            Ok(value as f64)
        }

        fn visit_i64<E: Error>(self, value: i64) -> Result<f64, E> {
            Ok(value as f64)
        }
    }
}

/// Like [`duration_secs`], for optional fields.
pub mod duration_secs_opt {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(secs) => serializer.serialize_str(&format!("{}s", secs)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer
            .deserialize_any(super::duration_secs::SecondsVisitor)
            .map(Some)
    }
}
