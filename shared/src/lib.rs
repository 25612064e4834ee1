//! Shared data structures and utilities for the Cloud Tasks emulator
//!
//! This crate contains the Cloud Tasks v2 wire types, resource name
//! validation, and configuration structures used by the emulator binary.

pub mod api;
pub mod config;
pub mod defaults;
pub mod names;

// Re-export commonly used types for convenience
pub use api::{Queue, QueueState, RateLimits, RetryConfig, Task};
pub use config::EmulatorConfig;
pub use names::{generate_task_id, validate_queue_name, validate_task_name};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Client-facing error taxonomy of the emulator.
///
/// The variants mirror the canonical RPC error codes the managed product
/// returns for the corresponding conditions; the REST facade maps them onto
/// HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum EmulatorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests;
