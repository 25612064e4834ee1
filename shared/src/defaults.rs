//! Default values for configuration and queue parameters
//!
//! This module centralizes all default value functions used by the wire types
//! and the emulator configuration. The queue and retry defaults match the
//! documented defaults of the managed Cloud Tasks product so that queues
//! created without an explicit configuration behave like real ones.

// Queue rate limit defaults

/// Default maximum task dispatches per second (500)
pub fn default_max_dispatches_per_second() -> f64 {
    500.0
}

/// Default token bucket size for dispatch bursts (100)
pub fn default_max_burst_size() -> i32 {
    100
}

/// Default maximum number of concurrent dispatches (1000)
pub fn default_max_concurrent_dispatches() -> i32 {
    1000
}

// Queue retry defaults

/// Default maximum number of attempts per task (100); `-1` means unlimited
pub fn default_max_attempts() -> i32 {
    100
}

/// Default minimum backoff between retries (0.1 seconds)
pub fn default_min_backoff() -> f64 {
    0.1
}

/// Default maximum backoff between retries (1 hour)
pub fn default_max_backoff() -> f64 {
    3600.0
}

/// Default number of backoff doublings before the schedule goes linear (16)
pub fn default_max_doublings() -> i32 {
    16
}

// Task defaults

/// Default deadline for a single outbound dispatch (10 minutes).
///
/// This matches the maximum HTTP task deadline of the managed product and is
/// applied when a task carries no `dispatch_deadline` of its own.
pub fn default_dispatch_deadline() -> f64 {
    600.0
}

// Emulator process defaults

/// Default listen host for the REST facade
pub fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

/// Default listen port for the REST facade
pub fn default_listen_port() -> u16 {
    8123
}
