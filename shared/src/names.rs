//! Resource name grammar for queues and tasks
//!
//! Queue names follow `projects/<P>/locations/<L>/queues/<Q>` and task names
//! extend that with `/tasks/<T>`. Every segment value is limited to
//! alphanumerics, hyphens and underscores. These helpers are used by both the
//! REST facade (request validation) and the registry (initial queue setup).

use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

use crate::EmulatorError;

fn queue_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^projects/[A-Za-z0-9_-]+/locations/[A-Za-z0-9_-]+/queues/[A-Za-z0-9_-]+$")
            .expect("queue name pattern is valid")
    })
}

fn task_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^projects/[A-Za-z0-9_-]+/locations/[A-Za-z0-9_-]+/queues/[A-Za-z0-9_-]+/tasks/[A-Za-z0-9_-]+$",
        )
        .expect("task name pattern is valid")
    })
}

fn location_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^projects/[A-Za-z0-9_-]+/locations/[A-Za-z0-9_-]+$")
            .expect("location name pattern is valid")
    })
}

/// Validates a fully qualified queue name.
pub fn validate_queue_name(name: &str) -> Result<(), EmulatorError> {
    if queue_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(EmulatorError::InvalidArgument(format!(
            "queue name '{}' does not match projects/<PROJECT>/locations/<LOCATION>/queues/<QUEUE>",
            name
        )))
    }
}

/// Validates a fully qualified task name.
pub fn validate_task_name(name: &str) -> Result<(), EmulatorError> {
    if task_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(EmulatorError::InvalidArgument(format!(
            "task name '{}' does not match projects/<PROJECT>/locations/<LOCATION>/queues/<QUEUE>/tasks/<TASK>",
            name
        )))
    }
}

/// Validates a queue parent, i.e. `projects/<PROJECT>/locations/<LOCATION>`.
pub fn validate_location_name(name: &str) -> Result<(), EmulatorError> {
    if location_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(EmulatorError::InvalidArgument(format!(
            "parent '{}' does not match projects/<PROJECT>/locations/<LOCATION>",
            name
        )))
    }
}

/// Returns the queue portion of a task name.
///
/// The input is expected to be a valid task name; for anything else the
/// function returns the input unchanged.
pub fn task_parent(task_name: &str) -> &str {
    match task_name.rfind("/tasks/") {
        Some(idx) => &task_name[..idx],
        None => task_name,
    }
}

/// Builds a fully qualified task name from its parent queue and a task ID.
pub fn task_path(queue_name: &str, task_id: &str) -> String {
    format!("{}/tasks/{}", queue_name, task_id)
}

/// Generates a random task ID: 16 bytes rendered as 32 lowercase hex digits.
pub fn generate_task_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        validate_queue_name("projects/p/locations/l/queues/q").unwrap();
        validate_task_name("projects/p/locations/l/queues/q/tasks/t-1_A").unwrap();
        validate_location_name("projects/my-proj/locations/us-central1").unwrap();
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(validate_queue_name("projects/p/queues/q").is_err());
        assert!(validate_queue_name("projects/p/locations/l/queues/").is_err());
        assert!(validate_queue_name("projects/p/locations/l/queues/q/tasks/t").is_err());
        assert!(validate_task_name("projects/p/locations/l/queues/q").is_err());
        assert!(validate_task_name("projects/p/locations/l/queues/q/tasks/a b").is_err());
        assert!(validate_location_name("projects/p").is_err());
    }

    #[test]
    fn task_parent_strips_task_suffix() {
        assert_eq!(
            task_parent("projects/p/locations/l/queues/q/tasks/t"),
            "projects/p/locations/l/queues/q"
        );
        assert_eq!(task_parent("not-a-task-name"), "not-a-task-name");
    }

    #[test]
    fn generated_ids_are_hex_and_unique() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
