//! Time source for the emulator
//!
//! Everything that needs "now" or a delayed firing goes through this module:
//! wall-clock readings come from `chrono`, delayed firings from the tokio
//! timer. Routing all timers through tokio means tests can run under a
//! paused runtime and drive time forward deterministically.

use chrono::{DateTime, Utc};
use tokio::time::{sleep, Duration};

/// Current wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Sleeps until the given wall-clock time.
///
/// Returns immediately when the time has already passed.
pub async fn sleep_until_wall(when: DateTime<Utc>) {
    if let Ok(delay) = (when - now()).to_std() {
        sleep(delay).await;
    }
}

/// Converts a wall-clock time to whole Unix seconds.
pub fn unix_seconds(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}

/// Converts fractional seconds to a `Duration`, clamping negatives to zero.
pub fn duration_from_secs(secs: f64) -> Duration {
    if secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(secs)
    }
}
