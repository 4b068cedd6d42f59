mod id;
mod listeners;

pub use id::*;
pub use listeners::*;

/// Current wall clock time in milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
