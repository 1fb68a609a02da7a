// Time types used across the control plane.
//
// All persisted timestamps are UTC milliseconds. System time is fine here:
// nothing off-chain is consensus-critical, but SLA deadlines and lease expiry
// are compared against these values, so callers must never mix seconds and
// millis - use the dedicated types.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Millis timestamps used to determine it using its type
pub type TimestampMillis = u64;

// Seconds timestamps used to determine it using its type
pub type TimestampSeconds = u64;

#[inline]
pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Incorrect time returned from get_current_time")
}

// Return timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

// Return timestamp in milliseconds
// We cast it to u64 as we have plenty of time before it overflows
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_and_seconds_agree() {
        let millis = get_current_time_in_millis();
        let seconds = get_current_time_in_seconds();
        assert!(millis / 1000 >= seconds);
        assert!(millis / 1000 - seconds <= 1);
    }
}
