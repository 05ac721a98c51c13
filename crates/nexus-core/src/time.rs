//! Wall-clock helpers
//!
//! Every protocol timestamp in nexus is nanoseconds since the Unix epoch,
//! captured at each hop of a query's path.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in nanoseconds since the Unix epoch
pub fn unix_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotone_enough() {
        let a = unix_now_ns();
        let b = unix_now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
