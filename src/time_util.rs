//! Utilities for handling time.

use std::time::SystemTime;

pub fn now_unixtime() -> i64 {
    unixtime(SystemTime::now())
}

/// Seconds since the epoch; times before it count as 0.
pub fn unixtime(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn t_unixtime() {
        assert_eq!(unixtime(SystemTime::UNIX_EPOCH + Duration::from_millis(1500)), 1);
        assert_eq!(unixtime(SystemTime::UNIX_EPOCH - Duration::from_secs(5)), 0);
        assert!(now_unixtime() > 1_600_000_000);
    }
}
