//! Conversions between manifest ticks and wall-clock durations.

use std::time::Duration;

/// Timescale used when neither the stream nor the manifest declares one (100ns ticks).
pub const DEFAULT_TIMESCALE: u64 = 10_000_000;

pub const NSECS_PER_SEC: u64 = 1_000_000_000;

/// Computes `value * num / denom`, rounding to the nearest integer.
///
/// The intermediate product is widened to 128 bits so large tick counts do not overflow.
/// A zero denominator yields `u64::MAX`.
pub fn scale_round(value: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let product = value as u128 * num as u128 + (denom as u128 / 2);
    u64::try_from(product / denom as u128).unwrap_or(u64::MAX)
}

/// Converts a tick count in `timescale` units to a duration.
pub fn ticks_to_duration(ticks: u64, timescale: u64) -> Duration {
    Duration::from_nanos(scale_round(ticks, NSECS_PER_SEC, timescale))
}

/// Converts a duration to a tick count in `timescale` units.
pub fn duration_to_ticks(time: Duration, timescale: u64) -> u64 {
    let nanos = u64::try_from(time.as_nanos()).unwrap_or(u64::MAX);
    scale_round(nanos, timescale, NSECS_PER_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_instead_of_truncating() {
        assert_eq!(scale_round(5, 1, 10), 1);
        assert_eq!(scale_round(4, 1, 10), 0);
        assert_eq!(scale_round(15, 1, 10), 2);
    }

    #[test]
    fn converts_default_timescale_ticks() {
        assert_eq!(ticks_to_duration(10_000_000, DEFAULT_TIMESCALE), Duration::from_secs(1));
        assert_eq!(duration_to_ticks(Duration::from_millis(1500), DEFAULT_TIMESCALE), 15_000_000);
    }

    #[test]
    fn survives_large_values() {
        let ticks = u64::MAX / 2;
        assert_eq!(scale_round(ticks, NSECS_PER_SEC, NSECS_PER_SEC), ticks);
        assert_eq!(scale_round(1, 1, 0), u64::MAX);
    }
}
