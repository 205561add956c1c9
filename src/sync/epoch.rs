//! Conversions between GPS week time and Unix time

/// GPS epoch (1980-01-06T00:00:00Z) in seconds since the Unix epoch
pub const GPS_EPOCH_UNIX_SECS: i64 = 315_964_800;

/// Seconds in a GPS week
pub const SECONDS_PER_WEEK: i64 = 604_800;

/// Milliseconds in a GPS week
pub const MS_PER_WEEK: u32 = 604_800_000;

/// Converts GPS week and time of week to microseconds since the Unix epoch
///
/// GPS time does not observe leap seconds; `leap_seconds` is the GPS-UTC
/// difference subtracted to land on UTC based wall-clock time.
pub fn gps_time_to_absolute(week: u16, ms_into_week: u32, leap_seconds: i64) -> i64 {
    let secs = GPS_EPOCH_UNIX_SECS + i64::from(week) * SECONDS_PER_WEEK - leap_seconds;
    secs * 1_000_000 + i64::from(ms_into_week) * 1_000
}

/// Converts microseconds since the Unix epoch to GPS week and time of week
///
/// Returns `None` for instants before the GPS epoch or past week 65535.
pub fn absolute_to_gps_time(unix_us: i64, leap_seconds: i64) -> Option<(u16, u32)> {
    let gps_ms = (unix_us + leap_seconds * 1_000_000) / 1_000 - GPS_EPOCH_UNIX_SECS * 1_000;
    if gps_ms < 0 {
        return None;
    }

    let week = gps_ms / i64::from(MS_PER_WEEK);
    let ms_into_week = gps_ms % i64::from(MS_PER_WEEK);
    let week = u16::try_from(week).ok()?;
    Some((week, ms_into_week as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_instant() {
        // GPS week 2300 began 2024-02-04T00:00:00 GPS, 18 s ahead of UTC
        let us = gps_time_to_absolute(2300, 0, 18);
        assert_eq!(us, 1_707_004_782 * 1_000_000);

        let us = gps_time_to_absolute(2300, 1_500, 18);
        assert_eq!(us, 1_707_004_783_500_000);
    }

    #[test]
    fn test_epoch_and_leap_constant() {
        assert_eq!(gps_time_to_absolute(0, 0, 0), GPS_EPOCH_UNIX_SECS * 1_000_000);
        assert_eq!(
            gps_time_to_absolute(1, 0, 18) - gps_time_to_absolute(1, 0, 17),
            -1_000_000
        );
    }

    #[test]
    fn test_monotonic_and_deterministic() {
        let samples = [
            (2000u16, 0u32),
            (2000, 1),
            (2000, MS_PER_WEEK - 1),
            (2001, 0),
            (2001, 345_600_000),
            (2350, 12),
        ];
        let values: Vec<i64> = samples
            .iter()
            .map(|&(w, ms)| gps_time_to_absolute(w, ms, 18))
            .collect();

        for pair in values.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // End of one week runs straight into the next
        assert_eq!(values[3] - values[2], 1_000);
        assert_eq!(values, samples.iter().map(|&(w, ms)| gps_time_to_absolute(w, ms, 18)).collect::<Vec<_>>());
    }

    #[test]
    fn test_inverse() {
        let us = gps_time_to_absolute(2321, 123_456_789, 18);
        assert_eq!(absolute_to_gps_time(us, 18), Some((2321, 123_456_789)));
        assert_eq!(absolute_to_gps_time(0, 18), None);
    }
}
