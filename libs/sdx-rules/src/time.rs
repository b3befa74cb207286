//! Time provider abstraction and the stored timestamp format
//!
//! Rule start/stop times are stored as fixed-width UTC text so that SQL
//! `ORDER BY starttime` yields chronological order. The manager reads "now"
//! through [`TimeProvider`] so tests can move time without sleeping.

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use parking_lot::Mutex;

use crate::error::{Result, RuleError};

/// Storage and comparison format for rule timestamps
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Time provider trait for the wall clock the manager evaluates rules against
pub trait TimeProvider: Send + Sync + 'static {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// System time provider using the local clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven time provider for testing
///
/// Starts at a given instant and only moves when [`ManualTimeProvider::advance`]
/// or [`ManualTimeProvider::set`] is called.
#[derive(Debug)]
pub struct ManualTimeProvider {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeProvider {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(normalize(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = normalize(to);
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Truncate to the precision the store keeps
pub fn normalize(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(3)
}

/// Render a timestamp in [`TIME_FORMAT`]
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a stored timestamp
///
/// Accepts the storage format and, for caller-provided values, any RFC3339
/// timestamp.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, TIME_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| normalize(t.with_timezone(&Utc)))
        .map_err(|e| RuleError::Serialization(format!("invalid timestamp '{}': {}", s, e)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_system_time_provider() {
        let provider = SystemTimeProvider;
        let t1 = provider.now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let t2 = provider.now();
        assert!(t2 > t1);
    }

    #[test]
    fn test_manual_time_provider() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let provider = ManualTimeProvider::new(start);
        assert_eq!(provider.now(), start);
        assert_eq!(provider.now(), start);

        provider.advance(Duration::seconds(60));
        assert_eq!(provider.now(), start + Duration::seconds(60));
    }

    #[test]
    fn test_format_round_trip() {
        let t = Utc.with_ymd_and_hms(2026, 3, 9, 7, 5, 1).unwrap() + Duration::milliseconds(42);
        let s = format_time(&t);
        assert_eq!(s, "2026-03-09T07:05:01.042Z");
        assert_eq!(parse_time(&s).unwrap(), t);
    }

    #[test]
    fn test_text_order_matches_time_order() {
        let base = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let times = [
            base,
            base + Duration::milliseconds(1),
            base + Duration::seconds(9),
            base + Duration::seconds(10),
            base + Duration::days(400),
        ];
        let rendered: Vec<String> = times.iter().map(format_time).collect();
        let mut sorted = rendered.clone();
        sorted.sort();
        assert_eq!(rendered, sorted);
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let t = parse_time("2026-05-01T10:00:00.123456+02:00").unwrap();
        assert_eq!(format_time(&t), "2026-05-01T08:00:00.123Z");
        assert!(parse_time("yesterday").is_err());
    }
}
