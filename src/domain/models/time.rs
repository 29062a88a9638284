//! Time arithmetic for budget accounting.
//!
//! Reporting times are nanosecond timestamps. Budgets are tracked per key in
//! hourly buckets grouped by day: the time group is the day index since the
//! epoch, the time bucket is the hour-of-day index in `[0, 23]`.

/// Nanoseconds since the Unix epoch.
pub type Timestamp = u64;

/// Day index since the epoch.
pub type TimeGroup = u64;

/// Hour index within a day, in `[0, 23]`.
pub type TimeBucket = u64;

/// Number of privacy-budget tokens.
pub type TokenCount = u64;

pub const NANOS_PER_HOUR: u64 = 3_600 * 1_000_000_000;
pub const NANOS_PER_DAY: u64 = 24 * NANOS_PER_HOUR;

/// Hourly buckets tracked per time group.
pub const HOURS_PER_DAY: u64 = 24;

/// Initial token balance of a freshly created hourly timeframe.
pub const DEFAULT_MAX_TOKEN_COUNT: TokenCount = 24;

/// Day index the reporting time falls into.
pub fn time_group_of(reporting_time: Timestamp) -> TimeGroup {
    reporting_time / NANOS_PER_DAY
}

/// Hour-of-day index the reporting time falls into.
pub fn time_bucket_of(reporting_time: Timestamp) -> TimeBucket {
    (reporting_time % NANOS_PER_DAY) / NANOS_PER_HOUR
}

/// Reporting time at the start of the given day and hour. Useful for
/// addressing a bucket directly.
pub fn reporting_time_for(time_group: TimeGroup, time_bucket: TimeBucket) -> Timestamp {
    time_group * NANOS_PER_DAY + time_bucket * NANOS_PER_HOUR
}
