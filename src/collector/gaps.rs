use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

use crate::models::{floor_hour, CollectionMode, MissingRange};

/// Resolve the hourly target range a collection mode covers
///
/// `now` is truncated to the hour. Backward stops before the current hour;
/// forward and gap-fill include it. Returns `None` when the range is empty.
pub fn target_range(
    mode: CollectionMode,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    last_known: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default_lookback: Duration,
) -> Option<MissingRange> {
    let current_hour = floor_hour(now);
    let default_start = current_hour - default_lookback;

    let (range_start, horizon) = match mode {
        CollectionMode::Backward => (start.unwrap_or(default_start), current_hour),
        CollectionMode::Forward => (
            last_known.or(start).unwrap_or(default_start),
            current_hour + Duration::hours(1),
        ),
        CollectionMode::GapFill => (
            start.unwrap_or(default_start),
            current_hour + Duration::hours(1),
        ),
    };

    let range_end = end.map(|e| e.min(horizon)).unwrap_or(horizon);
    let range = MissingRange::new(floor_hour(range_start), floor_hour(range_end));

    (!range.is_empty()).then_some(range)
}

/// Hours in [start, end) with no entry in `existing`, merged into ranges
///
/// Timestamps outside the range are ignored. Only non-empty ranges are
/// returned.
pub fn missing_ranges(
    existing: &[DateTime<Utc>],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<MissingRange> {
    let start = floor_hour(start);
    let end = floor_hour(end);
    if end <= start {
        return Vec::new();
    }

    let present: BTreeSet<DateTime<Utc>> = existing.iter().map(|ts| floor_hour(*ts)).collect();

    let mut ranges = Vec::new();
    let mut gap_start: Option<DateTime<Utc>> = None;
    let mut cursor = start;

    while cursor < end {
        if present.contains(&cursor) {
            if let Some(open) = gap_start.take() {
                ranges.push(MissingRange::new(open, cursor));
            }
        } else if gap_start.is_none() {
            gap_start = Some(cursor);
        }
        cursor += Duration::hours(1);
    }

    if let Some(open) = gap_start {
        ranges.push(MissingRange::new(open, end));
    }

    ranges
}

/// Split a range into consecutive windows of at most `window_hours`
pub fn split_windows(range: &MissingRange, window_hours: i64) -> Vec<MissingRange> {
    let step = Duration::hours(window_hours.max(1));
    let mut windows = Vec::new();
    let mut cursor = range.start;

    while cursor < range.end {
        let window_end = (cursor + step).min(range.end);
        windows.push(MissingRange::new(cursor, window_end));
        cursor = window_end;
    }

    windows
}
