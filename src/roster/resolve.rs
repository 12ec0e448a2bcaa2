use chrono::{Days, NaiveDateTime};

use crate::roster::model::{AbsoluteInstant, ClockTime, RespawnTime};

/// How far in the past a bare clock time may fall while still meaning
/// "earlier today" rather than "tomorrow".
pub const LOOKBACK_MINUTES: i64 = 12 * 60;

/// Whole minutes since the epoch, floored. All date decisions and status
/// comparisons happen at this granularity.
pub(crate) fn epoch_minutes(at: NaiveDateTime) -> i64 {
    at.and_utc().timestamp().div_euclid(60)
}

/// Assign a calendar date to a bare clock time using the single `now`
/// sample passed in:
/// - the clock time is still ahead today (or is exactly now) -> today;
/// - it has passed, but by at most twelve hours -> still today;
/// - it has passed by more than twelve hours -> tomorrow.
pub fn resolve_next_occurrence(clock: ClockTime, now: NaiveDateTime) -> AbsoluteInstant {
    let today = now.date();
    let target = today.and_time(clock.as_naive_time());
    let delta = epoch_minutes(target) - epoch_minutes(now);

    let date = if delta >= -LOOKBACK_MINUTES {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    };
    AbsoluteInstant { date, clock }
}

/// Resolve a record time to a concrete instant for ordering and status
/// purposes only; the stored record is never rewritten here.
pub fn resolve_for_display(time: &RespawnTime, now: NaiveDateTime) -> Option<NaiveDateTime> {
    match time {
        RespawnTime::None => None,
        RespawnTime::Clock(clock) => Some(resolve_next_occurrence(*clock, now).as_datetime()),
        RespawnTime::Absolute(at) => Some(at.as_datetime()),
    }
}
