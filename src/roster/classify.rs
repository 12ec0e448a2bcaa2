use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDateTime;

use crate::roster::model::TimeRecord;
use crate::roster::resolve::{epoch_minutes, resolve_for_display};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// No scheduled instant; the entry is up right now.
    Available,
    /// The resolved instant is strictly before now.
    Elapsed,
    /// The single soonest future instant in the collection.
    UpcomingNext,
    /// A future instant that is not the nearest one.
    Scheduled,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            RecordStatus::Available => "available",
            RecordStatus::Elapsed => "elapsed",
            RecordStatus::UpcomingNext => "upcoming-next",
            RecordStatus::Scheduled => "scheduled",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    /// Storage indices in display order: available entries first, then
    /// ascending resolved instant.
    pub order: Vec<usize>,
    /// Status per storage index.
    pub statuses: Vec<RecordStatus>,
}

/// Pure function of the collection and one `now` sample. Bare clocks are
/// resolved locally for comparison; records are never mutated, and calling
/// again with a later `now` may move entries between statuses.
pub fn classify(records: &[TimeRecord], now: NaiveDateTime) -> Classification {
    let now_minutes = epoch_minutes(now);
    let resolved: Vec<Option<i64>> = records
        .iter()
        .map(|record| resolve_for_display(&record.time, now).map(epoch_minutes))
        .collect();

    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| match (resolved[a], resolved[b]) {
        // Stable sort keeps the manual arrangement inside the available group.
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(ma), Some(mb)) => ma.cmp(&mb).then_with(|| {
            records[a]
                .name
                .to_lowercase()
                .cmp(&records[b].name.to_lowercase())
        }),
    });

    // At most one record may be upcoming-next: smallest future instant,
    // earliest storage position on a tie.
    let upcoming = resolved
        .iter()
        .enumerate()
        .filter_map(|(index, minutes)| {
            minutes
                .filter(|&minutes| minutes >= now_minutes)
                .map(|minutes| (minutes, index))
        })
        .min()
        .map(|(_, index)| index);

    let statuses = (0..records.len())
        .map(|index| match resolved[index] {
            None => RecordStatus::Available,
            Some(minutes) if minutes < now_minutes => RecordStatus::Elapsed,
            Some(_) if upcoming == Some(index) => RecordStatus::UpcomingNext,
            Some(_) => RecordStatus::Scheduled,
        })
        .collect();

    Classification { order, statuses }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::json;

    use super::*;
    use crate::roster::model::normalize_records;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .expect("date")
            .and_hms_opt(h, mi, 0)
            .expect("time")
    }

    #[test]
    fn board_scenario_with_mixed_entries() {
        let records = normalize_records(&json!([
            ["Alice", "0800"],
            ["Bob", null],
            ["Carol", "2000"],
        ]));
        let result = classify(&records, at(2024, 1, 1, 8, 0));

        // Bob has no countdown and displays first; Alice at exactly now is
        // not elapsed and is the nearest future entry.
        assert_eq!(result.order, vec![1, 0, 2]);
        assert_eq!(result.statuses[0], RecordStatus::UpcomingNext);
        assert_eq!(result.statuses[1], RecordStatus::Available);
        assert_eq!(result.statuses[2], RecordStatus::Scheduled);
    }

    #[test]
    fn exactly_one_upcoming_next_among_future_records() {
        let records = normalize_records(&json!([
            ["a", "0900"],
            ["b", "0900"],
            ["c", "1100"],
            ["d", null],
        ]));
        let result = classify(&records, at(2024, 1, 1, 8, 0));
        let next_count = result
            .statuses
            .iter()
            .filter(|status| **status == RecordStatus::UpcomingNext)
            .count();
        assert_eq!(next_count, 1);
        // The tie at 09:00 goes to the earlier storage position.
        assert_eq!(result.statuses[0], RecordStatus::UpcomingNext);
        assert_eq!(result.statuses[1], RecordStatus::Scheduled);
    }

    #[test]
    fn available_records_always_sort_first() {
        let records = normalize_records(&json!([
            ["timed", "0001"],
            ["open-1", null],
            ["dated", "2024-01-01 0002"],
            ["open-2", null],
        ]));
        let result = classify(&records, at(2024, 1, 1, 0, 0));
        assert_eq!(&result.order[..2], &[1, 3]);
    }

    #[test]
    fn elapsed_is_strictly_before_now() {
        let records = normalize_records(&json!([
            ["past", "2024-01-01 0759"],
            ["exact", "2024-01-01 0800"],
        ]));
        let result = classify(&records, at(2024, 1, 1, 8, 0));
        assert_eq!(result.statuses[0], RecordStatus::Elapsed);
        assert_eq!(result.statuses[1], RecordStatus::UpcomingNext);
    }

    #[test]
    fn equal_instants_order_by_case_insensitive_name() {
        let records = normalize_records(&json!([
            ["zeta", "0900"],
            ["Alpha", "0900"],
            ["beta", "0900"],
        ]));
        let result = classify(&records, at(2024, 1, 1, 8, 0));
        assert_eq!(result.order, vec![1, 2, 0]);
    }

    #[test]
    fn bare_clocks_in_the_lookback_window_count_as_today() {
        // At 08:00, a bare 20:00 entry resolved for display lands later
        // today and is a future candidate, not an elapsed one.
        let records = normalize_records(&json!([["Carol", "2000"]]));
        let result = classify(&records, at(2024, 1, 1, 8, 0));
        assert_eq!(result.statuses[0], RecordStatus::UpcomingNext);
    }

    #[test]
    fn later_now_reshuffles_statuses() {
        let records = normalize_records(&json!([
            ["first", "2024-01-01 0900"],
            ["second", "2024-01-01 1100"],
        ]));

        let early = classify(&records, at(2024, 1, 1, 8, 0));
        assert_eq!(early.statuses[0], RecordStatus::UpcomingNext);
        assert_eq!(early.statuses[1], RecordStatus::Scheduled);

        let later = classify(&records, at(2024, 1, 1, 10, 0));
        assert_eq!(later.statuses[0], RecordStatus::Elapsed);
        assert_eq!(later.statuses[1], RecordStatus::UpcomingNext);
    }

    #[test]
    fn all_elapsed_collection_has_no_upcoming_next() {
        let records = normalize_records(&json!([
            ["a", "2024-01-01 0100"],
            ["b", "2024-01-01 0200"],
        ]));
        let result = classify(&records, at(2024, 1, 2, 23, 0));
        assert!(result
            .statuses
            .iter()
            .all(|status| *status == RecordStatus::Elapsed));
    }

    #[test]
    fn classification_does_not_mutate_records() {
        let records = normalize_records(&json!([["Alice", "0800"]]));
        let before = records.clone();
        let _ = classify(&records, at(2024, 1, 1, 9, 0));
        assert_eq!(records, before);
    }

    #[test]
    fn empty_collection_classifies_to_empty_outputs() {
        let result = classify(&[], at(2024, 1, 1, 0, 0));
        assert!(result.order.is_empty());
        assert!(result.statuses.is_empty());
    }
}
