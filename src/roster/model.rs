use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value, json};

use crate::roster::resolve::resolve_next_occurrence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime {
    hour: u32,
    minute: u32,
}

impl ClockTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour <= 23 && minute <= 59).then_some(Self { hour, minute })
    }

    pub fn from_digits(digits: &str) -> Option<Self> {
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let hour = digits[..2].parse().ok()?;
        let minute = digits[2..].parse().ok()?;
        Self::new(hour, minute)
    }

    pub fn hhmm(&self) -> String {
        format!("{:02}{:02}", self.hour, self.minute)
    }

    pub fn as_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AbsoluteInstant {
    pub date: NaiveDate,
    pub clock: ClockTime,
}

impl AbsoluteInstant {
    pub fn as_datetime(&self) -> NaiveDateTime {
        self.date.and_time(self.clock.as_naive_time())
    }

    pub fn wire(&self) -> String {
        format!("{} {}", self.date.format("%Y-%m-%d"), self.clock.hhmm())
    }

    fn parse(input: &str) -> Option<Self> {
        let (date_part, clock_part) = input.split_once(' ')?;
        if date_part.len() != 10 || clock_part.len() != 4 {
            return None;
        }
        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
        let clock = ClockTime::from_digits(clock_part)?;
        Some(Self { date, clock })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespawnTime {
    #[default]
    None,
    Clock(ClockTime),
    Absolute(AbsoluteInstant),
}

impl RespawnTime {
    /// Unify a raw time value from the persisted file. Anything that is not
    /// a valid bare clock ("HHmm") or dated time ("YYYY-MM-DD HHmm") string
    /// degrades to `None` rather than erroring.
    pub fn unify(raw: Option<&Value>) -> Self {
        let Some(Value::String(text)) = raw else {
            return RespawnTime::None;
        };
        let trimmed = text.trim();
        if let Some(clock) = ClockTime::from_digits(trimmed) {
            return RespawnTime::Clock(clock);
        }
        if let Some(at) = AbsoluteInstant::parse(trimmed) {
            return RespawnTime::Absolute(at);
        }
        RespawnTime::None
    }

    pub fn to_value(&self) -> Value {
        match self {
            RespawnTime::None => Value::Null,
            RespawnTime::Clock(clock) => Value::String(clock.hhmm()),
            RespawnTime::Absolute(at) => Value::String(at.wire()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimeRecord {
    pub name: String,
    pub time: RespawnTime,
}

impl TimeRecord {
    pub fn new(name: impl Into<String>, time: RespawnTime) -> Self {
        Self {
            name: name.into(),
            time,
        }
    }

    pub fn blank() -> Self {
        Self::default()
    }
}

/// One record per input element, in input order; a non-array top level
/// yields an empty list. This function never fails.
pub fn normalize_records(raw: &Value) -> Vec<TimeRecord> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items.iter().map(normalize_entry).collect()
}

fn normalize_entry(item: &Value) -> TimeRecord {
    match item {
        Value::Array(pair) => TimeRecord {
            name: coerce_name(pair.first()),
            time: RespawnTime::unify(pair.get(1)),
        },
        Value::String(name) => TimeRecord {
            name: name.clone(),
            time: RespawnTime::None,
        },
        Value::Object(map) => TimeRecord {
            name: coerce_name(first_present(map, &["名字", "name"])),
            time: RespawnTime::unify(first_present(map, &["時間", "time"])),
        },
        _ => TimeRecord::blank(),
    }
}

fn coerce_name(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => String::new(),
    }
}

fn first_present<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find(|value| !value.is_null())
}

pub fn serialize_records(records: &[TimeRecord]) -> Value {
    Value::Array(
        records
            .iter()
            .map(|record| json!([record.name, record.time.to_value()]))
            .collect(),
    )
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    records: Vec<TimeRecord>,
}

impl Roster {
    pub fn from_raw(raw: &Value) -> Self {
        Self {
            records: normalize_records(raw),
        }
    }

    pub fn records(&self) -> &[TimeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn rename(&mut self, index: usize, name: &str) -> bool {
        match self.records.get_mut(index) {
            Some(record) => {
                record.name = name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn set_time(&mut self, index: usize, time: RespawnTime) -> bool {
        match self.records.get_mut(index) {
            Some(record) => {
                record.time = time;
                true
            }
            None => false,
        }
    }

    /// Insert a blank-or-named record after `index`, or append when `index`
    /// is `None` or past the end.
    pub fn insert_after(&mut self, index: Option<usize>, name: &str) -> usize {
        let record = TimeRecord::new(name, RespawnTime::None);
        let at = match index {
            Some(index) if index < self.records.len() => index + 1,
            _ => self.records.len(),
        };
        self.records.insert(at, record);
        at
    }

    pub fn remove_at(&mut self, index: usize) -> Option<TimeRecord> {
        if index >= self.records.len() {
            return None;
        }
        Some(self.records.remove(index))
    }

    pub fn move_record(&mut self, from: usize, to: usize) -> bool {
        if from >= self.records.len() || from == to {
            return from == to && from < self.records.len();
        }
        let record = self.records.remove(from);
        let to = to.min(self.records.len());
        self.records.insert(to, record);
        true
    }

    pub fn sort_by_name(&mut self) {
        self.records.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
    }

    /// Promote every bare clock to a dated time using one `now` sample for
    /// the whole pass. Already-dated times are left untouched.
    pub fn resolve_for_save(&mut self, now: NaiveDateTime) {
        for record in &mut self.records {
            if let RespawnTime::Clock(clock) = record.time {
                record.time = RespawnTime::Absolute(resolve_next_occurrence(clock, now));
            }
        }
    }

    pub fn to_value(&self) -> Value {
        serialize_records(&self.records)
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_value()).unwrap_or_else(|_| "[]".to_string())
    }
}

pub fn load_roster_file(path: &Path) -> Result<Roster> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read roster file {}", path.display()))?;
    parse_roster_text(&content)
}

pub fn parse_roster_text(content: &str) -> Result<Roster> {
    let raw = serde_json::from_str::<Value>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;
    Ok(Roster::from_raw(&raw))
}

pub fn save_roster_file(path: &Path, roster: &Roster) -> Result<()> {
    fs::write(path, roster.to_pretty_json())
        .with_context(|| format!("unable to write roster file {}", path.display()))?;
    Ok(())
}
