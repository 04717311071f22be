//! Weekly availability windows.
//!
//! A schedule is a list of `{ "<day>": "<low>-<high>" }` entries. Day `*`
//! matches every day, `0`..`6` name Sunday..Saturday. Hour bounds are
//! inclusive, so `"9-17"` covers 09:00 up to 17:59.
//!
//! Window lookups overlay every entry onto a 168-slot week and scan it as a
//! circular buffer starting at the slot of the reference instant.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::io::{atomic_write, read_optional};

pub const HOURS_PER_DAY: usize = 24;
pub const DAYS_PER_WEEK: usize = 7;
pub const HOURS_PER_WEEK: usize = HOURS_PER_DAY * DAYS_PER_WEEK;

const SECS_PER_HOUR: u64 = 3600;

/// Offset reported as the end of a window that never closes within one
/// full scan of the week.
pub const SCAN_HORIZON: Duration = Duration::from_secs(HOURS_PER_WEEK as u64 * SECS_PER_HOUR);

pub const UPDATE_SCHEDULE: &str = "update_schedule";
pub const PRIORITY_UPDATE_SCHEDULE: &str = "priority_update_schedule";
pub const DOWNLOAD_SCHEDULE: &str = "download_schedule";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule has no entries")]
    Empty,

    #[error("entry must have exactly one day key, found {0}")]
    MalformedEntry(usize),

    #[error("invalid day '{0}': expected '*' or 0-6")]
    InvalidDay(String),

    #[error("invalid hours '{0}': expected H or H-H with H in 0-23")]
    InvalidHours(String),

    #[error("hour range {low}-{high} is reversed")]
    ReversedRange { low: u8, high: u8 },
}

// ---------------------------------------------------------------------------
// Day
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Day {
    /// `*` — every day of the week.
    Every,
    /// `0` (Sunday) through `6` (Saturday).
    Weekday(u8),
}

impl Day {
    pub fn parse(token: &str) -> Result<Self, ScheduleError> {
        let token = token.trim();
        if token == "*" {
            return Ok(Self::Every);
        }
        match token.parse::<u8>() {
            Ok(d) if (d as usize) < DAYS_PER_WEEK => Ok(Self::Weekday(d)),
            _ => Err(ScheduleError::InvalidDay(token.to_string())),
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every => f.write_str("*"),
            Self::Weekday(d) => write!(f, "{d}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub day: Day,
    pub low: u8,
    pub high: u8,
}

impl ScheduleEntry {
    /// Parse one `day` / `hours` token pair. Hours are `H` or `H-H`.
    pub fn parse(day: &str, hours: &str) -> Result<Self, ScheduleError> {
        let day = Day::parse(day)?;
        let invalid = || ScheduleError::InvalidHours(hours.to_string());
        let (low, high) = match hours.split_once('-') {
            Some((l, h)) => (parse_hour(l).ok_or_else(invalid)?, parse_hour(h).ok_or_else(invalid)?),
            None => {
                let h = parse_hour(hours).ok_or_else(invalid)?;
                (h, h)
            }
        };
        if low > high {
            return Err(ScheduleError::ReversedRange { low, high });
        }
        Ok(Self { day, low, high })
    }

    fn hours_token(&self) -> String {
        format!("{}-{}", self.low, self.high)
    }
}

fn parse_hour(token: &str) -> Option<u8> {
    token
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|h| (*h as usize) < HOURS_PER_DAY)
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Wire form of a schedule: a list of single-key maps.
type RawSchedule = Vec<BTreeMap<String, String>>;

/// A validated, non-empty schedule.
///
/// Deserialization fails on any invalid entry, so holding a `Schedule`
/// implies it passed [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSchedule", into = "RawSchedule")]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    pub fn new(entries: Vec<ScheduleEntry>) -> Result<Self, ScheduleError> {
        if entries.is_empty() {
            return Err(ScheduleError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }
}

impl TryFrom<RawSchedule> for Schedule {
    type Error = ScheduleError;

    fn try_from(raw: RawSchedule) -> Result<Self, Self::Error> {
        let entries = raw
            .iter()
            .map(|entry| {
                if entry.len() != 1 {
                    return Err(ScheduleError::MalformedEntry(entry.len()));
                }
                let (day, hours) = entry
                    .iter()
                    .next()
                    .ok_or(ScheduleError::MalformedEntry(0))?;
                ScheduleEntry::parse(day, hours)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(entries)
    }
}

impl From<Schedule> for RawSchedule {
    fn from(schedule: Schedule) -> Self {
        schedule
            .entries
            .iter()
            .map(|e| BTreeMap::from([(e.day.to_string(), e.hours_token())]))
            .collect()
    }
}

/// True if `value` is a non-empty list of well-formed entries.
///
/// Any parse failure counts as invalid; nothing is propagated.
pub fn validate(value: &serde_json::Value) -> bool {
    Schedule::deserialize(value).is_ok()
}

// ---------------------------------------------------------------------------
// Window computation
// ---------------------------------------------------------------------------

/// Offsets from a reference instant to the start and end of the next window.
///
/// `start == 0` means the reference instant is inside a window. Both zero
/// means there is no boundary at all (always open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Duration,
    pub end: Duration,
}

impl Window {
    pub const ALWAYS_OPEN: Window = Window {
        start: Duration::ZERO,
        end: Duration::ZERO,
    };

    pub fn is_always_open(&self) -> bool {
        *self == Self::ALWAYS_OPEN
    }

    pub fn is_open_now(&self) -> bool {
        self.start.is_zero()
    }
}

struct WeeklyAvailability([bool; HOURS_PER_WEEK]);

impl WeeklyAvailability {
    fn build(schedule: &Schedule) -> Self {
        let mut slots = [false; HOURS_PER_WEEK];
        for entry in schedule.entries() {
            let days = match entry.day {
                Day::Every => 0..DAYS_PER_WEEK,
                Day::Weekday(d) => d as usize..d as usize + 1,
            };
            for day in days {
                let base = day * HOURS_PER_DAY;
                slots[base + entry.low as usize..=base + entry.high as usize].fill(true);
            }
        }
        Self(slots)
    }

    fn is_open(&self, slot: usize) -> bool {
        self.0[slot % HOURS_PER_WEEK]
    }
}

/// Find the next availability window after `from`.
///
/// A missing schedule degrades to [`Window::ALWAYS_OPEN`] so that an
/// unconfigured device is never blocked.
pub fn next_window(from: NaiveDateTime, schedule: Option<&Schedule>) -> Window {
    let Some(schedule) = schedule else {
        return Window::ALWAYS_OPEN;
    };
    let week = WeeklyAvailability::build(schedule);

    let origin = from.weekday().num_days_from_sunday() as usize * HOURS_PER_DAY
        + from.hour() as usize;
    let top_of_hour = from
        .date()
        .and_time(NaiveTime::from_hms_opt(from.hour(), 0, 0).unwrap_or(NaiveTime::MIN));
    let offset = |w: usize| {
        (top_of_hour + chrono::Duration::hours(w as i64) - from)
            .to_std()
            .unwrap_or_default()
    };

    let mut start = week.is_open(origin).then_some(0usize);
    let mut end = None;
    for w in 0..HOURS_PER_WEEK {
        let open = week.is_open(origin + w);
        match (start, end) {
            (None, _) if open => start = Some(w),
            (Some(_), None) if !open => end = Some(w),
            _ => {}
        }
    }

    match (start, end) {
        (Some(0), Some(e)) => Window {
            start: Duration::ZERO,
            end: offset(e),
        },
        (Some(s), Some(e)) => Window {
            start: offset(s),
            end: offset(e),
        },
        (Some(s), None) if s > 0 => Window {
            start: offset(s),
            end: SCAN_HORIZON,
        },
        _ => Window::ALWAYS_OPEN,
    }
}

// ---------------------------------------------------------------------------
// ScheduleStore
// ---------------------------------------------------------------------------

/// Persisted schedules, one `<name>.conf` JSON document per schedule.
///
/// Documents have the shape `{ "<name>": [ { "<day>": "<low>-<high>" } ] }`
/// and are replaced whole on every save.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    dir: PathBuf,
}

impl ScheduleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.conf"))
    }

    /// Load a schedule. Missing or invalid documents yield `None`.
    pub fn load(&self, name: &str) -> Option<Schedule> {
        match self.try_load(name) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(path = %self.path(name).display(), "failed to load schedule: {e}");
                None
            }
        }
    }

    fn try_load(&self, name: &str) -> crate::Result<Option<Schedule>> {
        let Some(text) = read_optional(&self.path(name))? else {
            return Ok(None);
        };
        let doc: BTreeMap<String, serde_json::Value> = serde_json::from_str(&text)?;
        match doc.get(name) {
            Some(value) => Ok(Some(Schedule::deserialize(value)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, name: &str, schedule: &Schedule) -> crate::Result<()> {
        let doc = BTreeMap::from([(name, schedule)]);
        let mut text = serde_json::to_string_pretty(&doc)?;
        text.push('\n');
        atomic_write(&self.path(name), text.as_bytes())
    }

    /// Save several schedules as one change. When a write fails, documents
    /// already written go back to their previous contents.
    pub fn save_all(&self, schedules: &[(&str, &Schedule)]) -> crate::Result<()> {
        let mut written: Vec<(&str, Option<String>)> = Vec::new();
        for &(name, schedule) in schedules {
            let saved = read_optional(&self.path(name)).and_then(|previous| {
                self.save(name, schedule)?;
                Ok(previous)
            });
            match saved {
                Ok(previous) => written.push((name, previous)),
                Err(e) => {
                    self.restore(&written);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn restore(&self, written: &[(&str, Option<String>)]) {
        for (name, previous) in written.iter().rev() {
            let path = self.path(name);
            let restored = match previous {
                Some(text) => atomic_write(&path, text.as_bytes()),
                None => std::fs::remove_file(&path).map_err(crate::error::IgupdError::from),
            };
            if let Err(e) = restored {
                tracing::warn!(path = %path.display(), "failed to roll back schedule: {e}");
            }
        }
    }
}
