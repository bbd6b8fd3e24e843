//! Daily acquisition slots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, LocalResult, NaiveDate, TimeZone};
use serde::Deserialize;

use crate::error::ClockError;

/// Time of day at which an acquisition is due
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ScheduleSlot {
    pub hour: u32,
    pub minute: u32,
}

impl ScheduleSlot {
    /// Create a slot, `None` if the time of day is invalid
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// Resolve this slot on `date` in `tz`
    ///
    /// An ambiguous local time (clocks going back) resolves to the earlier
    /// instant; a non-existent one (clocks going forward) is an error.
    pub fn on<Tz: TimeZone>(&self, date: NaiveDate, tz: &Tz) -> Result<DateTime<Tz>, ClockError> {
        let invalid = || ClockError::InvalidSlot {
            hour: self.hour,
            minute: self.minute,
            date: date.to_string(),
        };
        let naive = date.and_hms_opt(self.hour, self.minute, 0).ok_or_else(invalid)?;
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => Ok(t),
            LocalResult::Ambiguous(earliest, _) => Ok(earliest),
            LocalResult::None => Err(invalid()),
        }
    }
}

impl FromStr for ScheduleSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("slot '{}' is not HH:MM", s))?;
        let hour = h.parse().map_err(|_| format!("invalid hour in slot '{}'", s))?;
        let minute = m.parse().map_err(|_| format!("invalid minute in slot '{}'", s))?;
        ScheduleSlot::new(hour, minute).ok_or_else(|| format!("slot '{}' is not a time of day", s))
    }
}

impl TryFrom<String> for ScheduleSlot {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ScheduleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Ordered slots covering one day
///
/// Duplicates are rejected when the configuration is validated, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTable {
    slots: Vec<ScheduleSlot>,
}

impl ScheduleTable {
    /// Build a table from slots in any order
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::EmptySchedule`] if `slots` is empty
    pub fn new(mut slots: Vec<ScheduleSlot>) -> Result<Self, ClockError> {
        if slots.is_empty() {
            return Err(ClockError::EmptySchedule);
        }
        slots.sort();
        Ok(Self { slots })
    }

    /// Slots in time-of-day order
    pub fn slots(&self) -> &[ScheduleSlot] {
        &self.slots
    }

    /// First slot strictly after `now`, or the first slot of the next day
    pub fn next_due<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<DateTime<Tz>, ClockError> {
        let tz = now.timezone();
        let today = now.date_naive();

        for slot in &self.slots {
            let due = slot.on(today, &tz)?;
            if due > *now {
                return Ok(due);
            }
        }

        let tomorrow = today.succ_opt().ok_or_else(|| ClockError::InvalidSlot {
            hour: self.slots[0].hour,
            minute: self.slots[0].minute,
            date: today.to_string(),
        })?;
        self.slots[0].on(tomorrow, &tz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn slot(h: u32, m: u32) -> ScheduleSlot {
        ScheduleSlot::new(h, m).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_slot() {
        assert_eq!("07:30".parse::<ScheduleSlot>(), Ok(slot(7, 30)));
        assert_eq!(" 0:05 ".parse::<ScheduleSlot>(), Ok(slot(0, 5)));
        assert!("24:00".parse::<ScheduleSlot>().is_err());
        assert!("12:60".parse::<ScheduleSlot>().is_err());
        assert!("noon".parse::<ScheduleSlot>().is_err());
        assert_eq!(slot(7, 5).to_string(), "07:05");
    }

    #[test]
    fn test_next_slot_same_day() {
        let table = ScheduleTable::new(vec![slot(0, 0), slot(12, 0)]).unwrap();
        let due = table.next_due(&utc(2025, 3, 10, 11, 0)).unwrap();
        assert_eq!(due, utc(2025, 3, 10, 12, 0));
    }

    #[test]
    fn test_next_slot_wraps_to_tomorrow() {
        let table = ScheduleTable::new(vec![slot(0, 0), slot(12, 0)]).unwrap();
        let due = table.next_due(&utc(2025, 3, 10, 23, 30)).unwrap();
        assert_eq!(due, utc(2025, 3, 11, 0, 0));
    }

    #[test]
    fn test_slot_equal_to_now_is_not_due() {
        let table = ScheduleTable::new(vec![slot(0, 0), slot(12, 0)]).unwrap();
        let due = table.next_due(&utc(2025, 3, 10, 12, 0)).unwrap();
        assert_eq!(due, utc(2025, 3, 11, 0, 0));
    }

    #[test]
    fn test_wrap_across_month_end() {
        let table = ScheduleTable::new(vec![slot(6, 0)]).unwrap();
        let due = table.next_due(&utc(2024, 2, 29, 7, 0)).unwrap();
        assert_eq!(due, utc(2024, 3, 1, 6, 0));
    }

    #[test]
    fn test_unsorted_input_is_ordered() {
        let table = ScheduleTable::new(vec![slot(18, 0), slot(6, 0), slot(12, 0)]).unwrap();
        assert_eq!(table.slots(), &[slot(6, 0), slot(12, 0), slot(18, 0)]);
        let due = table.next_due(&utc(2025, 1, 1, 7, 0)).unwrap();
        assert_eq!(due, utc(2025, 1, 1, 12, 0));
    }

    #[test]
    fn test_empty_schedule() {
        assert_eq!(ScheduleTable::new(Vec::new()), Err(ClockError::EmptySchedule));
    }

    #[test]
    fn test_local_offset_is_respected() {
        let tz = FixedOffset::east_opt(3 * 3600).unwrap();
        let table = ScheduleTable::new(vec![slot(9, 0)]).unwrap();
        let now = tz.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let due = table.next_due(&now).unwrap();
        assert_eq!(due.with_timezone(&Utc), utc(2025, 6, 1, 6, 0));
    }
}
